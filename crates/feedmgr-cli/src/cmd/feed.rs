use crate::output::{join_or_dash, print_json, print_table};
use crate::workspace::Workspace;
use anyhow::{bail, Context};
use clap::Subcommand;
use feedmgr_core::{
    authz::CallerContext,
    lookup::plan_table_registration,
    provision::{FeedProvisioner, FeedRequest, ProvisionOutcome},
    secrets::is_encrypted,
    store::{MetadataAccess, ReadTxExt},
    types::{Feed, FeedId},
    FeedMgrError,
};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum FeedSubcommand {
    /// Create or update a feed from a YAML request file
    Provision {
        file: PathBuf,
        /// Leave a feed saved with a deferred enable disabled
        #[arg(long)]
        no_enable: bool,
    },
    /// Start a feed's process graph
    Enable { feed: String },
    /// Stop a feed's process graph
    Disable { feed: String },
    /// Show one feed by id or `category.name`
    Show { feed: String },
    /// List feeds
    List {
        /// Only feeds in this category
        #[arg(long)]
        category: Option<String>,
    },
    /// Show which tables a feed registers
    Tables { feed: String },
}

pub fn run(
    root: &Path,
    caller: &CallerContext,
    subcmd: FeedSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    match subcmd {
        FeedSubcommand::Provision { file, no_enable } => {
            provision(&ws, caller, &file, !no_enable, json)
        }
        FeedSubcommand::Enable { feed } => set_enabled(&ws, caller, &feed, true, json),
        FeedSubcommand::Disable { feed } => set_enabled(&ws, caller, &feed, false, json),
        FeedSubcommand::Show { feed } => show(&ws, &feed, json),
        FeedSubcommand::List { category } => list(&ws, category.as_deref(), json),
        FeedSubcommand::Tables { feed } => tables(&ws, &feed, json),
    }
}

/// Look a feed up by id, then by `category.name`.
fn find(ws: &Workspace, feed: &str) -> anyhow::Result<Feed> {
    let found = ws.store.read(|tx| {
        if let Some(f) = tx.feed(&FeedId::new(feed))? {
            return Ok(Some(f));
        }
        match feed.split_once('.') {
            Some((category, name)) => tx.find_feed(category, name),
            None => Ok(None),
        }
    })?;
    found.ok_or_else(|| FeedMgrError::FeedNotFound(feed.to_string()).into())
}

fn provision(
    ws: &Workspace,
    caller: &CallerContext,
    file: &Path,
    enable: bool,
    json: bool,
) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let request: FeedRequest = serde_yaml::from_str(&data)
        .with_context(|| format!("invalid feed request in {}", file.display()))?;

    let engine = ws.engine()?;
    let access = ws.access();
    let decryptor = ws.decryptor();
    let provisioner = FeedProvisioner::new(&ws.store, &engine, &access, decryptor.as_ref())
        .remove_inactive_versioned_graphs(ws.config.remove_inactive_versioned_graphs);

    let mut outcome = provisioner.provision(caller, &request)?;

    if enable && outcome.enable_after_save {
        if let Some(feed) = &outcome.feed {
            match provisioner.enable_feed(caller, &feed.id) {
                Ok(enabled) => {
                    outcome.enable_after_save = false;
                    outcome.feed = Some(enabled);
                }
                Err(e) => outcome
                    .warnings
                    .push(format!("feed saved but could not be enabled: {e}")),
            }
        }
    }

    report(&outcome, json)?;
    if !outcome.success {
        bail!("provisioning {}.{} failed", request.category, request.name);
    }
    Ok(())
}

fn report(outcome: &ProvisionOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(outcome);
    }
    match (&outcome.feed, &outcome.failure) {
        (Some(feed), _) if outcome.success => {
            println!("Provisioned {} ({})", feed.qualified_name(), feed.id);
            println!("  state: {}", feed.state);
            if let Some(graph) = &feed.graph {
                println!("  graph: {graph}");
            }
            if outcome.enable_after_save {
                println!("  pending: enable after save");
            }
        }
        (_, Some(kind)) => println!("Provisioning failed ({kind})"),
        _ => println!("Provisioning failed"),
    }
    for e in &outcome.errors {
        println!("  error: {e}");
    }
    for w in &outcome.warnings {
        println!("  warning: {w}");
    }
    Ok(())
}

fn set_enabled(
    ws: &Workspace,
    caller: &CallerContext,
    feed: &str,
    enable: bool,
    json: bool,
) -> anyhow::Result<()> {
    let target = find(ws, feed)?;
    let engine = ws.engine()?;
    let access = ws.access();
    let decryptor = ws.decryptor();
    let provisioner = FeedProvisioner::new(&ws.store, &engine, &access, decryptor.as_ref());
    let updated = if enable {
        provisioner.enable_feed(caller, &target.id)?
    } else {
        provisioner.disable_feed(caller, &target.id)?
    };

    if json {
        print_json(&updated)?;
    } else {
        println!("{} is {}", updated.qualified_name(), updated.state);
    }
    Ok(())
}

fn show(ws: &Workspace, feed: &str, json: bool) -> anyhow::Result<()> {
    let f = find(ws, feed)?;
    if json {
        return print_json(&f);
    }
    println!("{} ({})", f.qualified_name(), f.id);
    println!("state:    {}", f.state);
    println!("template: {} ({})", f.template_name, f.template_id);
    println!("graph:    {}", join_or_dash(&f.graph));
    if let Some(desc) = &f.description {
        println!("about:    {desc}");
    }
    if let Some(s) = &f.schedule {
        println!("schedule: {} {}", s.strategy, s.period);
    }
    let rows = f
        .properties
        .iter()
        .map(|p| {
            let value = match p.value_str() {
                v if is_encrypted(v) => "<encrypted>",
                _ if p.sensitive => "******",
                v => v,
            };
            vec![p.processor_name.clone(), p.name.clone(), value.to_string()]
        })
        .collect();
    print_table(&["PROCESSOR", "PROPERTY", "VALUE"], rows);
    Ok(())
}

fn list(ws: &Workspace, category: Option<&str>, json: bool) -> anyhow::Result<()> {
    let feeds: Vec<Feed> = ws
        .store
        .read(|tx| tx.feeds())?
        .into_iter()
        .filter(|f| category.map_or(true, |c| f.category == c))
        .collect();
    if json {
        return print_json(&feeds);
    }
    if feeds.is_empty() {
        println!("No feeds.");
        return Ok(());
    }
    let rows = feeds
        .iter()
        .map(|f| {
            vec![
                f.id.to_string(),
                f.qualified_name(),
                f.state.to_string(),
                f.template_name.clone(),
                f.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "FEED", "STATE", "TEMPLATE", "UPDATED"], rows);
    Ok(())
}

fn tables(ws: &Workspace, feed: &str, json: bool) -> anyhow::Result<()> {
    let f = find(ws, feed)?;
    let plan = plan_table_registration(&f.category, &f.name, &f.properties)?;
    if json {
        return print_json(&plan);
    }
    for t in &plan.tables {
        println!("{}.{}_{t}", plan.category, plan.feed);
    }
    println!(
        "columns: {}",
        join_or_dash(plan.columns.iter().map(|c| format!("{} {}", c.name, c.data_type)))
    );
    if !plan.partitions.is_empty() {
        println!(
            "partitions: {}",
            join_or_dash(plan.partitions.iter().map(|c| c.name.as_str()))
        );
    }
    println!("target format: {}", plan.target_format);
    Ok(())
}
