use crate::output::{print_json, print_table};
use crate::workspace::Workspace;
use anyhow::Context;
use clap::Subcommand;
use feedmgr_core::{
    authz::CallerContext,
    properties::locate_template,
    provision::FeedProvisioner,
    store::{MetadataAccess, ReadTxExt},
    types::Template,
};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum TemplateSubcommand {
    /// Register (or replace) a template from a YAML file
    Add { file: PathBuf },
    /// List registered templates
    List,
    /// Show one template by id or name
    Show { template: String },
}

pub fn run(
    root: &Path,
    caller: &CallerContext,
    subcmd: TemplateSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    match subcmd {
        TemplateSubcommand::Add { file } => add(&ws, caller, &file, json),
        TemplateSubcommand::List => list(&ws, json),
        TemplateSubcommand::Show { template } => show(&ws, &template, json),
    }
}

fn add(ws: &Workspace, caller: &CallerContext, file: &Path, json: bool) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let template: Template = serde_yaml::from_str(&data)
        .with_context(|| format!("invalid template in {}", file.display()))?;

    let engine = ws.engine()?;
    let access = ws.access();
    let decryptor = ws.decryptor();
    FeedProvisioner::new(&ws.store, &engine, &access, decryptor.as_ref())
        .register_template(caller, &template)?;

    if json {
        print_json(&serde_json::json!({ "id": template.id, "name": template.name }))?;
    } else {
        println!("Registered template '{}' ({})", template.name, template.id);
    }
    Ok(())
}

fn list(ws: &Workspace, json: bool) -> anyhow::Result<()> {
    let templates = ws.store.read(|tx| tx.templates())?;
    if json {
        return print_json(&templates);
    }
    if templates.is_empty() {
        println!("No templates registered.");
        return Ok(());
    }
    let rows = templates
        .iter()
        .map(|t| {
            vec![
                t.id.clone(),
                t.name.clone(),
                t.flow_template_id.clone(),
                t.properties.len().to_string(),
                if t.reusable { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "FLOW TEMPLATE", "PROPS", "REUSABLE"], rows);
    Ok(())
}

fn show(ws: &Workspace, template: &str, json: bool) -> anyhow::Result<()> {
    let t = ws
        .store
        .read(|tx| locate_template(tx, Some(template), Some(template)))?;
    if json {
        return print_json(&t);
    }
    println!("{} ({})", t.name, t.id);
    println!("flow template: {}", t.flow_template_id);
    if t.reusable {
        println!("reusable: yes");
    }
    for c in &t.connections {
        println!("connects: {} -> {}", c.feed_output_port, c.reusable_input_port);
    }
    let rows = t
        .properties
        .iter()
        .map(|p| {
            let value = if p.sensitive { "******" } else { p.value_str() };
            vec![
                p.processor_name.clone(),
                p.name.clone(),
                value.to_string(),
                if p.input_port { "input" } else { "" }.to_string(),
            ]
        })
        .collect();
    print_table(&["PROCESSOR", "PROPERTY", "VALUE", ""], rows);
    Ok(())
}
