use crate::output::{join_or_dash, print_json, print_table};
use crate::workspace::Workspace;
use anyhow::bail;
use clap::Subcommand;
use feedmgr_core::{
    access::{AccessControlRegistry, AccessScope},
    authz::CallerContext,
    store::{MetadataAccess, ReadTxExt},
    types::{FeedId, Principal},
};
use std::collections::BTreeSet;
use std::path::Path;

/// `--feed <ID>` or `--all-feeds`, exactly one.
fn parse_scope(feed: Option<String>, all_feeds: bool) -> anyhow::Result<AccessScope> {
    match (feed, all_feeds) {
        (Some(id), false) => Ok(AccessScope::Feed(FeedId::new(id))),
        (None, true) => Ok(AccessScope::AllFeeds),
        _ => bail!("pass --feed <ID> or --all-feeds"),
    }
}

#[derive(Subcommand)]
pub enum AccessSubcommand {
    /// Add principals to a visible set
    Grant {
        /// A single feed id
        #[arg(long, conflicts_with = "all_feeds")]
        feed: Option<String>,
        /// The set that can view every feed
        #[arg(long)]
        all_feeds: bool,
        #[arg(required = true)]
        principals: Vec<String>,
    },
    /// Replace a feed's visible set with exactly these principals
    GrantOnly {
        feed: String,
        principals: Vec<String>,
    },
    /// Remove principals from a visible set
    Revoke {
        /// A single feed id
        #[arg(long, conflicts_with = "all_feeds")]
        feed: Option<String>,
        /// The set that can view every feed
        #[arg(long)]
        all_feeds: bool,
        #[arg(required = true)]
        principals: Vec<String>,
    },
    /// Remove principals from every visible set
    RevokeAll {
        #[arg(required = true)]
        principals: Vec<String>,
    },
    /// Clear a feed's visible set
    Clear { feed: String },
    /// Show a visible set, or every set when no scope is given
    List {
        #[arg(long, conflicts_with = "all_feeds")]
        feed: Option<String>,
        #[arg(long)]
        all_feeds: bool,
    },
    /// Whether the caller can view a feed
    Check { feed: String },
}

fn principal_set(names: &[String]) -> BTreeSet<Principal> {
    names.iter().map(|n| Principal::new(n.as_str())).collect()
}

pub fn run(
    root: &Path,
    caller: &CallerContext,
    subcmd: AccessSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let registry = AccessControlRegistry::new(&ws.store);

    match subcmd {
        AccessSubcommand::Grant {
            feed,
            all_feeds,
            principals,
        } => {
            let set = principal_set(&principals);
            let scope = parse_scope(feed, all_feeds)?;
            match &scope {
                AccessScope::Feed(id) => registry.grant_access(id, &set)?,
                AccessScope::AllFeeds => registry.grant_all_feeds(&set)?,
            }
            show_set(&ws, &scope, json)
        }
        AccessSubcommand::GrantOnly { feed, principals } => {
            let id = FeedId::new(feed);
            registry.grant_access_only(&id, &principal_set(&principals))?;
            show_set(&ws, &AccessScope::Feed(id), json)
        }
        AccessSubcommand::Revoke {
            feed,
            all_feeds,
            principals,
        } => {
            let set = principal_set(&principals);
            let scope = parse_scope(feed, all_feeds)?;
            match &scope {
                AccessScope::Feed(id) => registry.revoke_access(id, &set)?,
                AccessScope::AllFeeds => registry.revoke_all_feeds(&set)?,
            }
            show_set(&ws, &scope, json)
        }
        AccessSubcommand::RevokeAll { principals } => {
            registry.revoke_all_access(&principal_set(&principals))?;
            list_all(&ws, json)
        }
        AccessSubcommand::Clear { feed } => {
            let id = FeedId::new(feed);
            registry.revoke_all_feed_access(&id)?;
            show_set(&ws, &AccessScope::Feed(id), json)
        }
        AccessSubcommand::List { feed, all_feeds } => {
            if feed.is_none() && !all_feeds {
                return list_all(&ws, json);
            }
            show_set(&ws, &parse_scope(feed, all_feeds)?, json)
        }
        AccessSubcommand::Check { feed } => {
            let id = FeedId::new(feed);
            let allowed = registry.can_view(caller, &id)?;
            if json {
                print_json(&serde_json::json!({
                    "feed": id,
                    "user": caller.user,
                    "can_view": allowed,
                }))?;
            } else if allowed {
                println!("{} can view feed {id}", caller.user);
            } else {
                println!("{} cannot view feed {id}", caller.user);
            }
            Ok(())
        }
    }
}

fn show_set(ws: &Workspace, scope: &AccessScope, json: bool) -> anyhow::Result<()> {
    let set = ws.store.read(|tx| tx.principals(scope))?;
    if json {
        print_json(&serde_json::json!({
            "scope": scope.to_string(),
            "principals": set,
        }))
    } else {
        println!("{scope}: {}", join_or_dash(&set));
        Ok(())
    }
}

fn list_all(ws: &Workspace, json: bool) -> anyhow::Result<()> {
    let entries = ws.store.read(|tx| tx.acl_entries())?;
    if json {
        let out: Vec<_> = entries
            .iter()
            .map(|(scope, set)| serde_json::json!({ "scope": scope.to_string(), "principals": set }))
            .collect();
        return print_json(&out);
    }
    if entries.is_empty() {
        println!("No access entries.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|(scope, set)| vec![scope.to_string(), join_or_dash(set)])
        .collect();
    print_table(&["SCOPE", "PRINCIPALS"], rows);
    Ok(())
}
