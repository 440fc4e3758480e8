use crate::output::print_json;
use crate::workspace::Workspace;
use anyhow::Context;
use feedmgr_core::{
    config::{Config, WarnLevel},
    io, paths,
    store::RedbStore,
    types::Principal,
};
use std::path::Path;

pub fn run(root: &Path, admin: Option<&str>, json: bool) -> anyhow::Result<()> {
    if !json {
        println!("Initializing feedmgr in: {}", root.display());
    }

    let mut config = Config::default();
    if let Some(admin) = admin {
        config.policy.admins.insert(Principal::new(admin));
    }
    let created_config = io::write_if_missing(
        &paths::config_path(root),
        serde_yaml::to_string(&config)?.as_bytes(),
    )
    .context("failed to write config.yaml")?;

    let db_path = paths::metadata_db_path(root);
    let created_db = !db_path.exists();
    RedbStore::open(&db_path).context("failed to create metadata store")?;

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config_created": created_config,
            "store_created": created_db,
        }))?;
    } else {
        let mark = |created| if created { "created:" } else { "exists: " };
        println!("  {} {}", mark(created_config), paths::CONFIG_FILE);
        println!("  {} {}", mark(created_db), paths::METADATA_DB);
    }
    Ok(())
}

/// Print config warnings; fail if any is an error.
pub fn check(root: &Path, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let warnings = ws.config.validate();
    if json {
        print_json(&warnings)?;
    } else if warnings.is_empty() {
        println!("config ok");
    } else {
        for w in &warnings {
            let tag = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("{tag}: {}", w.message);
        }
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config has errors");
    }
    Ok(())
}
