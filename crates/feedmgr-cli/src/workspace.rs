use anyhow::{bail, Context};
use feedmgr_core::{
    authz::PolicyAccessController,
    config::Config,
    engine::HttpFlowEngine,
    paths,
    secrets::{self, AgeDecryptor, NoDecryptor, SensitiveValueDecryptor},
    store::RedbStore,
};
use std::path::Path;
use std::time::Duration;

/// An initialized `.feedmgr/` workspace: config plus open metadata store.
pub struct Workspace {
    pub config: Config,
    pub store: RedbStore,
}

impl Workspace {
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        if !paths::feedmgr_dir(root).is_dir() {
            bail!(
                "no {} in {}; run `feedmgr init` first",
                paths::FEEDMGR_DIR,
                root.display()
            );
        }
        let config = Config::load(root).context("failed to load config.yaml")?;
        let store = RedbStore::open(&paths::metadata_db_path(root))
            .context("failed to open metadata store")?;
        Ok(Self { config, store })
    }

    pub fn engine(&self) -> anyhow::Result<HttpFlowEngine> {
        let engine = &self.config.engine;
        HttpFlowEngine::new(&engine.url, Duration::from_secs(engine.timeout_secs))
            .context("failed to build flow engine client")
    }

    pub fn access(&self) -> PolicyAccessController {
        PolicyAccessController::new(self.config.policy.clone())
    }

    pub fn decryptor(&self) -> Box<dyn SensitiveValueDecryptor> {
        let identity = self
            .config
            .secrets
            .identity
            .clone()
            .or_else(secrets::default_identity);
        match identity {
            Some(identity) => Box::new(AgeDecryptor::new(&identity)),
            None => Box::new(NoDecryptor),
        }
    }
}
