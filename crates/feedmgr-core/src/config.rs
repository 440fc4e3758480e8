use crate::authz::PermissionPolicy;
use crate::error::Result;
use crate::io;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_engine_url() -> String {
    "http://localhost:8079/flow-engine".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// SecretsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// age identity used to decrypt sensitive property values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Remove a feed's previous versioned graph once the new one is committed.
    #[serde(default = "default_remove_inactive")]
    pub remove_inactive_versioned_graphs: bool,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub policy: PermissionPolicy,
}

fn default_remove_inactive() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            remove_inactive_versioned_graphs: default_remove_inactive(),
            secrets: SecretsConfig::default(),
            policy: PermissionPolicy::default(),
        }
    }
}

impl Config {
    /// Load `.feedmgr/config.yaml`; a missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::config_path(root), data.as_bytes())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let url = self.engine.url.trim();
        if url.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "engine.url is empty".to_string(),
            });
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("engine.url '{url}' is not an http(s) URL"),
            });
        }

        if self.engine.timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "engine.timeout_secs is 0; requests will fail immediately".to_string(),
            });
        }

        if let Some(identity) = &self.secrets.identity {
            if !identity.exists() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "secrets.identity '{}' does not exist",
                        identity.display()
                    ),
                });
            }
        }

        let p = &self.policy;
        if p.admins.is_empty() && p.services.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "policy grants no service permissions; nobody can create feeds"
                    .to_string(),
            });
        }

        warnings
    }
}
