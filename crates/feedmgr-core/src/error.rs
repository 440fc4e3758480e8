use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedMgrError {
    #[error("permission denied: '{action}' on {scope}")]
    Authorization { action: String, scope: String },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("feed not found: {0}")]
    FeedNotFound(String),

    #[error("feed already exists: {0}")]
    DuplicateFeed(String),

    #[error("invalid feed name '{0}': must be non-empty and contain no '.' or whitespace")]
    InvalidFeedName(String),

    #[error("flow engine failed to materialize feed: {0}")]
    Build(String),

    #[error("failed to persist feed: {0}")]
    Persist(String),

    #[error("failed to roll back flow: {0}")]
    Rollback(String),

    #[error("metadata store error: {0}")]
    Storage(String),

    #[error("flow engine request failed: {0}")]
    Engine(String),

    #[error("failed to decrypt sensitive value: {0}")]
    Decrypt(String),

    #[error("age binary not found in PATH")]
    AgeNotInstalled,

    #[error("table registration: {0}")]
    TablePlan(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FeedMgrError {
    pub fn storage(e: impl std::fmt::Display) -> Self {
        FeedMgrError::Storage(e.to_string())
    }

    pub fn denied(action: impl std::fmt::Display, scope: impl std::fmt::Display) -> Self {
        FeedMgrError::Authorization {
            action: action.to_string(),
            scope: scope.to_string(),
        }
    }

    /// Which provisioning failure category this error belongs to, if any.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            FeedMgrError::Authorization { .. } => Some(FailureKind::Authorization),
            FeedMgrError::TemplateNotFound(_) => Some(FailureKind::TemplateResolution),
            FeedMgrError::FeedNotFound(_)
            | FeedMgrError::DuplicateFeed(_)
            | FeedMgrError::InvalidFeedName(_)
            | FeedMgrError::Decrypt(_)
            | FeedMgrError::AgeNotInstalled => Some(FailureKind::Rejected),
            FeedMgrError::Build(_) | FeedMgrError::Engine(_) => Some(FailureKind::Build),
            FeedMgrError::Persist(_) => Some(FailureKind::Persist),
            FeedMgrError::Rollback(_) => Some(FailureKind::Rollback),
            FeedMgrError::Storage(_) => Some(FailureKind::Storage),
            _ => None,
        }
    }
}

/// Failure categories reported on a provisioning outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authorization,
    TemplateResolution,
    /// The request itself was invalid (unknown feed, duplicate name, bad secret).
    Rejected,
    Build,
    Persist,
    Rollback,
    Storage,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Authorization => "authorization",
            FailureKind::TemplateResolution => "template_resolution",
            FailureKind::Rejected => "rejected",
            FailureKind::Build => "build",
            FailureKind::Persist => "persist",
            FailureKind::Rollback => "rollback",
            FailureKind::Storage => "storage",
        };
        write!(f, "{s}")
    }
}

pub type Result<T> = std::result::Result<T, FeedMgrError>;
