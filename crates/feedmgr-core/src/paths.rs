use crate::error::{FeedMgrError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const FEEDMGR_DIR: &str = ".feedmgr";
pub const CONFIG_FILE: &str = ".feedmgr/config.yaml";
pub const METADATA_DB: &str = ".feedmgr/metadata.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn feedmgr_dir(root: &Path) -> PathBuf {
    root.join(FEEDMGR_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn metadata_db_path(root: &Path) -> PathBuf {
    root.join(METADATA_DB)
}

// ---------------------------------------------------------------------------
// System name validation
// ---------------------------------------------------------------------------

static SYSTEM_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn system_name_re() -> &'static Regex {
    SYSTEM_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-]*$").unwrap())
}

/// Category and feed system names end up in `category.feed` qualified names,
/// so they may not contain dots or whitespace.
pub fn validate_system_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 || !system_name_re().is_match(name) {
        return Err(FeedMgrError::InvalidFeedName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_system_names() {
        for name in ["sales", "web_logs", "Orders-2024", "_tmp"] {
            validate_system_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_system_names() {
        for name in ["", "has.dot", "has space", "-leading"] {
            assert!(validate_system_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.feedmgr/config.yaml")
        );
        assert_eq!(
            metadata_db_path(root),
            PathBuf::from("/tmp/proj/.feedmgr/metadata.db")
        );
    }
}
