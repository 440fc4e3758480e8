use feedmgr_core::paths::FEEDMGR_DIR;
use std::path::{Path, PathBuf};

/// Resolve the workspace root.
///
/// `--root` / `FEEDMGR_ROOT` wins; otherwise walk upward from the current
/// directory looking for `.feedmgr/`, falling back to the current directory.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_marker(&cwd).unwrap_or(cwd)
}

fn find_marker(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(FEEDMGR_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn finds_marker_in_ancestor() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(FEEDMGR_DIR)).unwrap();
        let deep = dir.path().join("feeds/sales");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(find_marker(&deep).as_deref(), Some(dir.path()));
    }

    #[test]
    fn no_marker_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(find_marker(dir.path()).is_none());
    }
}
