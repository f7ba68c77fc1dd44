use std::path::{Path, PathBuf};

/// Resolve the log directory for a project.
///
/// Logs live under `.ocloop/logs/` next to the directory the batch was
/// started from. The directory is created lazily by the log writer.
pub fn resolve_log_dir(base: &Path) -> PathBuf {
    base.join(".ocloop").join("logs")
}

/// Path of the shared model selection store.
///
/// This is the same file OpenCode itself maintains, so recents and favorites
/// stay in sync between ocloop and interactive OpenCode use.
pub fn model_store_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".local")
            .join("state")
            .join("opencode")
            .join("model.json"),
    )
}
