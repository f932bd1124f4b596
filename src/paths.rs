use std::path::PathBuf;

/// Data directory: `~/.local/share/herd/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("herd")
}

/// Default state directory holding one record per VM: `~/.local/share/herd/state/`
pub fn default_state_dir() -> PathBuf {
    data_dir().join("state")
}

/// Log file for mutating commands: `~/.local/share/herd/herd.log`
pub fn log_path() -> PathBuf {
    data_dir().join("herd.log")
}

/// Transient directory for generated guest files: `~/.cache/herd/staging/`
pub fn staging_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("herd")
        .join("staging")
}
