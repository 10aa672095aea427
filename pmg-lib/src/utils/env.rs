/// Project name used for service identification in spans and storage paths.
pub const fn project_name() -> &'static str {
    "pmg"
}

/// Default data directory (event log, CA material) relative to the user's
/// home, with a cwd-relative fallback for odd environments.
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".pmg"))
        .unwrap_or_else(|| std::path::PathBuf::from(".pmg"))
}
