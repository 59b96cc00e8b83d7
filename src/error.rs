use thiserror::Error;

/// Fault tiers for one daemon run. Everything below `Storage` is absorbed at
/// the component boundary and logged; only a missing staging area (and config
/// or lock failures during startup) unwinds the whole run.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("storage backend unavailable: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("module skipped during scan: {0}")]
    Scan(String),

    #[error("sync failed for module '{module}': {reason}")]
    Sync { module: String, reason: String },

    #[error("mount failed for {target}: {reason}")]
    Mount { target: String, reason: String },

    #[error("stealth cleanup failed: {0}")]
    Stealth(String),
}
