use crate::config::ConfigError;

/// Failures reported to the caller. Network trouble never shows up here;
/// it surfaces as EVASIVE, SILENT and EXIT events instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node is not started")]
    NotStarted,
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    #[error("failed to bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("engine task has stopped")]
    EngineStopped,
}
