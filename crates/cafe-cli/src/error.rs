use thiserror::Error;

/// Errors surfaced at the CLI boundary. Every variant maps to exit code 1;
/// invalid arguments never reach here — `clap` exits 2 on its own before a
/// command is dispatched.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Cellar(#[from] cafe_cellar::CellarError),
    #[error(transparent)]
    Scheduler(#[from] cafe_scheduler::SchedulerError),
    #[error(transparent)]
    Hash(#[from] cafe_hash::HashError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed config.ini: {0}")]
    Config(#[from] ini::Error),
    #[error("<cafdir> not found at {0}; run `caf init` first")]
    CellarMissing(camino::Utf8PathBuf),
    #[error("no remote named {0}")]
    RemoteNotFound(String),
    #[error("no queue named {0}")]
    QueueNotFound(String),
    #[error("no build has been stored yet")]
    NoBuild,
    #[error("{0} requires the external rsync/ssh remote-sync boundary, which this engine does not implement")]
    RemoteSyncUnsupported(&'static str),
}
