use cafe_hash::{Hash, HashError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cellar(#[from] cafe_cellar::CellarError),
    #[error(transparent)]
    Exec(#[from] cafe_exec::ExecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("task {0} has no stored definition")]
    MissingTask(Hash),
    #[error("traversal stopped after {0} consecutive execution failures")]
    TooManyConsecutiveErrors(usize),
}
