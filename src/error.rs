use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("store error: {0}")]
    Store(String),
}

/// Combines the outcomes of a multi-step teardown. The first failure wins;
/// later steps still run, but their errors are dropped once one is captured.
pub fn first_error(primary: Result<()>, secondary: Result<()>) -> Result<()> {
    match primary {
        Ok(()) => secondary,
        err => err,
    }
}
