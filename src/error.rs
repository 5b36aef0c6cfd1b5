use std::collections::HashMap;
use thiserror::Error;

use crate::backend::BackendError;

/// Unifying error taxonomy exposed at the crate boundary (spec §6/§7).
///
/// Submodules keep their own narrower `thiserror` enums for the failure
/// modes local to their storage concern; this type is what every public
/// operation ultimately returns.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("concurrent writer moved the branch ref")]
    Concurrency,

    #[error("merge conflict on {conflicting_keys:?}")]
    MergeConflict {
        conflicting_keys: Vec<String>,
        merge_errors: HashMap<String, String>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Storage(msg) => EngineError::Storage(msg),
        }
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Storage(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
