use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::ReclaimError;

/// Failures of the offline vacuum tooling.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No vacuum store at the given path.
    #[error("vacuum store not found: {0}")]
    MissingFile(PathBuf),
    /// A record vacuum should already have processed is still there.
    #[error("vacuum check failed: {0}")]
    NotVacuumed(String),
    /// Failure inside the store or vacuum layer.
    #[error(transparent)]
    Core(#[from] ReclaimError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_file(path: impl AsRef<Path>) -> Self {
        AdminError::MissingFile(path.as_ref().to_path_buf())
    }
}
