use thiserror::Error;

use cs_core::CoreError;
use cs_commander::CommanderError;
use cs_db::{ArchiveError, DbFileError};

/// The Reconciler's narrow error type; composes into [`CoreError`] at the
/// point the sync loop in `cs-engine` decides whether a per-database
/// failure is fatal or merely skippable.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Device(#[from] CommanderError),
    #[error(transparent)]
    LocalFile(#[from] DbFileError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("local database is not a record database")]
    NotARecordDatabase,
}

impl From<ReconcileError> for CoreError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Device(d) => d.into(),
            ReconcileError::LocalFile(f) => CoreError::Local(f.to_string()),
            ReconcileError::Archive(a) => CoreError::Local(a.to_string()),
            ReconcileError::NotARecordDatabase => CoreError::Local("local database is not a record database".into()),
        }
    }
}
