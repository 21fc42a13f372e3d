use thiserror::Error;

use cs_core::CoreError;

/// Conduit dispatch failures. Non-fatal by default: the
/// dispatcher logs and moves on to the next matching conduit; only an SPC
/// exchange that surfaces `CancelledByDevice`/`LostConnection` escalates.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("I/O error talking to conduit: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn conduit process: {0}")]
    Spawn(String),
    #[error("conduit produced a malformed SPC request: {0}")]
    MalformedSpc(String),
    #[error("conduit header line exceeds limits: {0:?}")]
    BadHeader(String),
    #[error("device error while mediating SPC: {0}")]
    Device(#[from] cs_commander::CommanderError),
}

impl From<DispatcherError> for CoreError {
    fn from(e: DispatcherError) -> Self {
        CoreError::Dispatcher(e.to_string())
    }
}
