//! Unified error taxonomy.
//!
//! Every layer of the stack produces its own narrow error enum; each of
//! those composes into [`CoreError`] at the boundary it crosses, narrowing
//! transport- or protocol-specific errors into one crate-facing enum.

use thiserror::Error;

/// A device-reported DLP error code, translated out of the raw 16-bit wire
/// value by the Transactor/Commander layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceErrorKind {
    #[error("database or record not found")]
    NotFound,
    #[error("too many databases open")]
    TooManyOpen,
    #[error("database could not be opened")]
    CantOpen,
    #[error("database is read-only")]
    ReadOnly,
    #[error("database already exists")]
    Exists,
    #[error("database is open")]
    DbOpen,
    #[error("not enough space on device")]
    NotEnoughSpace,
    #[error("invalid parameter")]
    InvalidParam,
    /// The device user cancelled the sync (e.g. via the HotSync button)
    /// while a command was outstanding.
    #[error("cancelled by device user")]
    Cancelled,
    #[error("device reported error code {0}")]
    Generic(u16),
}

/// Wire status reserved for "sync cancelled" -- distinct from the ordinary
/// per-command error codes, checked before falling back to `Generic`.
const WIRE_CANCELLED: u16 = 13;

impl DeviceErrorKind {
    /// Translate a raw DLP status word into a [`DeviceErrorKind`].
    ///
    /// The device protocol reserves 0 for success; callers must not pass 0
    /// here (check for success before classifying the error).
    pub fn from_wire(code: u16) -> Self {
        match code {
            3 => Self::NotFound,
            4 => Self::TooManyOpen,
            5 => Self::CantOpen,
            8 => Self::ReadOnly,
            9 => Self::Exists,
            10 => Self::DbOpen,
            11 => Self::NotEnoughSpace,
            12 => Self::InvalidParam,
            WIRE_CANCELLED => Self::Cancelled,
            other => Self::Generic(other),
        }
    }
}

/// The unified error taxonomy. Every component-level error narrows into
/// one of these at the point it crosses a component boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad frame, CRC, header checksum, unresponsive peer, remote closed.
    #[error("link error: {0}")]
    Link(String),

    /// The device answered a command with a non-zero DLP error code.
    #[error("device error: {0}")]
    Device(#[from] DeviceErrorKind),

    /// The device user cancelled the sync (e.g. via the HotSync button).
    #[error("sync cancelled by device user")]
    CancelledByDevice,

    /// A local signal (e.g. Ctrl-C) aborted the sync.
    #[error("sync cancelled locally")]
    CancelledByUser,

    /// Transport timeout or EOF; fatal, end-of-sync is not attempted.
    #[error("lost connection to device")]
    LostConnection,

    /// A conduit refused to start, crashed, or spoke malformed SPC.
    #[error("conduit dispatch error: {0}")]
    Dispatcher(String),

    /// Local I/O, codec corruption, or resource exhaustion. Per-database
    /// recoverable: the caller skips that database and continues.
    #[error("local error: {0}")]
    Local(String),
}

impl CoreError {
    /// Whether this error must end the whole session (vs. being logged and
    /// skipped for the current database only): `CancelledByDevice` and
    /// `LostConnection` are always session-fatal; `CancelledByUser`
    /// likewise. Device/local/dispatcher errors are per-database unless
    /// the caller decides otherwise.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::CancelledByDevice | CoreError::CancelledByUser | CoreError::LostConnection
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_kind_maps_known_codes() {
        assert_eq!(DeviceErrorKind::from_wire(3), DeviceErrorKind::NotFound);
        assert_eq!(DeviceErrorKind::from_wire(9), DeviceErrorKind::Exists);
        assert_eq!(DeviceErrorKind::from_wire(13), DeviceErrorKind::Cancelled);
        assert_eq!(DeviceErrorKind::from_wire(999), DeviceErrorKind::Generic(999));
    }

    #[test]
    fn session_fatal_kinds() {
        assert!(CoreError::LostConnection.is_session_fatal());
        assert!(CoreError::CancelledByDevice.is_session_fatal());
        assert!(CoreError::CancelledByUser.is_session_fatal());
        assert!(!CoreError::Local("disk full".into()).is_session_fatal());
        assert!(!CoreError::Device(DeviceErrorKind::NotFound).is_session_fatal());
    }

    #[test]
    fn device_error_composes_into_core_error() {
        let err: CoreError = DeviceErrorKind::ReadOnly.into();
        assert_eq!(err.to_string(), "device error: database is read-only");
    }
}
