//! Shared value types and error taxonomy for coldsync-rs.
//!
//! This crate has no I/O of its own; it is the vocabulary every other crate
//! in the workspace speaks: record/database value types, the
//! unified error taxonomy, and host identity (glossary).

pub mod cancel;
pub mod error;
pub mod host;
pub mod record;

pub use cancel::CancelFlag;
pub use error::{CoreError, CoreResult, DeviceErrorKind};
pub use host::HostIdentity;
pub use record::{DatabaseInfo, DbAttrFlags, PalmTimestamp, Record, RecordFlags, RecordState, Resource, MAX_RECORD_ID};
