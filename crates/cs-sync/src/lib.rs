//! The Reconciler: first/slow/fast sync strategy selection,
//! the per-record three-way merge, and the archive-on-conflict writer.
//!
//! Narrow `Result`/`thiserror` types throughout, `tracing` spans around the
//! expensive operations, small pure functions kept separate from I/O so
//! they stay unit-testable without a live device.

mod device_ops;
mod error;
mod merge;
mod reconciler;
mod strategy;

pub use device_ops::DeviceOps;
pub use error::ReconcileError;
pub use merge::{classify, MergeAction};
pub use reconciler::{Reconciler, ReconcilerConfig, SyncOutcome};
pub use strategy::{choose_strategy, SyncStrategy};
