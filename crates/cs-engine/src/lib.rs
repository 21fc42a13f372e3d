//! Thin orchestration layer that drives one end-to-end sync: the `SyncEngine` loop, plus
//! interface-level install/backup/restore mode selection.
//!
//! This crate has no protocol or reconciliation logic of its own -- it
//! composes `cs_proto`, `cs_commander`, `cs_sync`, and `cs_dispatch` behind
//! a single `[[bin]]`.

pub mod engine;
pub mod modes;

pub use engine::{DatabaseOutcome, Outcome, SyncConfig, SyncEngine, SyncReport};
pub use modes::{BackupMode, InstallMode, RestoreMode};
pub use modes::Outcome as ModeOutcome;
