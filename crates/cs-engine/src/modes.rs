//! Install/backup/restore mode selection: the shape the
//! out-of-scope CLI would pick between. `BackupMode` is
//! fully implemented -- a backup run is nothing more than `SyncEngine::run`
//! against a fresh backup directory, which the Reconciler already handles
//! as FirstSync for every database. `InstallMode`/`RestoreMode` are
//! documented stubs: their internals (staging-directory layout, `.pdb`
//! restore ordering) are out of scope.

use cs_core::CoreError;
use cs_proto::Transport;

use crate::engine::{SyncEngine, SyncReport};

/// The coarse result the out-of-scope CLI would use to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Partial,
    Fatal,
    Unsupported,
}

/// A plain HotSync: reconcile every database against the configured
/// backup/archive directories.
pub struct BackupMode<'a> {
    pub engine: &'a SyncEngine,
}

impl<'a> BackupMode<'a> {
    pub fn new(engine: &'a SyncEngine) -> Self {
        BackupMode { engine }
    }

    /// Run the sync. A backup against an empty backup directory is exactly
    /// FirstSync for every database; no special casing is
    /// needed beyond what `SyncEngine::run` already does.
    pub fn run<T: Transport>(&self, transport: T) -> Result<SyncReport, CoreError> {
        self.engine.run(transport)
    }
}

/// Install staged `.prc`/`.pdb` files onto the device. Out of scope: the
/// staging directory layout and per-file install ordering are never
/// specified, so this reports `Outcome::Unsupported` rather than guessing a
/// behavior nothing constrains.
pub struct InstallMode;

impl InstallMode {
    pub fn run(&self) -> Outcome {
        Outcome::Unsupported
    }
}

/// Restore a full backup directory onto a wiped device. Out of scope for
/// the same reason as [`InstallMode`].
pub struct RestoreMode;

impl RestoreMode {
    pub fn run(&self) -> Outcome {
        Outcome::Unsupported
    }
}
