//! The per-record three-way merge: a pure 4x4
//! case table keyed by (remote state, local state), kept free of any I/O
//! so it is exhaustively unit-testable on its own.

use cs_core::RecordState;

/// What [`crate::Reconciler`] must do to reconcile one record id, once its
/// remote and local [`RecordState`] have been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Neither side changed; nothing to do.
    NoOp,
    /// remote=ARCHIVE, local=ARCHIVE: archive one copy if the payloads are
    /// equal, else archive both; either way delete the record from both
    /// sides.
    ArchiveBothSidesDeleteBoth { payloads_equal: bool },
    /// Archive the remote payload, then delete from both sides.
    ArchiveRemoteDeleteBoth,
    /// Archive the remote payload, then upload the local payload
    /// overwriting the device's copy.
    ArchiveRemoteUploadLocal,
    /// Archive the local payload, then delete from both sides.
    ArchiveLocalDeleteBoth,
    /// Delete the record from both sides, no archival.
    DeleteBoth,
    /// Delete the device's copy, then upload the local payload.
    DeleteRemoteUploadLocal,
    /// Archive the local payload, then replace the local record's content
    /// with the remote payload.
    ArchiveLocalReplaceWithRemote,
    /// Drop the local record, then insert the remote payload as the local
    /// record's new content (remote wins, no archival: local had already
    /// been expunged).
    DeleteLocalInsertRemote,
    /// Both sides are dirty with identical payloads: clear sync flags on
    /// both, no data movement needed.
    ClearFlags,
    /// Both sides are dirty with differing payloads: upload the local
    /// payload (device wins the id slot) and additionally insert the
    /// remote payload as a second, conflict-duplicate local record.
    UploadLocalInsertRemoteConflict,
    /// Overwrite the local record's content with the remote payload.
    ReplaceLocalWithRemote,
    /// Upload the local payload to the device.
    UploadLocal,
}

/// Classify one record id's merge action from its remote and local
/// [`RecordState`] via the 4x4 SyncRecord table. `payloads_equal` is only
/// consulted in the two cells where the table's policy depends on it
/// (ARCHIVE/ARCHIVE and DIRTY/DIRTY).
pub fn classify(remote: RecordState, local: RecordState, payloads_equal: bool) -> MergeAction {
    use RecordState::*;
    match (remote, local) {
        (Archive, Archive) => MergeAction::ArchiveBothSidesDeleteBoth { payloads_equal },
        (Archive, Expunge) => MergeAction::ArchiveRemoteDeleteBoth,
        (Archive, Dirty) => MergeAction::ArchiveRemoteUploadLocal,
        (Archive, Clean) => MergeAction::ArchiveRemoteDeleteBoth,

        (Expunge, Archive) => MergeAction::ArchiveLocalDeleteBoth,
        (Expunge, Expunge) => MergeAction::DeleteBoth,
        (Expunge, Dirty) => MergeAction::DeleteRemoteUploadLocal,
        (Expunge, Clean) => MergeAction::DeleteBoth,

        (Dirty, Archive) => MergeAction::ArchiveLocalReplaceWithRemote,
        (Dirty, Expunge) => MergeAction::DeleteLocalInsertRemote,
        (Dirty, Dirty) => {
            if payloads_equal {
                MergeAction::ClearFlags
            } else {
                MergeAction::UploadLocalInsertRemoteConflict
            }
        }
        (Dirty, Clean) => MergeAction::ReplaceLocalWithRemote,

        (Clean, Archive) => MergeAction::ArchiveLocalDeleteBoth,
        (Clean, Expunge) => MergeAction::DeleteBoth,
        (Clean, Dirty) => MergeAction::UploadLocal,
        (Clean, Clean) => MergeAction::NoOp,
    }
}
