//! The Reconciler entry point: `sync_database` selects a
//! strategy, runs it, then the common pre/post steps shared by all three.

use std::collections::HashSet;
use std::path::Path;

use cs_core::{DatabaseInfo, Record, RecordState};
use cs_commander::{CloseFlags, DbHandle, OpenMode, RecordPayload};
use cs_db::{self as dbfile, ArchiveFile, ArchiveHeader, DbContents, LocalDatabase};

use crate::device_ops::DeviceOps;
use crate::error::ReconcileError;
use crate::merge::{classify, MergeAction};
use crate::strategy::{choose_strategy, SyncStrategy};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub host_id: u32,
    pub force_slow: bool,
    pub force_fast: bool,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub strategy: SyncStrategy,
    /// The one-line entry appended to the sync log uploaded at
    /// `end_of_sync`, e.g. `"Memo (1st) - OK"`.
    pub log_line: String,
}

pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Reconciler { config }
    }

    /// Reconcile one database end to end: pre-steps, strategy dispatch,
    /// post-steps, atomic backup rewrite. Resource databases take the
    /// separate wholesale-download path; the reconciler proper
    /// never runs on them.
    pub fn sync_database(
        &self,
        ops: &mut dyn DeviceOps,
        dbinfo: &DatabaseInfo,
        device_last_sync_pc: u32,
        backup_path: &Path,
        archive_dir: &Path,
        now_unix: i64,
    ) -> Result<SyncOutcome, ReconcileError> {
        if dbinfo.attributes.resource_db {
            return self.sync_resource_database(ops, dbinfo, backup_path);
        }

        let backup_exists = backup_path.exists();
        let strategy = choose_strategy(backup_exists, device_last_sync_pc, self.config.host_id, self.config.force_slow, self.config.force_fast);

        // Verified up front so an unwritable archive directory is reported
        // before any record is processed, not discovered mid-archive.
        ArchiveFile::check_writable(archive_dir)?;

        ops.open_conduit()?;

        let mut local = if backup_exists {
            dbfile::read(backup_path)?
        } else {
            empty_local_database(dbinfo)
        };
        if local.is_resource_db() {
            return Err(ReconcileError::NotARecordDatabase);
        }

        let mode = OpenMode {
            read: true,
            write: !dbinfo.attributes.open,
            show_secret: true,
            ..Default::default()
        };
        let handle = ops.open_db(&dbinfo.name, mode)?;

        let archive_header = ArchiveHeader {
            name: dbinfo.name.clone(),
            db_type: dbinfo.db_type,
            creator: dbinfo.creator,
        };
        let archive_path = archive_dir.join(&dbinfo.name);
        let archive = ArchiveFile::open_or_create(&archive_path, archive_header)?;

        let label = match strategy {
            SyncStrategy::First => format!("{} (1st)", dbinfo.name),
            _ => dbinfo.name.clone(),
        };

        match strategy {
            SyncStrategy::First => self.run_first_sync(ops, handle, &mut local, &archive, now_unix)?,
            SyncStrategy::Slow => self.run_slow_sync(ops, handle, &mut local, &archive, now_unix)?,
            SyncStrategy::Fast => self.run_fast_sync(ops, handle, &mut local, &archive, now_unix)?,
        }

        // Post-steps:
        // `clean_up_database` always runs on record databases;
        // `reset_sync_flags` is skipped when the device already reports
        // the database as open (undocumented in the source, preserved).
        ops.clean_up_database(handle)?;
        if !dbinfo.attributes.open {
            ops.reset_sync_flags(handle)?;
        }
        ops.close_db(handle, CloseFlags::default())?;

        dbfile::write(backup_path, &local)?;

        Ok(SyncOutcome { strategy, log_line: format!("{label} - OK") })
    }

    fn sync_resource_database(&self, ops: &mut dyn DeviceOps, dbinfo: &DatabaseInfo, backup_path: &Path) -> Result<SyncOutcome, ReconcileError> {
        if backup_path.exists() {
            // Resource databases are never reconciled after the first
            // encounter; once a local copy exists we leave it
            // untouched.
            return Ok(SyncOutcome {
                strategy: SyncStrategy::Fast,
                log_line: format!("{} - OK (resource, unchanged)", dbinfo.name),
            });
        }

        ops.open_conduit()?;
        let handle = ops.open_db(&dbinfo.name, OpenMode { read: true, show_secret: true, ..Default::default() })?;

        let mut resources = Vec::new();
        let mut index = 0u16;
        while let Some(res) = ops.read_resource_by_index(handle, index)? {
            resources.push(res);
            index += 1;
        }
        ops.close_db(handle, CloseFlags::default())?;

        let local = LocalDatabase {
            info: dbinfo.clone(),
            unique_id_seed: 0,
            next_record_list_id: 0,
            appinfo: None,
            sortinfo: None,
            contents: DbContents::Resources(resources),
        };
        dbfile::write(backup_path, &local)?;

        Ok(SyncOutcome {
            strategy: SyncStrategy::First,
            log_line: format!("{} (1st) - OK", dbinfo.name),
        })
    }

    // ---- FirstSync ----------------------------------------------------

    fn run_first_sync(&self, ops: &mut dyn DeviceOps, handle: DbHandle, local: &mut LocalDatabase, archive: &ArchiveFile, now: i64) -> Result<(), ReconcileError> {
        let mut index = 0u16;
        let mut downloaded = Vec::new();
        while let Some(payload) = ops.read_record_by_index(handle, index)? {
            downloaded.push(payload);
            index += 1;
        }
        for payload in downloaded {
            self.apply_first_sync_record(payload, local, archive, now)?;
        }
        Ok(())
    }

    /// Shared by FirstSync and by SlowSync/FastSync's "remote record the
    /// local side has never seen" case: archive-drop-or-keep-clean, the
    /// same handling FirstSync gives every downloaded record.
    fn apply_first_sync_record(&self, payload: RecordPayload, local: &mut LocalDatabase, archive: &ArchiveFile, now: i64) -> Result<(), ReconcileError> {
        let RecordPayload { info, data } = payload;
        match info.flags.state() {
            RecordState::Archive => {
                archive.append_record(&Record { id: info.id, category: info.category, flags: info.flags, data }, now)?;
            }
            RecordState::Expunge => {}
            _ => {
                // Zero-length payloads are silently skipped on FirstSync.
                if data.is_empty() {
                    return Ok(());
                }
                let mut flags = info.flags;
                flags.clear_sync_flags();
                local.append(Record { id: info.id, category: info.category, flags, data });
            }
        }
        Ok(())
    }

    // ---- SlowSync -------------------------------------------------------

    fn run_slow_sync(&self, ops: &mut dyn DeviceOps, handle: DbHandle, local: &mut LocalDatabase, archive: &ArchiveFile, now: i64) -> Result<(), ReconcileError> {
        let mut index = 0u16;
        let mut remote_records = Vec::new();
        while let Some(payload) = ops.read_record_by_index(handle, index)? {
            remote_records.push(payload);
            index += 1;
        }

        let mut seen_ids = HashSet::new();
        for mut payload in remote_records {
            seen_ids.insert(payload.info.id);
            if local.find_by_id(payload.info.id).is_none() {
                self.apply_first_sync_record(payload, local, archive, now)?;
                continue;
            }
            // If the device didn't flag it dirty, fall back to a byte
            // comparison against the local copy.
            if !payload.info.flags.dirty {
                if let Some(local_rec) = local.find_by_id(payload.info.id) {
                    if payload.data != local_rec.data {
                        payload.info.flags.dirty = true;
                    }
                }
            }
            self.merge_record(ops, handle, local, archive, now, payload)?;
        }

        let local_ids: Vec<u32> = local.records().iter().map(|r| r.id).collect();
        for id in local_ids {
            if seen_ids.contains(&id) {
                continue;
            }
            let Some(local_rec) = local.find_by_id(id).cloned() else { continue };
            match local_rec.state() {
                RecordState::Archive => {
                    archive.append_record(&local_rec, now)?;
                    local.delete_by_id(id);
                }
                RecordState::Expunge => {
                    local.delete_by_id(id);
                }
                RecordState::Dirty => {
                    let mut flags = local_rec.flags;
                    flags.clear_sync_flags();
                    let assigned = ops.write_record(handle, 0, flags, local_rec.category, &local_rec.data)?;
                    replace_local_id(local, id, assigned, Record { id, category: local_rec.category, flags, data: local_rec.data.clone() });
                }
                RecordState::Clean => {
                    // Not present on the device at all; the fast/slow-sync
                    // contract assumes the peer deleted it with archival
                    // intent.
                    archive.append_record(&local_rec, now)?;
                    local.delete_by_id(id);
                }
            }
        }
        Ok(())
    }

    // ---- FastSync -------------------------------------------------------

    fn run_fast_sync(&self, ops: &mut dyn DeviceOps, handle: DbHandle, local: &mut LocalDatabase, archive: &ArchiveFile, now: i64) -> Result<(), ReconcileError> {
        let mut seen_ids = HashSet::new();
        while let Some(payload) = ops.read_next_modified_rec(handle)? {
            seen_ids.insert(payload.info.id);
            self.merge_record(ops, handle, local, archive, now, payload)?;
        }

        let local_ids: Vec<u32> = local.records().iter().map(|r| r.id).collect();
        for id in local_ids {
            if seen_ids.contains(&id) {
                continue;
            }
            let Some(local_rec) = local.find_by_id(id).cloned() else { continue };
            match local_rec.state() {
                RecordState::Archive => {
                    archive.append_record(&local_rec, now)?;
                    local.delete_by_id(id);
                    ops.delete_record(handle, true, id)?;
                }
                RecordState::Expunge => {
                    local.delete_by_id(id);
                    ops.delete_record(handle, false, id)?;
                }
                RecordState::Dirty => {
                    // Documented edge case: zero-length records
                    // are silently skipped on fast-sync upload, whether
                    // this is a firmware workaround or deliberate policy
                    // is not recorded in the source.
                    if local_rec.data.is_empty() {
                        if let Some(r) = local.find_by_id_mut(id) {
                            r.flags.clear_sync_flags();
                        }
                        continue;
                    }
                    let mut flags = local_rec.flags;
                    flags.clear_sync_flags();
                    let assigned = ops.write_record(handle, id, flags, local_rec.category, &local_rec.data)?;
                    replace_local_id(local, id, assigned, Record { id, category: local_rec.category, flags, data: local_rec.data.clone() });
                }
                RecordState::Clean => {
                    // Fast-sync contract: an id the iterator never
                    // returned is assumed unchanged on the device. A
                    // firmware bug that fails to set the dirty bit would
                    // cause silent divergence here.
                }
            }
        }
        Ok(())
    }

    // ---- SyncRecord (shared merge) --------------------------------------

    /// Reconcile one id the device reported as modified (or, for SlowSync,
    /// content-compared) via the SyncRecord 4x4 table in [`classify`]. If
    /// the local side has never heard of this id the record is simply new
    /// (FirstSync flag handling, then kept).
    fn merge_record(&self, ops: &mut dyn DeviceOps, handle: DbHandle, local: &mut LocalDatabase, archive: &ArchiveFile, now: i64, remote: RecordPayload) -> Result<(), ReconcileError> {
        let id = remote.info.id;
        let Some(local_rec) = local.find_by_id(id).cloned() else {
            return self.apply_first_sync_record(remote, local, archive, now);
        };

        let remote_state = remote.info.flags.state();
        let local_state = local_rec.state();
        let payloads_equal = remote.data == local_rec.data;
        let action = classify(remote_state, local_state, payloads_equal);

        match action {
            MergeAction::NoOp => {}

            MergeAction::ArchiveBothSidesDeleteBoth { payloads_equal } => {
                archive.append_record(&remote_record(&remote), now)?;
                if !payloads_equal {
                    archive.append_record(&local_rec, now)?;
                }
                local.delete_by_id(id);
                ops.delete_record(handle, true, id)?;
            }

            MergeAction::ArchiveRemoteDeleteBoth => {
                archive.append_record(&remote_record(&remote), now)?;
                local.delete_by_id(id);
                ops.delete_record(handle, true, id)?;
            }

            MergeAction::ArchiveRemoteUploadLocal => {
                archive.append_record(&remote_record(&remote), now)?;
                let mut flags = local_rec.flags;
                flags.clear_sync_flags();
                let assigned = ops.write_record(handle, id, flags, local_rec.category, &local_rec.data)?;
                replace_local_id(local, id, assigned, Record { id, category: local_rec.category, flags, data: local_rec.data.clone() });
            }

            MergeAction::ArchiveLocalDeleteBoth => {
                archive.append_record(&local_rec, now)?;
                local.delete_by_id(id);
                ops.delete_record(handle, true, id)?;
            }

            MergeAction::DeleteBoth => {
                local.delete_by_id(id);
                ops.delete_record(handle, false, id)?;
            }

            MergeAction::DeleteRemoteUploadLocal => {
                ops.delete_record(handle, false, id)?;
                let mut flags = local_rec.flags;
                flags.clear_sync_flags();
                let assigned = ops.write_record(handle, id, flags, local_rec.category, &local_rec.data)?;
                replace_local_id(local, id, assigned, Record { id, category: local_rec.category, flags, data: local_rec.data.clone() });
            }

            MergeAction::ArchiveLocalReplaceWithRemote => {
                archive.append_record(&local_rec, now)?;
                let mut flags = remote.info.flags;
                flags.clear_sync_flags();
                if let Some(r) = local.find_by_id_mut(id) {
                    r.category = remote.info.category;
                    r.flags = flags;
                    r.data = remote.data.clone();
                }
            }

            MergeAction::DeleteLocalInsertRemote => {
                local.delete_by_id(id);
                let mut flags = remote.info.flags;
                flags.clear_sync_flags();
                local.append(Record { id, category: remote.info.category, flags, data: remote.data.clone() });
            }

            MergeAction::ClearFlags => {
                if let Some(r) = local.find_by_id_mut(id) {
                    r.flags.clear_sync_flags();
                }
            }

            MergeAction::UploadLocalInsertRemoteConflict => {
                // Local wins the existing id slot; remote's content
                // survives as a brand-new, device-assigned record.
                let mut local_flags = local_rec.flags;
                local_flags.clear_sync_flags();
                let assigned_local = ops.write_record(handle, id, local_flags, local_rec.category, &local_rec.data)?;
                replace_local_id(local, id, assigned_local, Record { id, category: local_rec.category, flags: local_flags, data: local_rec.data.clone() });

                let mut remote_flags = remote.info.flags;
                remote_flags.clear_sync_flags();
                let assigned_remote = ops.write_record(handle, 0, remote_flags, remote.info.category, &remote.data)?;
                local.append(Record { id: assigned_remote, category: remote.info.category, flags: remote_flags, data: remote.data.clone() });
            }

            MergeAction::ReplaceLocalWithRemote => {
                let mut flags = remote.info.flags;
                flags.clear_sync_flags();
                if let Some(r) = local.find_by_id_mut(id) {
                    r.category = remote.info.category;
                    r.flags = flags;
                    r.data = remote.data.clone();
                }
            }

            MergeAction::UploadLocal => {
                let mut flags = local_rec.flags;
                flags.clear_sync_flags();
                let assigned = ops.write_record(handle, id, flags, local_rec.category, &local_rec.data)?;
                replace_local_id(local, id, assigned, Record { id, category: local_rec.category, flags, data: local_rec.data.clone() });
            }
        }
        Ok(())
    }
}

fn remote_record(payload: &RecordPayload) -> Record {
    Record {
        id: payload.info.id,
        category: payload.info.category,
        flags: payload.info.flags,
        data: payload.data.clone(),
    }
}

/// Apply the id a `write_record` call assigned. When the device kept the
/// existing id the record is updated in place (preserving file order);
/// otherwise it's re-keyed and moved to the tail, matching how a freshly
/// assigned id would appear in an `append`-based local database.
fn replace_local_id(local: &mut LocalDatabase, old_id: u32, new_id: u32, rec: Record) {
    if new_id == old_id {
        if let Some(r) = local.find_by_id_mut(old_id) {
            *r = rec;
        }
        return;
    }
    local.delete_by_id(old_id);
    let mut rec = rec;
    rec.id = new_id;
    local.append(rec);
}

fn empty_local_database(dbinfo: &DatabaseInfo) -> LocalDatabase {
    LocalDatabase {
        info: dbinfo.clone(),
        unique_id_seed: 0,
        next_record_list_id: 0,
        appinfo: None,
        sortinfo: None,
        contents: DbContents::Records(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_commander::{RecordInfo, RecordPayload};
    use cs_core::{DbAttrFlags, PalmTimestamp, RecordFlags};

    use crate::device_ops::fake::FakeDevice;

    fn dbinfo(name: &str) -> DatabaseInfo {
        DatabaseInfo {
            name: name.into(),
            creator: 0x6D656D6F,
            db_type: 0x44415441,
            attributes: DbAttrFlags::default(),
            version: 0,
            modnum: 0,
            creation_time: PalmTimestamp(0),
            modification_time: PalmTimestamp(0),
            backup_time: PalmTimestamp(0),
        }
    }

    fn payload(id: u32, flags: RecordFlags, data: &[u8]) -> RecordPayload {
        RecordPayload { info: RecordInfo { id, category: 0, flags }, data: data.to_vec() }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcilerConfig { host_id: 0xC0FFEE, force_slow: false, force_fast: false })
    }

    /// Scenario 1: first sync, empty backup dir, three clean
    /// records -> all three kept with flags cleared, no archive entries.
    #[test]
    fn first_sync_keeps_clean_records_and_clears_flags() {
        let dir = tempfile::tempdir().unwrap();
        let backup_path = dir.path().join("Memo.pdb");
        let archive_dir = dir.path().join("archive");
        std::fs::create_dir_all(&archive_dir).unwrap();

        let mut device = FakeDevice::with_records(vec![
            payload(1, RecordFlags::default(), b"a"),
            payload(2, RecordFlags::default(), b"b"),
            payload(3, RecordFlags::default(), b"c"),
        ]);

        let outcome = reconciler()
            .sync_database(&mut device, &dbinfo("Memo"), 0, &backup_path, &archive_dir, 1_700_000_000)
            .unwrap();

        assert_eq!(outcome.strategy, SyncStrategy::First);
        assert_eq!(outcome.log_line, "Memo (1st) - OK");

        let local = dbfile::read(&backup_path).unwrap();
        assert_eq!(local.records().len(), 3);
        for rec in local.records() {
            assert!(rec.flags.is_clean());
        }
        assert!(!archive_dir.join("Memo").exists());
    }

    /// Scenario 2: fast sync, one record reported dirty with new content.
    #[test]
    fn fast_sync_applies_a_single_dirty_record() {
        let dir = tempfile::tempdir().unwrap();
        let backup_path = dir.path().join("Memo.pdb");
        let archive_dir = dir.path().join("archive");
        std::fs::create_dir_all(&archive_dir).unwrap();

        let existing = LocalDatabase {
            info: dbinfo("Memo"),
            unique_id_seed: 4,
            next_record_list_id: 0,
            appinfo: None,
            sortinfo: None,
            contents: DbContents::Records(vec![
                Record { id: 1, category: 0, flags: RecordFlags::default(), data: b"a".to_vec() },
                Record { id: 2, category: 0, flags: RecordFlags::default(), data: b"b".to_vec() },
                Record { id: 3, category: 0, flags: RecordFlags::default(), data: b"c".to_vec() },
            ]),
        };
        dbfile::write(&backup_path, &existing).unwrap();

        let mut device = FakeDevice::with_records(vec![payload(
            2,
            RecordFlags { dirty: true, ..Default::default() },
            b"B",
        )]);

        let outcome = reconciler()
            .sync_database(&mut device, &dbinfo("Memo"), 0xC0FFEE, &backup_path, &archive_dir, 1_700_000_000)
            .unwrap();
        assert_eq!(outcome.strategy, SyncStrategy::Fast);
        assert_eq!(outcome.log_line, "Memo - OK");

        let local = dbfile::read(&backup_path).unwrap();
        assert_eq!(local.find_by_id(2).unwrap().data, b"B");
        assert!(local.find_by_id(2).unwrap().flags.is_clean());
        assert_eq!(local.find_by_id(1).unwrap().data, b"a");
        assert_eq!(local.find_by_id(3).unwrap().data, b"c");
    }

    /// Scenario 3: fast sync, a local record flagged for archival with the
    /// device clean.
    #[test]
    fn fast_sync_archives_and_drops_a_local_only_archive_record() {
        let dir = tempfile::tempdir().unwrap();
        let backup_path = dir.path().join("Memo.pdb");
        let archive_dir = dir.path().join("archive");
        std::fs::create_dir_all(&archive_dir).unwrap();

        let existing = LocalDatabase {
            info: dbinfo("Memo"),
            unique_id_seed: 4,
            next_record_list_id: 0,
            appinfo: None,
            sortinfo: None,
            contents: DbContents::Records(vec![
                Record { id: 1, category: 0, flags: RecordFlags { deleted: true, archive: true, ..Default::default() }, data: b"gone".to_vec() },
            ]),
        };
        dbfile::write(&backup_path, &existing).unwrap();

        let mut device = FakeDevice::with_records(vec![]);

        let outcome = reconciler()
            .sync_database(&mut device, &dbinfo("Memo"), 0xC0FFEE, &backup_path, &archive_dir, 1_700_000_000)
            .unwrap();
        assert_eq!(outcome.log_line, "Memo - OK");

        let local = dbfile::read(&backup_path).unwrap();
        assert!(local.find_by_id(1).is_none());
        assert!(archive_dir.join("Memo").exists());
        let archived = ArchiveFile::open_or_create(&archive_dir.join("Memo"), ArchiveHeader { name: "Memo".into(), db_type: 0, creator: 0 }).unwrap();
        let entries = archived.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, b"gone");
        assert!(device.deleted.contains(&1));
    }

    /// Scenario 4: slow sync, conflicting edits on both sides.
    #[test]
    fn slow_sync_resolves_conflicting_dirty_edits() {
        let dir = tempfile::tempdir().unwrap();
        let backup_path = dir.path().join("Memo.pdb");
        let archive_dir = dir.path().join("archive");
        std::fs::create_dir_all(&archive_dir).unwrap();

        let existing = LocalDatabase {
            info: dbinfo("Memo"),
            unique_id_seed: 6,
            next_record_list_id: 0,
            appinfo: None,
            sortinfo: None,
            contents: DbContents::Records(vec![
                Record { id: 5, category: 0, flags: RecordFlags { dirty: true, ..Default::default() }, data: b"Y".to_vec() },
            ]),
        };
        dbfile::write(&backup_path, &existing).unwrap();

        // Device's last sync partner was a different host -> slow sync.
        let mut device = FakeDevice::with_records(vec![payload(5, RecordFlags { dirty: true, ..Default::default() }, b"X")]);

        let outcome = reconciler()
            .sync_database(&mut device, &dbinfo("Memo"), 0x11111111, &backup_path, &archive_dir, 1_700_000_000)
            .unwrap();
        assert_eq!(outcome.strategy, SyncStrategy::Slow);
        assert_eq!(outcome.log_line, "Memo - OK");

        let local = dbfile::read(&backup_path).unwrap();
        assert_eq!(local.records().len(), 2);
        assert_eq!(local.find_by_id(5).unwrap().data, b"Y");
        let other = local.records().iter().find(|r| r.id != 5).unwrap();
        assert_eq!(other.data, b"X");

        assert!(device.uploaded.iter().any(|(id, _, _, data)| *id == 5 && data == b"Y"));
        assert!(device.uploaded.iter().any(|(id, _, _, data)| *id != 5 && data == b"X"));
    }

    #[test]
    fn zero_length_record_is_skipped_on_first_sync() {
        let dir = tempfile::tempdir().unwrap();
        let backup_path = dir.path().join("Memo.pdb");
        let archive_dir = dir.path().join("archive");
        std::fs::create_dir_all(&archive_dir).unwrap();

        let mut device = FakeDevice::with_records(vec![payload(1, RecordFlags::default(), b"")]);
        reconciler()
            .sync_database(&mut device, &dbinfo("Memo"), 0, &backup_path, &archive_dir, 1_700_000_000)
            .unwrap();

        let local = dbfile::read(&backup_path).unwrap();
        assert!(local.records().is_empty());
    }

    #[test]
    fn resource_database_is_downloaded_wholesale_once() {
        let dir = tempfile::tempdir().unwrap();
        let backup_path = dir.path().join("Calculator.prc");
        let archive_dir = dir.path().join("archive");
        std::fs::create_dir_all(&archive_dir).unwrap();

        let mut info = dbinfo("Calculator");
        info.attributes.resource_db = true;
        let mut device = FakeDevice::default();

        let outcome = reconciler().sync_database(&mut device, &info, 0, &backup_path, &archive_dir, 1_700_000_000).unwrap();
        assert_eq!(outcome.log_line, "Calculator (1st) - OK");
        assert!(backup_path.exists());

        // Second sync with a backup already present leaves it untouched.
        let outcome2 = reconciler().sync_database(&mut device, &info, 0, &backup_path, &archive_dir, 1_700_000_001).unwrap();
        assert!(outcome2.log_line.contains("unchanged"));
    }
}
