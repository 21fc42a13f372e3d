//! The narrow device-facing seam the Reconciler drives.
//!
//! Mirrors the `cs_proto::Transport` pattern: one trait, one production
//! implementation (blanket over [`Commander`]), and a trivial in-memory
//! fake for tests, so the merge/strategy logic can be exercised without
//! wiring a full protocol stack end to end.

use std::io::{Read, Write};

use cs_commander::{CloseFlags, Commander, DbHandle, OpenMode, RecordPayload};
use cs_core::{Resource, RecordFlags};

use crate::error::ReconcileError;

pub trait DeviceOps {
    fn open_conduit(&mut self) -> Result<(), ReconcileError>;
    fn open_db(&mut self, name: &str, mode: OpenMode) -> Result<DbHandle, ReconcileError>;
    fn close_db(&mut self, handle: DbHandle, flags: CloseFlags) -> Result<(), ReconcileError>;
    fn clean_up_database(&mut self, handle: DbHandle) -> Result<(), ReconcileError>;
    fn reset_sync_flags(&mut self, handle: DbHandle) -> Result<(), ReconcileError>;
    fn read_record_by_index(&mut self, handle: DbHandle, index: u16) -> Result<Option<RecordPayload>, ReconcileError>;
    fn read_resource_by_index(&mut self, handle: DbHandle, index: u16) -> Result<Option<Resource>, ReconcileError>;
    fn read_next_modified_rec(&mut self, handle: DbHandle) -> Result<Option<RecordPayload>, ReconcileError>;
    fn write_record(&mut self, handle: DbHandle, id: u32, flags: RecordFlags, category: u8, data: &[u8]) -> Result<u32, ReconcileError>;
    fn delete_record(&mut self, handle: DbHandle, archive: bool, id: u32) -> Result<(), ReconcileError>;
    fn tickle(&mut self) -> Result<(), ReconcileError>;
}

impl<T: Read + Write> DeviceOps for Commander<T> {
    fn open_conduit(&mut self) -> Result<(), ReconcileError> {
        Ok(Commander::open_conduit(self)?)
    }

    fn open_db(&mut self, name: &str, mode: OpenMode) -> Result<DbHandle, ReconcileError> {
        Ok(Commander::open_db(self, 0, name, mode)?)
    }

    fn close_db(&mut self, handle: DbHandle, flags: CloseFlags) -> Result<(), ReconcileError> {
        Ok(Commander::close_db(self, handle, flags)?)
    }

    fn clean_up_database(&mut self, handle: DbHandle) -> Result<(), ReconcileError> {
        Ok(Commander::clean_up_database(self, handle)?)
    }

    fn reset_sync_flags(&mut self, handle: DbHandle) -> Result<(), ReconcileError> {
        Ok(Commander::reset_sync_flags(self, handle)?)
    }

    fn read_record_by_index(&mut self, handle: DbHandle, index: u16) -> Result<Option<RecordPayload>, ReconcileError> {
        Ok(Commander::read_record_by_index(self, handle, index)?)
    }

    fn read_resource_by_index(&mut self, handle: DbHandle, index: u16) -> Result<Option<Resource>, ReconcileError> {
        Ok(Commander::read_resource_by_index(self, handle, index)?)
    }

    fn read_next_modified_rec(&mut self, handle: DbHandle) -> Result<Option<RecordPayload>, ReconcileError> {
        Ok(Commander::read_next_modified_rec(self, handle)?)
    }

    fn write_record(&mut self, handle: DbHandle, id: u32, flags: RecordFlags, category: u8, data: &[u8]) -> Result<u32, ReconcileError> {
        Ok(Commander::write_record(self, handle, id, flags, category, data)?)
    }

    fn delete_record(&mut self, handle: DbHandle, archive: bool, id: u32) -> Result<(), ReconcileError> {
        Ok(Commander::delete_record(self, handle, cs_commander::DeleteRecordFlags { all: false, archive }, id)?)
    }

    fn tickle(&mut self) -> Result<(), ReconcileError> {
        Ok(Commander::tickle(self)?)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use super::*;

    /// An in-memory stand-in for a device's record database, used to unit
    /// test the Reconciler's strategies without any protocol stack at all.
    #[derive(Debug, Default, Clone)]
    pub struct FakeDevice {
        pub records: Vec<RecordPayload>,
        pub modified_cursor: usize,
        pub index_cursor: usize,
        pub next_id: u32,
        pub deleted: Vec<u32>,
        pub uploaded: Vec<(u32, RecordFlags, u8, Vec<u8>)>,
        pub cleaned_up: bool,
        pub sync_flags_reset: bool,
        pub conduit_opened: bool,
    }

    impl FakeDevice {
        pub fn with_records(records: Vec<RecordPayload>) -> Self {
            let next_id = records.iter().map(|r| r.info.id).max().unwrap_or(0) + 1;
            FakeDevice { records, next_id, ..Default::default() }
        }
    }

    impl DeviceOps for FakeDevice {
        fn open_conduit(&mut self) -> Result<(), ReconcileError> {
            self.conduit_opened = true;
            Ok(())
        }

        fn open_db(&mut self, _name: &str, _mode: OpenMode) -> Result<DbHandle, ReconcileError> {
            Ok(DbHandle::for_test(1))
        }

        fn close_db(&mut self, _handle: DbHandle, _flags: CloseFlags) -> Result<(), ReconcileError> {
            Ok(())
        }

        fn clean_up_database(&mut self, _handle: DbHandle) -> Result<(), ReconcileError> {
            self.cleaned_up = true;
            Ok(())
        }

        fn reset_sync_flags(&mut self, _handle: DbHandle) -> Result<(), ReconcileError> {
            self.sync_flags_reset = true;
            Ok(())
        }

        fn read_record_by_index(&mut self, _handle: DbHandle, index: u16) -> Result<Option<RecordPayload>, ReconcileError> {
            Ok(self.records.get(index as usize).cloned())
        }

        fn read_resource_by_index(&mut self, _handle: DbHandle, _index: u16) -> Result<Option<Resource>, ReconcileError> {
            Ok(None)
        }

        fn read_next_modified_rec(&mut self, _handle: DbHandle) -> Result<Option<RecordPayload>, ReconcileError> {
            loop {
                let candidate = self.records.get(self.modified_cursor).cloned();
                self.modified_cursor += 1;
                match candidate {
                    None => return Ok(None),
                    Some(rec) if !rec.info.flags.is_clean() => return Ok(Some(rec)),
                    Some(_) => continue,
                }
            }
        }

        fn write_record(&mut self, _handle: DbHandle, id: u32, flags: RecordFlags, category: u8, data: &[u8]) -> Result<u32, ReconcileError> {
            let assigned = if id == 0 {
                let new_id = self.next_id;
                self.next_id += 1;
                new_id
            } else {
                id
            };
            self.uploaded.push((assigned, flags, category, data.to_vec()));
            Ok(assigned)
        }

        fn delete_record(&mut self, _handle: DbHandle, _archive: bool, id: u32) -> Result<(), ReconcileError> {
            self.deleted.push(id);
            Ok(())
        }

        fn tickle(&mut self) -> Result<(), ReconcileError> {
            Ok(())
        }
    }

    // Map used only so test code can build index-less maps when asserting
    // "which ids were uploaded" without caring about order.
    #[allow(dead_code)]
    pub fn by_id(records: &[RecordPayload]) -> HashMap<u32, &RecordPayload> {
        records.iter().map(|r| (r.info.id, r)).collect()
    }
}
