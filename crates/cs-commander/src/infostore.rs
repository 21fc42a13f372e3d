//! InfoStore: the device user/system/memory/database-list
//! snapshot taken once after wakeup and held for the rest of the sync.

use std::io::{Read, Write};

use cs_core::{host, DatabaseInfo};

use crate::commander::{Commander, CommanderError};
use crate::types::{StorageInfo, SysInfo, UserInfo};

/// Snapshot of everything the Reconciler and Dispatcher need to know about
/// the device without issuing another command: user/system/storage info
/// plus the full database list. Populated once per sync, then read-only.
#[derive(Debug, Default)]
pub struct InfoStore {
    user_info: Option<UserInfo>,
    sys_info: Option<SysInfo>,
    storage_info: Option<StorageInfo>,
    databases: Vec<DatabaseInfo>,
    iter_pos: usize,
    device_serial: Option<String>,
}

impl InfoStore {
    pub fn new() -> Self {
        InfoStore::default()
    }

    /// Populate every field by issuing the fixed sequence of reads the
    /// source always performs right after wakeup: system info,
    /// user info, card-0 storage info, then the full database list.
    pub fn populate<T: Read + Write>(&mut self, commander: &mut Commander<T>, include_rom: bool) -> Result<(), CommanderError> {
        self.sys_info = Some(commander.read_sys_info()?);
        self.user_info = Some(commander.read_user_info()?);
        self.storage_info = Some(commander.read_storage_info(0)?);

        self.databases.clear();
        let mut index = 0u16;
        loop {
            match commander.read_db_list(0, include_rom, index)? {
                Some(info) => {
                    self.databases.push(info);
                    index += 1;
                }
                None => break,
            }
        }
        self.reset_iter();
        Ok(())
    }

    pub fn set_device_serial(&mut self, serial: impl Into<String>) {
        self.device_serial = Some(serial.into());
    }

    /// The device's serial number with its one-character checksum suffix
    /// (glossary), for `PDA-Snum`-style display and registry lookups.
    pub fn serial_with_checksum(&self) -> Option<String> {
        self.device_serial.as_deref().map(host::serial_with_checksum)
    }

    pub fn user_id(&self) -> Option<u32> {
        self.user_info.as_ref().map(|u| u.user_id)
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_info.as_ref().map(|u| u.name.as_str())
    }

    pub fn last_sync_pc(&self) -> Option<u32> {
        self.user_info.as_ref().map(|u| u.last_sync_pc)
    }

    pub fn user_info(&self) -> Option<&UserInfo> {
        self.user_info.as_ref()
    }

    pub fn sys_info(&self) -> Option<&SysInfo> {
        self.sys_info.as_ref()
    }

    pub fn storage_info(&self) -> Option<&StorageInfo> {
        self.storage_info.as_ref()
    }

    pub fn databases(&self) -> &[DatabaseInfo] {
        &self.databases
    }

    pub fn find_db_by_name(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|d| d.name == name)
    }

    /// Used by tests and by the Dispatcher's database discovery, which does
    /// not go through a live device at all.
    pub fn append_db(&mut self, info: DatabaseInfo) {
        self.databases.push(info);
    }

    pub fn reset_iter(&mut self) {
        self.iter_pos = 0;
    }

    pub fn next_db(&mut self) -> Option<&DatabaseInfo> {
        let entry = self.databases.get(self.iter_pos)?;
        self.iter_pos += 1;
        Some(entry)
    }
}
