//! Value types passed to and returned from [`crate::commander::Commander`]
//! operations.

use cs_core::{DatabaseInfo, PalmTimestamp, RecordFlags};

/// Opaque handle returned by `open_db`, threaded through every subsequent
/// per-database command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbHandle(pub(crate) u8);

impl DbHandle {
    /// Build a handle from a raw value. Real handles only ever come back
    /// from `open_db`/`create_db`; this exists so fakes in other crates'
    /// tests (e.g. `cs_sync`'s in-memory `DeviceOps`) can hand out a
    /// plausible one without a live device.
    pub fn for_test(raw: u8) -> Self {
        DbHandle(raw)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub exclusive: bool,
    pub show_secret: bool,
}

impl OpenMode {
    pub fn read_only() -> Self {
        OpenMode { read: true, ..Default::default() }
    }

    pub fn to_bits(self) -> u8 {
        let mut bits = 0u8;
        if self.read {
            bits |= 0x80;
        }
        if self.write {
            bits |= 0x40;
        }
        if self.exclusive {
            bits |= 0x20;
        }
        if self.show_secret {
            bits |= 0x10;
        }
        bits
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseFlags {
    pub all_dbs: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteRecordFlags {
    pub all: bool,
    pub archive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: u32,
    pub viewer_id: u32,
    pub last_sync_pc: u32,
    pub last_sync_time: PalmTimestamp,
    pub last_good_sync_time: PalmTimestamp,
    pub name: String,
    pub password_hash: Vec<u8>,
}

/// Bitmask selecting which [`UserInfo`] fields `write_user_info` updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserInfoModifyMask {
    pub user_id: bool,
    pub name: bool,
    pub last_sync_pc: bool,
    pub last_sync_time: bool,
    pub last_good_sync_time: bool,
}

impl UserInfoModifyMask {
    pub fn to_bits(self) -> u8 {
        let mut bits = 0u8;
        if self.user_id {
            bits |= 0x01;
        }
        if self.name {
            bits |= 0x02;
        }
        if self.last_sync_pc {
            bits |= 0x04;
        }
        if self.last_sync_time {
            bits |= 0x08;
        }
        if self.last_good_sync_time {
            bits |= 0x10;
        }
        bits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysInfo {
    pub rom_version: u32,
    pub locale: u32,
    pub product_id: u32,
    pub dlp_major: u16,
    pub dlp_minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub card: u8,
    pub total_bytes: u32,
    pub free_bytes: u32,
    pub ram_db_count: u16,
    pub rom_db_count: u16,
    pub card_name: String,
    pub manufacturer_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: u32,
    pub category: u8,
    pub flags: RecordFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPayload {
    pub info: RecordInfo,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfSyncStatus {
    Normal,
    OtherError,
    Cancelled,
    Timeout,
    Unknown,
}

impl EndOfSyncStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            EndOfSyncStatus::Normal => 0,
            EndOfSyncStatus::OtherError => 1,
            EndOfSyncStatus::Cancelled => 2,
            EndOfSyncStatus::Timeout => 3,
            EndOfSyncStatus::Unknown => 4,
        }
    }
}

/// Re-exported so callers of `read_db_list` get the shared value type
/// instead of a parallel commander-local one.
pub type DbListEntry = DatabaseInfo;
