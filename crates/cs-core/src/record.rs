//! Record, Resource, and DatabaseInfo value types.
//!
//! The on-wire record flag octet packs four status bits and a 4-bit
//! category into a single byte; internal storage keeps them separate, with
//! the codec handling the packing at the wire boundary. See
//! [`RecordFlags::from_wire_octet`] / [`RecordFlags::to_wire_octet`].

use serde::{Deserialize, Serialize};

/// Maximum record id; upload of id 0 asks the device to assign one in
/// `1..=MAX_RECORD_ID`.
pub const MAX_RECORD_ID: u32 = 0x0FFF_FFFF;

/// The four on-wire status bits tracked per record, stored separately from
/// category rather than packed with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    /// Content changed since last sync.
    pub dirty: bool,
    /// Deleted by the user.
    pub deleted: bool,
    /// Expunged (deleted without wanting an archive copy).
    pub expunged: bool,
    /// Archive a copy before removing.
    pub archive: bool,
    /// Private record; the only flag that survives a successful sync.
    pub private: bool,
}

const WIRE_DIRTY: u8 = 0x40;
const WIRE_DELETED: u8 = 0x80;
const WIRE_EXPUNGED: u8 = 0x20;
const WIRE_ARCHIVE: u8 = 0x08;
const WIRE_PRIVATE: u8 = 0x10;
const WIRE_CATEGORY_MASK: u8 = 0x0F;

impl RecordFlags {
    /// Decode the on-wire octet into separated flags and category (low
    /// nibble). The wire octet as transmitted by the device carries flags
    /// in the high nibble and category in the low nibble;
    /// `private` is encoded as an extra high bit distinct from the
    /// dirty/deleted/expunged/archive quartet the reconciler reasons about.
    pub fn from_wire_octet(octet: u8) -> (Self, u8) {
        let flags = RecordFlags {
            dirty: octet & WIRE_DIRTY != 0,
            deleted: octet & WIRE_DELETED != 0,
            expunged: octet & WIRE_EXPUNGED != 0,
            archive: octet & WIRE_ARCHIVE != 0,
            private: octet & WIRE_PRIVATE != 0,
        };
        (flags, octet & WIRE_CATEGORY_MASK)
    }

    /// Re-pack flags and category into the on-wire octet.
    pub fn to_wire_octet(&self, category: u8) -> u8 {
        let mut octet = category & WIRE_CATEGORY_MASK;
        if self.dirty {
            octet |= WIRE_DIRTY;
        }
        if self.deleted {
            octet |= WIRE_DELETED;
        }
        if self.expunged {
            octet |= WIRE_EXPUNGED;
        }
        if self.archive {
            octet |= WIRE_ARCHIVE;
        }
        if self.private {
            octet |= WIRE_PRIVATE;
        }
        octet
    }

    /// Clear every sync-transient flag (dirty/deleted/expunged/archive),
    /// keeping only `private`, as required after a successful sync.
    pub fn clear_sync_flags(&mut self) {
        self.dirty = false;
        self.deleted = false;
        self.expunged = false;
        self.archive = false;
    }

    /// True if no sync-transient flag is set.
    pub fn is_clean(&self) -> bool {
        !(self.dirty || self.deleted || self.expunged || self.archive)
    }
}

/// The normalized record disposition computed from [`RecordFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Deleted by user and wants an archival copy (or ambiguous: `deleted`
    /// alone with neither `archive` nor `expunged`, treated conservatively
    /// as wanting an archive).
    Archive,
    /// Deleted without archival.
    Expunge,
    /// Content changed.
    Dirty,
    /// Unchanged since last sync.
    Clean,
}

impl RecordFlags {
    /// Classify this flag set into one of the four normalized states.
    pub fn state(&self) -> RecordState {
        let deleted_or_dirty_with_archive = (self.deleted || self.dirty) && self.archive;
        let expunge_only = self.deleted && !self.archive && self.expunged;
        if deleted_or_dirty_with_archive {
            RecordState::Archive
        } else if expunge_only {
            RecordState::Expunge
        } else if self.deleted && !self.archive && !self.expunged {
            // Conservative default: deleted alone (neither archive nor
            // expunged set) is treated as wanting an archive.
            RecordState::Archive
        } else if self.dirty && !self.deleted {
            RecordState::Dirty
        } else {
            RecordState::Clean
        }
    }
}

/// A single database record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Unique within a record database; 0 requests device assignment on
    /// upload.
    pub id: u32,
    /// 0-15.
    pub category: u8,
    pub flags: RecordFlags,
    pub data: Vec<u8>,
}

impl Record {
    pub fn state(&self) -> RecordState {
        self.flags.state()
    }
}

/// A single resource. Resource databases hold resources instead
/// of records; the reconciler never runs on resource databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub res_type: u32,
    pub id: u16,
    pub data: Vec<u8>,
}

/// Database attribute flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbAttrFlags {
    pub resource_db: bool,
    pub read_only: bool,
    pub ok_newer: bool,
    pub open: bool,
    pub appinfo_dirty: bool,
    pub backup: bool,
    pub stream: bool,
}

impl DbAttrFlags {
    pub fn from_wire(word: u16) -> Self {
        DbAttrFlags {
            resource_db: word & 0x0001 != 0,
            read_only: word & 0x0002 != 0,
            appinfo_dirty: word & 0x0004 != 0,
            backup: word & 0x0008 != 0,
            ok_newer: word & 0x0010 != 0,
            stream: word & 0x0020 != 0,
            open: word & 0x8000 != 0,
        }
    }

    pub fn to_wire(&self) -> u16 {
        let mut word = 0u16;
        if self.resource_db {
            word |= 0x0001;
        }
        if self.read_only {
            word |= 0x0002;
        }
        if self.appinfo_dirty {
            word |= 0x0004;
        }
        if self.backup {
            word |= 0x0008;
        }
        if self.ok_newer {
            word |= 0x0010;
        }
        if self.stream {
            word |= 0x0020;
        }
        if self.open {
            word |= 0x8000;
        }
        word
    }
}

/// Seconds since the Palm epoch (1904-01-01T00:00:00Z), as carried on the
/// wire and in local database file headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PalmTimestamp(pub u32);

/// Offset in seconds between the Palm epoch (1904-01-01) and the Unix epoch
/// (1970-01-01): 66 years including 17 leap days.
const PALM_EPOCH_OFFSET_SECS: i64 = 2_082_844_800;

impl PalmTimestamp {
    pub fn to_unix_epoch_secs(self) -> i64 {
        i64::from(self.0) - PALM_EPOCH_OFFSET_SECS
    }

    pub fn from_unix_epoch_secs(unix_secs: i64) -> Self {
        let palm = (unix_secs + PALM_EPOCH_OFFSET_SECS).max(0);
        PalmTimestamp(palm as u32)
    }
}

/// A database's header-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub creator: u32,
    pub db_type: u32,
    pub attributes: DbAttrFlags,
    pub version: u16,
    pub modnum: u32,
    pub creation_time: PalmTimestamp,
    pub modification_time: PalmTimestamp,
    pub backup_time: PalmTimestamp,
}

impl DatabaseInfo {
    /// True if a record-style reconciliation applies; false for resource
    /// databases, which the reconciler never runs on.
    pub fn is_record_db(&self) -> bool {
        !self.attributes.resource_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_octet_roundtrips_flags_and_category() {
        let flags = RecordFlags {
            dirty: true,
            deleted: false,
            expunged: false,
            archive: true,
            private: false,
        };
        let octet = flags.to_wire_octet(7);
        let (decoded, category) = RecordFlags::from_wire_octet(octet);
        assert_eq!(decoded, flags);
        assert_eq!(category, 7);
    }

    #[test]
    fn clear_sync_flags_keeps_private() {
        let mut flags = RecordFlags {
            dirty: true,
            deleted: true,
            expunged: false,
            archive: true,
            private: true,
        };
        flags.clear_sync_flags();
        assert!(flags.is_clean());
        assert!(flags.private);
    }

    #[test]
    fn state_classifies_archive_expunge_dirty_clean() {
        let archive = RecordFlags {
            deleted: true,
            archive: true,
            ..Default::default()
        };
        assert_eq!(archive.state(), RecordState::Archive);

        let expunge = RecordFlags {
            deleted: true,
            expunged: true,
            ..Default::default()
        };
        assert_eq!(expunge.state(), RecordState::Expunge);

        let deleted_only = RecordFlags {
            deleted: true,
            ..Default::default()
        };
        assert_eq!(
            deleted_only.state(),
            RecordState::Archive,
            "deleted-alone is conservatively treated as wanting an archive"
        );

        let dirty = RecordFlags {
            dirty: true,
            ..Default::default()
        };
        assert_eq!(dirty.state(), RecordState::Dirty);

        assert_eq!(RecordFlags::default().state(), RecordState::Clean);
    }

    #[test]
    fn palm_timestamp_roundtrip() {
        let unix_now = 1_800_000_000i64;
        let palm = PalmTimestamp::from_unix_epoch_secs(unix_now);
        assert_eq!(palm.to_unix_epoch_secs(), unix_now);
    }

    #[test]
    fn db_attr_flags_roundtrip() {
        let flags = DbAttrFlags {
            resource_db: true,
            read_only: false,
            ok_newer: true,
            open: true,
            appinfo_dirty: false,
            backup: true,
            stream: false,
        };
        assert_eq!(DbAttrFlags::from_wire(flags.to_wire()), flags);
    }
}
