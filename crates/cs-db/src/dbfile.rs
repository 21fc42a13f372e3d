//! Local database file codec: the on-disk image of a backup,
//! byte-identical in layout to the device's own on-wire database image.
//! Writes are always staged to `<path>.XXXXXX` then renamed into place
//!.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use cs_core::{DatabaseInfo, DbAttrFlags, PalmTimestamp, Record, RecordFlags, Resource};

/// Fixed header size, bytewise.
pub const HEADER_LEN: usize = 78;
const RECORD_INDEX_ENTRY_LEN: usize = 8;
const RESOURCE_INDEX_ENTRY_LEN: usize = 10;
const RESERVED_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum DbFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt database file: {0}")]
    Corrupt(&'static str),
}

/// Either a record database or a resource database's contents. The
/// Reconciler never runs on the `Resources` variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbContents {
    Records(Vec<Record>),
    Resources(Vec<Resource>),
}

/// The full in-memory image of a local backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDatabase {
    pub info: DatabaseInfo,
    pub unique_id_seed: u32,
    pub next_record_list_id: u32,
    pub appinfo: Option<Vec<u8>>,
    pub sortinfo: Option<Vec<u8>>,
    pub contents: DbContents,
}

impl LocalDatabase {
    pub fn is_resource_db(&self) -> bool {
        matches!(self.contents, DbContents::Resources(_))
    }

    /// Find a record by id. No-op / `None` for resource databases.
    pub fn find_by_id(&self, id: u32) -> Option<&Record> {
        match &self.contents {
            DbContents::Records(records) => records.iter().find(|r| r.id == id),
            DbContents::Resources(_) => None,
        }
    }

    pub fn find_by_id_mut(&mut self, id: u32) -> Option<&mut Record> {
        match &mut self.contents {
            DbContents::Records(records) => records.iter_mut().find(|r| r.id == id),
            DbContents::Resources(_) => None,
        }
    }

    /// Append a record at the tail, preserving existing order.
    pub fn append(&mut self, record: Record) {
        if let DbContents::Records(records) = &mut self.contents {
            records.push(record);
        }
    }

    /// Insert `new` immediately after the record with id `after_id`, or at
    /// the tail if not found.
    pub fn insert_after(&mut self, after_id: u32, new: Record) {
        if let DbContents::Records(records) = &mut self.contents {
            match records.iter().position(|r| r.id == after_id) {
                Some(pos) => records.insert(pos + 1, new),
                None => records.push(new),
            }
        }
    }

    pub fn delete_by_id(&mut self, id: u32) -> Option<Record> {
        if let DbContents::Records(records) = &mut self.contents {
            let pos = records.iter().position(|r| r.id == id)?;
            Some(records.remove(pos))
        } else {
            None
        }
    }

    pub fn copy_record(&self, id: u32) -> Option<Record> {
        self.find_by_id(id).cloned()
    }

    pub fn records(&self) -> &[Record] {
        match &self.contents {
            DbContents::Records(records) => records,
            DbContents::Resources(_) => &[],
        }
    }
}

/// Read a local database file.
pub fn read(path: &Path) -> Result<LocalDatabase, DbFileError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    parse(&bytes)
}

fn parse(bytes: &[u8]) -> Result<LocalDatabase, DbFileError> {
    if bytes.len() < HEADER_LEN {
        return Err(DbFileError::Corrupt("file shorter than fixed header"));
    }

    let name_bytes = &bytes[0..32];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(32);
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

    let attributes = DbAttrFlags::from_wire(be_u16(bytes, 32));
    let version = be_u16(bytes, 34);
    let creation_time = PalmTimestamp(be_u32(bytes, 36));
    let modification_time = PalmTimestamp(be_u32(bytes, 40));
    let backup_time = PalmTimestamp(be_u32(bytes, 44));
    let modnum = be_u32(bytes, 48);
    let appinfo_offset = be_u32(bytes, 52) as usize;
    let sortinfo_offset = be_u32(bytes, 56) as usize;
    let db_type = be_u32(bytes, 60);
    let creator = be_u32(bytes, 64);
    let unique_id_seed = be_u32(bytes, 68);
    let next_record_list_id = be_u32(bytes, 72);
    let record_count = be_u16(bytes, 76) as usize;

    let is_resource = attributes.resource_db;
    let entry_len = if is_resource { RESOURCE_INDEX_ENTRY_LEN } else { RECORD_INDEX_ENTRY_LEN };
    let index_start = HEADER_LEN;
    let index_len = record_count * entry_len;
    let index_end = index_start + index_len;
    if bytes.len() < index_end + RESERVED_LEN {
        return Err(DbFileError::Corrupt("truncated record index"));
    }

    struct IndexEntry {
        offset: usize,
        attr_or_type: u32,
        id_or_id16: u32,
    }
    let mut entries = Vec::with_capacity(record_count);
    for i in 0..record_count {
        let base = index_start + i * entry_len;
        if is_resource {
            let res_type = be_u32(bytes, base);
            let id = be_u16(bytes, base + 4) as u32;
            let offset = be_u32(bytes, base + 6) as usize;
            entries.push(IndexEntry { offset, attr_or_type: res_type, id_or_id16: id });
        } else {
            let offset = be_u32(bytes, base) as usize;
            let attr = bytes[base + 4] as u32;
            let id = (u32::from(bytes[base + 5]) << 16) | (u32::from(bytes[base + 6]) << 8) | u32::from(bytes[base + 7]);
            entries.push(IndexEntry { offset, attr_or_type: attr, id_or_id16: id });
        }
    }

    // Validate offsets are strictly increasing and reference valid
    // locations.
    let mut prev = 0usize;
    for (i, e) in entries.iter().enumerate() {
        if e.offset < prev || (i == 0 && e.offset < index_end + RESERVED_LEN) {
            return Err(DbFileError::Corrupt("record index offsets not strictly increasing"));
        }
        prev = e.offset;
    }

    let blob_area_start = index_end + RESERVED_LEN;
    let first_record_offset = entries.first().map(|e| e.offset).unwrap_or(bytes.len());

    let appinfo = if appinfo_offset != 0 {
        let end = if sortinfo_offset != 0 {
            sortinfo_offset
        } else {
            first_record_offset
        };
        Some(slice(bytes, appinfo_offset, end)?)
    } else {
        None
    };
    let sortinfo = if sortinfo_offset != 0 {
        Some(slice(bytes, sortinfo_offset, first_record_offset)?)
    } else {
        None
    };
    let _ = blob_area_start;

    let contents = if is_resource {
        let mut resources = Vec::with_capacity(record_count);
        for (i, e) in entries.iter().enumerate() {
            let end = entries.get(i + 1).map(|n| n.offset).unwrap_or(bytes.len());
            let data = slice(bytes, e.offset, end)?;
            resources.push(Resource {
                res_type: e.attr_or_type,
                id: e.id_or_id16 as u16,
                data,
            });
        }
        DbContents::Resources(resources)
    } else {
        let mut records = Vec::with_capacity(record_count);
        for (i, e) in entries.iter().enumerate() {
            let end = entries.get(i + 1).map(|n| n.offset).unwrap_or(bytes.len());
            let data = slice(bytes, e.offset, end)?;
            let (flags, category) = RecordFlags::from_wire_octet(e.attr_or_type as u8);
            records.push(Record {
                id: e.id_or_id16,
                category,
                flags,
                data,
            });
        }
        DbContents::Records(records)
    };

    Ok(LocalDatabase {
        info: DatabaseInfo {
            name,
            creator,
            db_type,
            attributes,
            version,
            modnum,
            creation_time,
            modification_time,
            backup_time,
        },
        unique_id_seed,
        next_record_list_id,
        appinfo,
        sortinfo,
        contents,
    })
}

fn slice(bytes: &[u8], start: usize, end: usize) -> Result<Vec<u8>, DbFileError> {
    if end < start || end > bytes.len() {
        return Err(DbFileError::Corrupt("blob references out-of-range offset"));
    }
    Ok(bytes[start..end].to_vec())
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Serialize `db` to bytes in the same layout [`read`] expects.
pub fn serialize(db: &LocalDatabase) -> Vec<u8> {
    let is_resource = db.is_resource_db();
    let entry_len = if is_resource { RESOURCE_INDEX_ENTRY_LEN } else { RECORD_INDEX_ENTRY_LEN };
    let record_count = match &db.contents {
        DbContents::Records(r) => r.len(),
        DbContents::Resources(r) => r.len(),
    };

    let index_start = HEADER_LEN;
    let index_end = index_start + record_count * entry_len;
    let blob_start = index_end + RESERVED_LEN;

    let appinfo_offset = if db.appinfo.is_some() { blob_start } else { 0 };
    let sortinfo_offset = if db.sortinfo.is_some() {
        appinfo_offset.max(blob_start) + db.appinfo.as_ref().map(|b| b.len()).unwrap_or(0)
    } else {
        0
    };
    let records_start = blob_start
        + db.appinfo.as_ref().map(|b| b.len()).unwrap_or(0)
        + db.sortinfo.as_ref().map(|b| b.len()).unwrap_or(0);

    let mut out = vec![0u8; HEADER_LEN];
    let mut name_bytes = [0u8; 32];
    let name_raw = db.info.name.as_bytes();
    let copy_len = name_raw.len().min(31);
    name_bytes[..copy_len].copy_from_slice(&name_raw[..copy_len]);
    out[0..32].copy_from_slice(&name_bytes);
    out[32..34].copy_from_slice(&db.info.attributes.to_wire().to_be_bytes());
    out[34..36].copy_from_slice(&db.info.version.to_be_bytes());
    out[36..40].copy_from_slice(&db.info.creation_time.0.to_be_bytes());
    out[40..44].copy_from_slice(&db.info.modification_time.0.to_be_bytes());
    out[44..48].copy_from_slice(&db.info.backup_time.0.to_be_bytes());
    out[48..52].copy_from_slice(&db.info.modnum.to_be_bytes());
    out[52..56].copy_from_slice(&(appinfo_offset as u32).to_be_bytes());
    out[56..60].copy_from_slice(&(sortinfo_offset as u32).to_be_bytes());
    out[60..64].copy_from_slice(&db.info.db_type.to_be_bytes());
    out[64..68].copy_from_slice(&db.info.creator.to_be_bytes());
    out[68..72].copy_from_slice(&db.unique_id_seed.to_be_bytes());
    out[72..76].copy_from_slice(&db.next_record_list_id.to_be_bytes());
    out[76..78].copy_from_slice(&(record_count as u16).to_be_bytes());

    // Index, with offsets computed against the final payload layout.
    let mut payloads: Vec<&[u8]> = Vec::with_capacity(record_count);
    let mut index_bytes = Vec::with_capacity(record_count * entry_len);
    let mut cursor = records_start;
    match &db.contents {
        DbContents::Records(records) => {
            for r in records {
                index_bytes.extend_from_slice(&(cursor as u32).to_be_bytes());
                let attr_octet = r.flags.to_wire_octet(r.category);
                index_bytes.push(attr_octet);
                let id = r.id & 0x00FF_FFFF;
                index_bytes.push((id >> 16) as u8);
                index_bytes.push((id >> 8) as u8);
                index_bytes.push(id as u8);
                payloads.push(&r.data);
                cursor += r.data.len();
            }
        }
        DbContents::Resources(resources) => {
            for res in resources {
                index_bytes.extend_from_slice(&res.res_type.to_be_bytes());
                index_bytes.extend_from_slice(&res.id.to_be_bytes());
                index_bytes.extend_from_slice(&(cursor as u32).to_be_bytes());
                payloads.push(&res.data);
                cursor += res.data.len();
            }
        }
    }

    out.extend_from_slice(&index_bytes);
    out.extend_from_slice(&[0u8; RESERVED_LEN]);
    if let Some(appinfo) = &db.appinfo {
        out.extend_from_slice(appinfo);
    }
    if let Some(sortinfo) = &db.sortinfo {
        out.extend_from_slice(sortinfo);
    }
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    out
}

/// Write `db` atomically: serialize to a `<path>.XXXXXX` staging file in
/// the same directory, then `rename()` into place.
pub fn write(path: &Path, db: &LocalDatabase) -> Result<(), DbFileError> {
    let bytes = serialize(db);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staging = tempfile_in(dir)?;
    staging.1.write_all(&bytes)?;
    staging.1.sync_all()?;
    fs::rename(&staging.0, path)?;
    Ok(())
}

fn tempfile_in(dir: &Path) -> Result<(PathBuf, File), io::Error> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let candidate = dir.join(format!(".staging-{:08x}", nonce ^ std::process::id()));
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&candidate)?;
    Ok((candidate, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_core::{DbAttrFlags, RecordFlags};

    fn sample_db() -> LocalDatabase {
        LocalDatabase {
            info: DatabaseInfo {
                name: "Memo".into(),
                creator: 0x6D656D6F,
                db_type: 0x44415441,
                attributes: DbAttrFlags::default(),
                version: 1,
                modnum: 0,
                creation_time: PalmTimestamp(0),
                modification_time: PalmTimestamp(0),
                backup_time: PalmTimestamp(0),
            },
            unique_id_seed: 4,
            next_record_list_id: 0,
            appinfo: Some(vec![1, 2, 3, 4]),
            sortinfo: None,
            contents: DbContents::Records(vec![
                Record { id: 1, category: 0, flags: RecordFlags::default(), data: b"a".to_vec() },
                Record { id: 2, category: 0, flags: RecordFlags::default(), data: b"bb".to_vec() },
                Record { id: 3, category: 1, flags: RecordFlags { private: true, ..Default::default() }, data: vec![] },
            ]),
        }
    }

    #[test]
    fn write_then_read_roundtrips_bytewise() {
        let db = sample_db();
        let bytes = serialize(&db);
        let reparsed = parse(&bytes).unwrap();
        assert_eq!(reparsed, db);
    }

    #[test]
    fn header_is_exactly_78_bytes() {
        let db = sample_db();
        let bytes = serialize(&db);
        assert_eq!(&bytes[78..78], &[] as &[u8]); // sanity: index starts right at 78
        assert!(bytes.len() > HEADER_LEN);
    }

    #[test]
    fn atomic_write_then_read_via_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Memo.pdb");
        let db = sample_db();
        write(&path, &db).unwrap();
        let reread = read(&path).unwrap();
        assert_eq!(reread, db);
        // no leftover staging file
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "Memo.pdb")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let err = parse(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, DbFileError::Corrupt(_)));
    }

    #[test]
    fn resource_db_roundtrips() {
        let db = LocalDatabase {
            info: DatabaseInfo {
                name: "Calculator".into(),
                creator: 0x63616C63,
                db_type: 0x61707068,
                attributes: DbAttrFlags { resource_db: true, ..Default::default() },
                version: 0,
                modnum: 0,
                creation_time: PalmTimestamp(0),
                modification_time: PalmTimestamp(0),
                backup_time: PalmTimestamp(0),
            },
            unique_id_seed: 0,
            next_record_list_id: 0,
            appinfo: None,
            sortinfo: None,
            contents: DbContents::Resources(vec![Resource { res_type: 0x54414D31, id: 1000, data: vec![0xAB; 12] }]),
        };
        let bytes = serialize(&db);
        let reparsed = parse(&bytes).unwrap();
        assert_eq!(reparsed, db);
    }
}
