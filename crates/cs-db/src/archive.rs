//! Archive file codec: the append-only sink for records the
//! Reconciler deletes-with-archive. One archive file per local database,
//! created lazily on first write, never truncated or rewritten in place.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use cs_core::Record;

pub const MAGIC: &[u8; 8] = b"ColdArch";
pub const HEADER_LEN: usize = 32;
const NAME_FIELD_LEN: usize = 8;
const FORMAT_VERSION: u32 = 1;
const RECORD_HEADER_LEN: usize = 1 + 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArchiveRecordType {
    Plain = 0,
    Resource = 1,
    AppInfo = 2,
    SortInfo = 3,
}

impl ArchiveRecordType {
    fn from_tag(tag: u8) -> Result<Self, ArchiveError> {
        match tag {
            0 => Ok(ArchiveRecordType::Plain),
            1 => Ok(ArchiveRecordType::Resource),
            2 => Ok(ArchiveRecordType::AppInfo),
            3 => Ok(ArchiveRecordType::SortInfo),
            other => Err(ArchiveError::Corrupt(format!("unknown archive record type tag {other}"))),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt archive file: {0}")]
    Corrupt(String),
    #[error("archive directory is not writable: {0}")]
    NotWritable(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub name: String,
    pub db_type: u32,
    pub creator: u32,
}

impl ArchiveHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(MAGIC);
        out[8..10].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
        out[10..12].copy_from_slice(&0u16.to_be_bytes()); // flags, unused
        out[12..16].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        let name_bytes = self.name.as_bytes();
        let copy_len = name_bytes.len().min(NAME_FIELD_LEN);
        out[16..16 + copy_len].copy_from_slice(&name_bytes[..copy_len]);
        out[24..28].copy_from_slice(&self.db_type.to_be_bytes());
        out[28..32].copy_from_slice(&self.creator.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, ArchiveError> {
        if &bytes[0..8] != MAGIC {
            return Err(ArchiveError::Corrupt("bad magic".into()));
        }
        let name_end = bytes[16..24].iter().position(|&b| b == 0).map(|p| 16 + p).unwrap_or(24);
        let name = String::from_utf8_lossy(&bytes[16..name_end]).into_owned();
        let db_type = u32::from_be_bytes(bytes[24..28].try_into().unwrap());
        let creator = u32::from_be_bytes(bytes[28..32].try_into().unwrap());
        Ok(ArchiveHeader { name, db_type, creator })
    }
}

/// One archived item: a record (or, in principle, an appinfo/sortinfo
/// snapshot) plus the Unix time it was archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub kind: ArchiveRecordType,
    pub archived_at_unix: i64,
    pub data: Vec<u8>,
}

/// Handle onto one database's archive file. Created lazily: the file does
/// not exist on disk until the first call to [`ArchiveFile::open_or_create`]
/// is followed by a write.
pub struct ArchiveFile {
    path: PathBuf,
    header: ArchiveHeader,
}

impl ArchiveFile {
    /// Verify the archive directory accepts a zero-length probe write,
    /// surfacing an unwritable directory before any record is processed.
    pub fn check_writable(dir: &Path) -> Result<(), ArchiveError> {
        let probe = dir.join(format!(".writable-probe-{}", std::process::id()));
        match OpenOptions::new().write(true).create_new(true).open(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                Ok(())
            }
            Err(_) => Err(ArchiveError::NotWritable(dir.to_path_buf())),
        }
    }

    /// Open an existing archive file, or lazily prepare to create one at
    /// `path` with the given header metadata. Nothing is written to disk
    /// until [`ArchiveFile::append`] is first called.
    pub fn open_or_create(path: &Path, header: ArchiveHeader) -> Result<Self, ArchiveError> {
        if path.exists() {
            let mut f = File::open(path)?;
            let mut buf = [0u8; HEADER_LEN];
            f.read_exact(&mut buf)?;
            let on_disk = ArchiveHeader::decode(&buf)?;
            return Ok(ArchiveFile { path: path.to_path_buf(), header: on_disk });
        }
        Ok(ArchiveFile { path: path.to_path_buf(), header })
    }

    fn ensure_file_exists(&self) -> Result<File, ArchiveError> {
        if self.path.exists() {
            Ok(OpenOptions::new().append(true).open(&self.path)?)
        } else {
            let mut f = OpenOptions::new().write(true).create_new(true).open(&self.path)?;
            f.write_all(&self.header.encode())?;
            f.sync_all()?;
            Ok(OpenOptions::new().append(true).open(&self.path)?)
        }
    }

    /// Append a deleted/archived record. Creates the file (header included)
    /// on first call.
    pub fn append(&self, kind: ArchiveRecordType, archived_at_unix: i64, data: &[u8]) -> Result<(), ArchiveError> {
        let mut f = self.ensure_file_exists()?;
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
        out.push(kind as u8);
        out.push(RECORD_HEADER_LEN as u8);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&(archived_at_unix as u32).to_be_bytes());
        out.extend_from_slice(data);
        f.write_all(&out)?;
        f.sync_all()?;
        Ok(())
    }

    pub fn append_record(&self, record: &Record, archived_at_unix: i64) -> Result<(), ArchiveError> {
        self.append(ArchiveRecordType::Plain, archived_at_unix, &record.data)
    }

    /// Read every entry currently in the archive, in append order.
    pub fn read_all(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        if bytes.len() < HEADER_LEN {
            return Err(ArchiveError::Corrupt("file shorter than header".into()));
        }
        let mut entries = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < bytes.len() {
            if bytes.len() < pos + RECORD_HEADER_LEN {
                return Err(ArchiveError::Corrupt("truncated record header".into()));
            }
            let kind = ArchiveRecordType::from_tag(bytes[pos])?;
            let header_len = bytes[pos + 1] as usize;
            let data_len = u32::from_be_bytes(bytes[pos + 2..pos + 6].try_into().unwrap()) as usize;
            let ctime = u32::from_be_bytes(bytes[pos + 6..pos + 10].try_into().unwrap()) as i64;
            let data_start = pos + header_len;
            let data_end = data_start + data_len;
            if data_end > bytes.len() {
                return Err(ArchiveError::Corrupt("record data runs past end of file".into()));
            }
            entries.push(ArchiveEntry {
                kind,
                archived_at_unix: ctime,
                data: bytes[data_start..data_end].to_vec(),
            });
            pos = data_end;
        }
        Ok(entries)
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }
}
