//! Typed high-level command interface: every device-facing
//! verb the Reconciler, Dispatcher, and Session need, each one request/
//! response round trip over the shared [`Transactor`].

use std::io::{Read, Write};

use cs_core::{CoreError, DatabaseInfo, DbAttrFlags, DeviceErrorKind, PalmTimestamp, Record, RecordFlags, Resource};
use cs_proto::{Argument, Transactor, TransactorError};
use thiserror::Error;

use crate::opcodes::Command;
use crate::types::{
    CloseFlags, DbHandle, DeleteRecordFlags, EndOfSyncStatus, OpenMode, RecordInfo, RecordPayload, StorageInfo,
    SysInfo, UserInfo, UserInfoModifyMask,
};
use crate::wire::{put_str, put_u16, put_u32, Reader, Truncated};

#[derive(Debug, Error)]
pub enum CommanderError {
    #[error(transparent)]
    Transactor(#[from] TransactorError),
    #[error("device returned an error: {0}")]
    Device(#[from] DeviceErrorKind),
    #[error("malformed command reply")]
    Malformed(#[from] Truncated),
    #[error("record or database not found")]
    NotFound,
}

impl From<CommanderError> for CoreError {
    fn from(e: CommanderError) -> Self {
        match e {
            CommanderError::Transactor(t) => t.into(),
            CommanderError::Device(DeviceErrorKind::Cancelled) => CoreError::CancelledByDevice,
            CommanderError::Device(kind) => CoreError::Device(kind),
            CommanderError::Malformed(_) => CoreError::Link("malformed command reply".into()),
            CommanderError::NotFound => CoreError::Device(DeviceErrorKind::NotFound),
        }
    }
}

/// Device error code reserved for "no more entries" / "not found", shared by
/// `read_db_list`, `read_next_modified_rec`, and `delete_record`'s
/// idempotent-on-miss contract.
const WIRE_ERR_NOT_FOUND: u16 = 3;

fn check(error: u16) -> Result<(), CommanderError> {
    if error == 0 {
        Ok(())
    } else {
        Err(DeviceErrorKind::from_wire(error).into())
    }
}

/// Wraps one [`Transactor`] with the full set of typed device operations.
/// Owned exclusively by the Session; shared by reference with the
/// Reconciler and the SPC mediator for the duration of one sync.
pub struct Commander<T> {
    transactor: Transactor<T>,
}

impl<T: Read + Write> Commander<T> {
    pub fn new(transactor: Transactor<T>) -> Self {
        Commander { transactor }
    }

    pub fn transactor_mut(&mut self) -> &mut Transactor<T> {
        &mut self.transactor
    }

    pub fn tickle(&mut self) -> Result<(), CommanderError> {
        self.transactor.tickle().map_err(Into::into)
    }

    /// Forward an already-encoded request body verbatim and return the raw
    /// response datagram, bypassing the typed per-command encoders/decoders
    /// above. The only caller of this is the Dispatcher's SPC mediator
    ///: a conduit preformats a transactor-level
    /// request, the host sends it on this connection's own transaction id
    /// sequence, and the conduit never touches the link directly.
    pub fn call_raw(&mut self, request_body: &[u8]) -> Result<Vec<u8>, CommanderError> {
        Ok(self.transactor.call_raw(request_body)?)
    }

    pub fn read_user_info(&mut self) -> Result<UserInfo, CommanderError> {
        let (error, args) = self.transactor.call(Command::ReadUserInfo.opcode(), &[])?;
        check(error)?;
        let body = first_arg(&args)?;
        let mut r = Reader::new(body);
        let user_id = r.u32()?;
        let viewer_id = r.u32()?;
        let last_sync_pc = r.u32()?;
        let last_sync_time = PalmTimestamp(r.u32()?);
        let last_good_sync_time = PalmTimestamp(r.u32()?);
        let name = r.str()?;
        let hash_len = r.u8()? as usize;
        let password_hash = r.bytes(hash_len)?;
        Ok(UserInfo {
            user_id,
            viewer_id,
            last_sync_pc,
            last_sync_time,
            last_good_sync_time,
            name,
            password_hash,
        })
    }

    pub fn write_user_info(&mut self, info: &UserInfo, mask: UserInfoModifyMask) -> Result<(), CommanderError> {
        let mut body = Vec::new();
        body.push(mask.to_bits());
        put_u32(&mut body, info.user_id);
        put_u32(&mut body, info.last_sync_pc);
        put_u32(&mut body, info.last_sync_time.0);
        put_u32(&mut body, info.last_good_sync_time.0);
        put_str(&mut body, &info.name);
        let (error, _) = self.transactor.call(Command::WriteUserInfo.opcode(), &[Argument::new(1, body)])?;
        check(error)
    }

    pub fn read_sys_info(&mut self) -> Result<SysInfo, CommanderError> {
        let (error, args) = self.transactor.call(Command::ReadSysInfo.opcode(), &[])?;
        check(error)?;
        let body = first_arg(&args)?;
        let mut r = Reader::new(body);
        Ok(SysInfo {
            rom_version: r.u32()?,
            locale: r.u32()?,
            product_id: r.u32()?,
            dlp_major: r.u16()?,
            dlp_minor: r.u16()?,
        })
    }

    pub fn read_storage_info(&mut self, card: u8) -> Result<StorageInfo, CommanderError> {
        let (error, args) = self.transactor.call(Command::ReadStorageInfo.opcode(), &[Argument::new(1, vec![card])])?;
        check(error)?;
        let body = first_arg(&args)?;
        let mut r = Reader::new(body);
        Ok(StorageInfo {
            card: r.u8()?,
            total_bytes: r.u32()?,
            free_bytes: r.u32()?,
            ram_db_count: r.u16()?,
            rom_db_count: r.u16()?,
            card_name: r.str()?,
            manufacturer_name: r.str()?,
        })
    }

    /// Fetch the database-list entry at `index` on `card`. Returns `None` on
    /// end-of-iteration rather than an error, so callers can loop
    /// `index, index+1, ..` until exhaustion.
    pub fn read_db_list(&mut self, card: u8, include_rom: bool, index: u16) -> Result<Option<DatabaseInfo>, CommanderError> {
        let mut req = vec![card, include_rom as u8];
        put_u16(&mut req, index);
        let (error, args) = self.transactor.call(Command::ReadDbList.opcode(), &[Argument::new(1, req)])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(None);
        }
        check(error)?;
        let body = first_arg(&args)?;
        Ok(Some(decode_db_info(body)?))
    }

    pub fn open_db(&mut self, card: u8, name: &str, mode: OpenMode) -> Result<DbHandle, CommanderError> {
        let mut req = vec![card, mode.to_bits()];
        put_str(&mut req, name);
        let (error, args) = self.transactor.call(Command::OpenDb.opcode(), &[Argument::new(1, req)])?;
        check(error)?;
        let body = first_arg(&args)?;
        Ok(DbHandle(*body.first().ok_or(Truncated)?))
    }

    pub fn close_db(&mut self, handle: DbHandle, flags: CloseFlags) -> Result<(), CommanderError> {
        let req = vec![handle.0, flags.all_dbs as u8];
        let (error, _) = self.transactor.call(Command::CloseDb.opcode(), &[Argument::new(1, req)])?;
        check(error)
    }

    pub fn create_db(&mut self, info: &DatabaseInfo, card: u8) -> Result<DbHandle, CommanderError> {
        let mut req = vec![card];
        req.extend_from_slice(&encode_db_info(info));
        let (error, args) = self.transactor.call(Command::CreateDb.opcode(), &[Argument::new(1, req)])?;
        check(error)?;
        let body = first_arg(&args)?;
        Ok(DbHandle(*body.first().ok_or(Truncated)?))
    }

    pub fn delete_db(&mut self, card: u8, name: &str) -> Result<(), CommanderError> {
        let mut req = vec![card];
        put_str(&mut req, name);
        let (error, _) = self.transactor.call(Command::DeleteDb.opcode(), &[Argument::new(1, req)])?;
        check(error)
    }

    pub fn open_conduit(&mut self) -> Result<(), CommanderError> {
        let (error, _) = self.transactor.call(Command::OpenConduit.opcode(), &[])?;
        check(error)
    }

    pub fn clean_up_database(&mut self, handle: DbHandle) -> Result<(), CommanderError> {
        let (error, _) = self.transactor.call(Command::CleanUpDatabase.opcode(), &[Argument::new(1, vec![handle.0])])?;
        check(error)
    }

    pub fn reset_sync_flags(&mut self, handle: DbHandle) -> Result<(), CommanderError> {
        let (error, _) = self.transactor.call(Command::ResetSyncFlags.opcode(), &[Argument::new(1, vec![handle.0])])?;
        check(error)
    }

    /// Returns the next record with the dirty/deleted/archive bit set,
    /// advancing the device's own iteration cursor. `open_db` resets that
    /// cursor. `Ok(None)` signals end-of-iteration.
    pub fn read_next_modified_rec(&mut self, handle: DbHandle) -> Result<Option<RecordPayload>, CommanderError> {
        let (error, args) = self.transactor.call(Command::ReadNextModifiedRec.opcode(), &[Argument::new(1, vec![handle.0])])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(None);
        }
        check(error)?;
        let body = first_arg(&args)?;
        Ok(Some(decode_record_payload(body)?))
    }

    /// Enumerate records by position rather than by modified-flag, used by
    /// FirstSync/SlowSync to download every record regardless of its
    /// dirty/clean state (see [`Command::ReadRecordByIndex`]). `Ok(None)`
    /// signals end-of-database, the same way `read_db_list` signals
    /// end-of-list.
    pub fn read_record_by_index(&mut self, handle: DbHandle, index: u16) -> Result<Option<RecordPayload>, CommanderError> {
        let mut req = vec![handle.0];
        put_u16(&mut req, index);
        let (error, args) = self.transactor.call(Command::ReadRecordByIndex.opcode(), &[Argument::new(1, req)])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(None);
        }
        check(error)?;
        let body = first_arg(&args)?;
        Ok(Some(decode_record_payload(body)?))
    }

    pub fn read_record_by_id(&mut self, handle: DbHandle, id: u32) -> Result<Option<RecordPayload>, CommanderError> {
        let mut req = vec![handle.0];
        put_u32(&mut req, id);
        let (error, args) = self.transactor.call(Command::ReadRecordById.opcode(), &[Argument::new(1, req)])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(None);
        }
        check(error)?;
        let body = first_arg(&args)?;
        Ok(Some(decode_record_payload(body)?))
    }

    /// Write (or, with `id == 0`, request assignment of) one record. Returns
    /// the id the device assigned or confirmed.
    pub fn write_record(&mut self, handle: DbHandle, id: u32, flags: RecordFlags, category: u8, data: &[u8]) -> Result<u32, CommanderError> {
        let mut req = vec![handle.0];
        put_u32(&mut req, id);
        req.push(flags.to_wire_octet(category));
        put_u32(&mut req, data.len() as u32);
        req.extend_from_slice(data);
        let (error, args) = self.transactor.call(Command::WriteRecord.opcode(), &[Argument::new(1, req)])?;
        check(error)?;
        let body = first_arg(&args)?;
        let mut r = Reader::new(body);
        Ok(r.u32()?)
    }

    /// Idempotent on a missing record: `NotFound` from the device is treated
    /// as success.
    pub fn delete_record(&mut self, handle: DbHandle, flags: DeleteRecordFlags, id: u32) -> Result<(), CommanderError> {
        let mut req = vec![handle.0, flags.all as u8, flags.archive as u8];
        put_u32(&mut req, id);
        let (error, _) = self.transactor.call(Command::DeleteRecord.opcode(), &[Argument::new(1, req)])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(());
        }
        check(error)
    }

    /// Enumerate resources by position (see [`Command::ReadResourceByIndex`]),
    /// used to download a resource database wholesale on first encounter.
    pub fn read_resource_by_index(&mut self, handle: DbHandle, index: u16) -> Result<Option<Resource>, CommanderError> {
        let mut req = vec![handle.0];
        put_u16(&mut req, index);
        let (error, args) = self.transactor.call(Command::ReadResourceByIndex.opcode(), &[Argument::new(1, req)])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(None);
        }
        check(error)?;
        let body = first_arg(&args)?;
        Ok(Some(decode_resource_payload(body)?))
    }

    pub fn write_resource(&mut self, handle: DbHandle, res_type: u32, id: u16, data: &[u8]) -> Result<(), CommanderError> {
        let mut req = vec![handle.0];
        put_u32(&mut req, res_type);
        put_u16(&mut req, id);
        req.extend_from_slice(data);
        let (error, _) = self.transactor.call(Command::WriteResource.opcode(), &[Argument::new(1, req)])?;
        check(error)
    }

    pub fn delete_resource(&mut self, handle: DbHandle, res_type: u32, id: u16) -> Result<(), CommanderError> {
        let mut req = vec![handle.0];
        put_u32(&mut req, res_type);
        put_u16(&mut req, id);
        let (error, _) = self.transactor.call(Command::DeleteResource.opcode(), &[Argument::new(1, req)])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(());
        }
        check(error)
    }

    pub fn read_appinfo_block(&mut self, handle: DbHandle) -> Result<Option<Vec<u8>>, CommanderError> {
        self.read_block(Command::ReadAppInfoBlock, handle)
    }

    pub fn write_appinfo_block(&mut self, handle: DbHandle, bytes: &[u8]) -> Result<(), CommanderError> {
        self.write_block(Command::WriteAppInfoBlock, handle, bytes)
    }

    pub fn read_sort_block(&mut self, handle: DbHandle) -> Result<Option<Vec<u8>>, CommanderError> {
        self.read_block(Command::ReadSortBlock, handle)
    }

    pub fn write_sort_block(&mut self, handle: DbHandle, bytes: &[u8]) -> Result<(), CommanderError> {
        self.write_block(Command::WriteSortBlock, handle, bytes)
    }

    fn read_block(&mut self, cmd: Command, handle: DbHandle) -> Result<Option<Vec<u8>>, CommanderError> {
        let (error, args) = self.transactor.call(cmd.opcode(), &[Argument::new(1, vec![handle.0])])?;
        if error == WIRE_ERR_NOT_FOUND {
            return Ok(None);
        }
        check(error)?;
        Ok(Some(first_arg(&args)?.to_vec()))
    }

    fn write_block(&mut self, cmd: Command, handle: DbHandle, bytes: &[u8]) -> Result<(), CommanderError> {
        let mut req = vec![handle.0];
        req.extend_from_slice(bytes);
        let (error, _) = self.transactor.call(cmd.opcode(), &[Argument::new(1, req)])?;
        check(error)
    }

    /// Must be the last command sent in a sync.
    pub fn end_of_sync(&mut self, status: EndOfSyncStatus) -> Result<(), CommanderError> {
        let (error, _) = self.transactor.call(Command::EndOfSync.opcode(), &[Argument::new(1, vec![status.to_wire()])])?;
        check(error)
    }

    /// Best-effort: a failure here must never fail the sync as a whole.
    pub fn add_sync_log(&mut self, text: &str) -> Result<(), CommanderError> {
        let mut body = Vec::new();
        put_str(&mut body, text);
        let (error, _) = self.transactor.call(Command::AddSyncLog.opcode(), &[Argument::new(1, body)])?;
        check(error)
    }
}

fn first_arg(args: &[Argument]) -> Result<&[u8], Truncated> {
    args.first().map(|a| a.data.as_slice()).ok_or(Truncated)
}

fn decode_record_payload(body: &[u8]) -> Result<RecordPayload, Truncated> {
    let mut r = Reader::new(body);
    let id = r.u32()?;
    let attr_octet = r.u8()?;
    let (flags, category) = RecordFlags::from_wire_octet(attr_octet);
    let len = r.u32()? as usize;
    let data = r.bytes(len)?;
    Ok(RecordPayload { info: RecordInfo { id, category, flags }, data })
}

fn decode_resource_payload(body: &[u8]) -> Result<Resource, Truncated> {
    let mut r = Reader::new(body);
    let res_type = r.u32()?;
    let id = r.u16()?;
    let len = r.u32()? as usize;
    let data = r.bytes(len)?;
    Ok(Resource { res_type, id, data })
}

fn decode_db_info(body: &[u8]) -> Result<DatabaseInfo, Truncated> {
    let mut r = Reader::new(body);
    let name = r.str()?;
    let creator = r.u32()?;
    let db_type = r.u32()?;
    let attributes = DbAttrFlags::from_wire(r.u16()?);
    let version = r.u16()?;
    let modnum = r.u32()?;
    let creation_time = PalmTimestamp(r.u32()?);
    let modification_time = PalmTimestamp(r.u32()?);
    let backup_time = PalmTimestamp(r.u32()?);
    Ok(DatabaseInfo {
        name,
        creator,
        db_type,
        attributes,
        version,
        modnum,
        creation_time,
        modification_time,
        backup_time,
    })
}

/// Encode a [`DatabaseInfo`] the same way the wire protocol does, exposed
/// for the Dispatcher's SPC mediator (`dbinfo` opcode) which hands a
/// conduit the current database's info without a round trip.
pub fn encode_dbinfo(info: &DatabaseInfo) -> Vec<u8> {
    encode_db_info(info)
}

fn encode_db_info(info: &DatabaseInfo) -> Vec<u8> {
    let mut out = Vec::new();
    put_str(&mut out, &info.name);
    put_u32(&mut out, info.creator);
    put_u32(&mut out, info.db_type);
    put_u16(&mut out, info.attributes.to_wire());
    put_u16(&mut out, info.version);
    put_u32(&mut out, info.modnum);
    put_u32(&mut out, info.creation_time.0);
    put_u32(&mut out, info.modification_time.0);
    put_u32(&mut out, info.backup_time.0);
    out
}

/// Record-only variant of `write_record`: also accepts `Record` values
/// directly, used by the Reconciler when replaying a local record verbatim.
pub fn write_record_value<T: Read + Write>(commander: &mut Commander<T>, handle: DbHandle, record: &Record) -> Result<u32, CommanderError> {
    commander.write_record(handle, record.id, record.flags, record.category, &record.data)
}
