//! The SPC (serialized procedure call) sub-protocol, mediating
//! the socket a sync-flavor conduit uses to issue device commands through
//! the host. Grounded on `original_source/trunk/src/spc.h`'s fixed 8-octet
//! header and opcode values, which this module reproduces exactly.

use std::io::{self, Read, Write};

use thiserror::Error;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SpcOpcode {
    Nop = 0,
    DbInfo = 1,
    DlpCommand = 2,
    DlpRpc = 3,
}

impl SpcOpcode {
    pub fn from_wire(op: u16) -> Result<Self, SpcError> {
        match op {
            0 => Ok(SpcOpcode::Nop),
            1 => Ok(SpcOpcode::DbInfo),
            2 => Ok(SpcOpcode::DlpCommand),
            3 => Ok(SpcOpcode::DlpRpc),
            other => Err(SpcError::BadOpcode(other)),
        }
    }
}

/// Status codes carried in the header's second field. Zero in a request,
/// one of these in the response (constants from `spc.h`'s `SPCERR_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SpcStatus {
    Ok = 0,
    BadOpcode = 1,
    NoMem = 2,
}

#[derive(Debug, Error)]
pub enum SpcError {
    #[error("I/O error on SPC socket: {0}")]
    Io(#[from] io::Error),
    #[error("unknown SPC opcode {0}")]
    BadOpcode(u16),
    #[error("SPC body length {0} exceeds the sanity limit")]
    BodyTooLarge(u32),
}

/// Upper bound on a single SPC body, guarding against a malformed length
/// field asking for an unreasonable allocation.
const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpcHeader {
    pub op: u16,
    pub status: u16,
    pub len: u32,
}

impl SpcHeader {
    pub fn request(op: SpcOpcode, len: u32) -> Self {
        SpcHeader { op: op as u16, status: 0, len }
    }

    pub fn response(op: SpcOpcode, status: SpcStatus, len: u32) -> Self {
        SpcHeader { op: op as u16, status: status as u16, len }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.op.to_be_bytes());
        out[2..4].copy_from_slice(&self.status.to_be_bytes());
        out[4..8].copy_from_slice(&self.len.to_be_bytes());
        out
    }

    pub fn decode(bytes: [u8; HEADER_LEN]) -> Self {
        SpcHeader {
            op: u16::from_be_bytes([bytes[0], bytes[1]]),
            status: u16::from_be_bytes([bytes[2], bytes[3]]),
            len: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// A complete request or response: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpcMessage {
    pub header: SpcHeader,
    pub body: Vec<u8>,
}

/// The four-state SPC exchange machine: the SPC socket is polled for read
/// or write depending on where the current exchange stands, never both at
/// once (avoids busy-waiting on an always-writable socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpcState {
    ReadHdr,
    ReadBody { header: SpcHeader },
    WriteHdr { response: usize },
    WriteBody { response: usize, written: usize },
}

impl SpcState {
    /// Whether the dispatcher's poll loop should watch this fd for
    /// readability (vs. writability).
    pub fn wants_read(&self) -> bool {
        matches!(self, SpcState::ReadHdr | SpcState::ReadBody { .. })
    }
}

/// Blocking read/write helpers used once the poll loop has determined the
/// SPC socket is ready in the direction `SpcState` wants. Kept separate
/// from the state machine itself so the state machine stays pure and
/// testable without a real socket.
pub fn read_message<R: Read>(r: &mut R) -> Result<SpcMessage, SpcError> {
    let mut hdr_bytes = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr_bytes)?;
    let header = SpcHeader::decode(hdr_bytes);
    if header.len > MAX_BODY_LEN {
        return Err(SpcError::BodyTooLarge(header.len));
    }
    let mut body = vec![0u8; header.len as usize];
    r.read_exact(&mut body)?;
    Ok(SpcMessage { header, body })
}

pub fn write_message<W: Write>(w: &mut W, msg: &SpcMessage) -> Result<(), SpcError> {
    w.write_all(&msg.header.encode())?;
    w.write_all(&msg.body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_encode_decode() {
        let h = SpcHeader::request(SpcOpcode::DlpCommand, 42);
        assert_eq!(SpcHeader::decode(h.encode()), h);
    }

    #[test]
    fn opcode_values_match_the_original_header() {
        assert_eq!(SpcOpcode::Nop as u16, 0);
        assert_eq!(SpcOpcode::DbInfo as u16, 1);
        assert_eq!(SpcOpcode::DlpCommand as u16, 2);
        assert_eq!(SpcOpcode::DlpRpc as u16, 3);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(SpcOpcode::from_wire(99), Err(SpcError::BadOpcode(99))));
    }

    #[test]
    fn message_roundtrips_over_an_in_memory_buffer() {
        let msg = SpcMessage { header: SpcHeader::request(SpcOpcode::DbInfo, 3), body: vec![1, 2, 3] };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).unwrap();
        let mut cursor = &buf[..];
        let reread = read_message(&mut cursor).unwrap();
        assert_eq!(reread, msg);
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let mut bytes = SpcHeader::request(SpcOpcode::Nop, u32::MAX).encode().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        let mut cursor = &bytes[..];
        assert!(matches!(read_message(&mut cursor), Err(SpcError::BodyTooLarge(_))));
    }

    #[test]
    fn read_state_watches_for_read_only_in_read_states() {
        assert!(SpcState::ReadHdr.wants_read());
        assert!(!SpcState::WriteHdr { response: 0 }.wants_read());
    }
}
