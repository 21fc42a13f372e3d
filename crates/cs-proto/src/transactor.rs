//! Command transaction layer: every command is a request
//! datagram followed by one response datagram bearing the same transaction
//! id. This module owns that transaction id counter and the request/
//! response TLV codec.

use std::io::{Read, Write};

use cs_core::CoreError;
use thiserror::Error;

use crate::assembler::{Assembler, AssemblerError};

/// A single TLV-encoded command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Argument {
    pub fn new(id: u8, data: impl Into<Vec<u8>>) -> Self {
        Argument { id, data: data.into() }
    }
}

const LONG_LENGTH_BIT: u8 = 0x80;

fn encode_args(args: &[Argument]) -> Vec<u8> {
    let mut out = Vec::new();
    for arg in args {
        let start = out.len();
        if arg.data.len() > 0xFF {
            out.push(arg.id | LONG_LENGTH_BIT);
            out.extend_from_slice(&(arg.data.len() as u16).to_be_bytes());
        } else {
            out.push(arg.id & !LONG_LENGTH_BIT);
            out.push(arg.data.len() as u8);
        }
        out.extend_from_slice(&arg.data);
        // Pad each TLV record to a 2-octet boundary.
        if (out.len() - start) % 2 != 0 {
            out.push(0);
        }
    }
    out
}

fn decode_args(mut bytes: &[u8], count: u8) -> Result<Vec<Argument>, TransactorError> {
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if bytes.is_empty() {
            return Err(TransactorError::Malformed("truncated argument id"));
        }
        let raw_id = bytes[0];
        let has_long_length = raw_id & LONG_LENGTH_BIT != 0;
        let id = raw_id & !LONG_LENGTH_BIT;
        bytes = &bytes[1..];

        let len = if has_long_length {
            if bytes.len() < 2 {
                return Err(TransactorError::Malformed("truncated long length"));
            }
            let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            bytes = &bytes[2..];
            len
        } else {
            if bytes.is_empty() {
                return Err(TransactorError::Malformed("truncated short length"));
            }
            let len = bytes[0] as usize;
            bytes = &bytes[1..];
            len
        };

        if bytes.len() < len {
            return Err(TransactorError::Malformed("argument payload truncated"));
        }
        let data = bytes[..len].to_vec();
        bytes = &bytes[len..];

        let consumed_header = if has_long_length { 3 } else { 2 };
        if (consumed_header + len) % 2 != 0 {
            if bytes.is_empty() {
                return Err(TransactorError::Malformed("missing alignment pad byte"));
            }
            bytes = &bytes[1..];
        }

        args.push(Argument { id, data });
    }
    Ok(args)
}

#[derive(Debug, Error)]
pub enum TransactorError {
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    #[error("response transaction id {got:#04x} did not match request {expected:#04x}")]
    XidMismatch { expected: u8, got: u8 },
}

impl From<TransactorError> for CoreError {
    fn from(e: TransactorError) -> Self {
        match e {
            TransactorError::Assembler(_) => CoreError::Link(e.to_string()),
            TransactorError::Malformed(_) | TransactorError::XidMismatch { .. } => {
                CoreError::Link(e.to_string())
            }
        }
    }
}

/// Drives one request/response round trip per `call()`, owning the
/// transaction id counter: it starts at 1, wraps past 0xFE back to 1, and
/// never emits 0x00 or 0xFF.
pub struct Transactor<T> {
    assembler: Assembler<T>,
    next_xid: u8,
}

impl<T: Read + Write> Transactor<T> {
    pub fn new(assembler: Assembler<T>) -> Self {
        Transactor {
            assembler,
            next_xid: 1,
        }
    }

    pub fn assembler_mut(&mut self) -> &mut Assembler<T> {
        &mut self.assembler
    }

    fn bump_xid(&mut self) -> u8 {
        let xid = self.next_xid;
        self.next_xid = if self.next_xid >= 0xFE { 1 } else { self.next_xid + 1 };
        xid
    }

    /// Issue one command and block for its response. Returns the device's
    /// 16-bit error code (0 = success) and the decoded response arguments.
    pub fn call(&mut self, cmd: u8, args: &[Argument]) -> Result<(u16, Vec<Argument>), TransactorError> {
        let xid = self.bump_xid();

        let mut request = Vec::new();
        request.push(cmd & 0x7F);
        request.push(args.len() as u8);
        request.extend_from_slice(&encode_args(args));
        self.assembler.write(xid, &request)?;

        loop {
            let (got_xid, response) = self.assembler.read()?;
            if got_xid != xid {
                tracing::warn!(expected = xid, got = got_xid, "dropping response for stale transaction");
                continue;
            }
            return decode_response(&response);
        }
    }

    pub fn tickle(&mut self) -> Result<(), TransactorError> {
        self.assembler.tickle().map_err(Into::into)
    }

    /// Send an already-encoded request body verbatim and return the raw
    /// response datagram, without decoding either side. Used by the SPC
    /// mediator to forward a
    /// conduit's preformatted transactor-level request through this
    /// connection's own transaction id sequence, so a conduit never has to
    /// (and never gets to) pick its own xid.
    pub fn call_raw(&mut self, request_body: &[u8]) -> Result<Vec<u8>, TransactorError> {
        let xid = self.bump_xid();
        self.assembler.write(xid, request_body)?;
        loop {
            let (got_xid, response) = self.assembler.read()?;
            if got_xid != xid {
                tracing::warn!(expected = xid, got = got_xid, "dropping response for stale transaction");
                continue;
            }
            return Ok(response);
        }
    }
}

fn decode_response(bytes: &[u8]) -> Result<(u16, Vec<Argument>), TransactorError> {
    if bytes.len() < 4 {
        return Err(TransactorError::Malformed("response shorter than header"));
    }
    let _cmd = bytes[0]; // bit 7 set on responses; not otherwise validated here
    let argcount = bytes[1];
    let error = u16::from_be_bytes([bytes[2], bytes[3]]);
    let args = decode_args(&bytes[4..], argcount)?;
    Ok((error, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_argument_roundtrips() {
        let args = vec![Argument::new(1, vec![1, 2, 3])];
        let encoded = encode_args(&args);
        let decoded = decode_args(&encoded, 1).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn long_form_argument_used_above_0xff_bytes() {
        let big = vec![7u8; 300];
        let args = vec![Argument::new(2, big.clone())];
        let encoded = encode_args(&args);
        assert_eq!(encoded[0] & LONG_LENGTH_BIT, LONG_LENGTH_BIT);
        let decoded = decode_args(&encoded, 1).unwrap();
        assert_eq!(decoded[0].data, big);
    }

    #[test]
    fn multiple_arguments_each_pad_independently() {
        let args = vec![Argument::new(1, vec![1, 2, 3]), Argument::new(2, vec![9])];
        let encoded = encode_args(&args);
        let decoded = decode_args(&encoded, 2).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn response_header_decodes_error_and_argcount() {
        let mut bytes = vec![0x81, 1, 0x00, 0x03];
        bytes.extend(encode_args(&[Argument::new(5, vec![0xAA])]));
        let (error, args) = decode_response(&bytes).unwrap();
        assert_eq!(error, 3);
        assert_eq!(args, vec![Argument::new(5, vec![0xAA])]);
    }

    #[test]
    fn xid_wraps_from_0xfe_to_0x01() {
        let mut t = Transactor {
            assembler: dummy_assembler(),
            next_xid: 0xFE,
        };
        assert_eq!(t.bump_xid(), 0xFE);
        assert_eq!(t.bump_xid(), 0x01);
    }

    fn dummy_assembler() -> Assembler<std::io::Cursor<Vec<u8>>> {
        Assembler::new(crate::framer::Framer::new(std::io::Cursor::new(Vec::new())))
    }
}
