//! Segmentation and reassembly. The Transactor layer sees whole
//! datagrams tagged with a transaction id it owns; the Assembler fragments a datagram into frames the Framer can
//! carry (sharing one xid across every fragment of that datagram),
//! acknowledges each fragment, retries on timeout, and reassembles what it
//! receives.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::framer::{Frame, Framer, FramerError};

/// Maximum fragment payload size. The source negotiates this per-link; a
/// conservative fixed value keeps the Assembler transport-agnostic.
pub const MAX_FRAGMENT_SIZE: usize = 1024;

/// Default per-fragment ACK timeout.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Retransmissions attempted before giving up on a fragment.
pub const MAX_RETRIES: u32 = 10;

/// Fixed socket addressing used for the datagram layer; the Framer's own
/// address/port demux uses these for every frame this layer sends.
const SOCKET_DLP: u8 = 0x03;

/// Reserved xid used for tickles, which carry no transaction of their own.
const TICKLE_XID: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PacketType {
    Data = 1,
    Ack = 2,
    Tickle = 4,
    Abort = 8,
}

impl PacketType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Data),
            2 => Some(Self::Ack),
            4 => Some(Self::Tickle),
            8 => Some(Self::Abort),
            _ => None,
        }
    }
}

const FLAG_FIRST: u8 = 0x01;
const FLAG_LAST: u8 = 0x02;
const FLAG_MEMORY_ERROR: u8 = 0x04;

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error(transparent)]
    Framer(#[from] FramerError),
    #[error("peer unresponsive after {0} retries")]
    PeerUnresponsive(u32),
    #[error("device reported a memory error while assembling a packet")]
    DeviceMemoryError,
}

pub struct Assembler<T> {
    framer: Framer<T>,
    last_delivered_xid: Option<u8>,
    fragment_timeout: Duration,
}

impl<T: Read + Write> Assembler<T> {
    pub fn new(framer: Framer<T>) -> Self {
        Assembler {
            framer,
            last_delivered_xid: None,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
        }
    }

    pub fn framer_mut(&mut self) -> &mut Framer<T> {
        &mut self.framer
    }

    /// Fragment `datagram` into frames sharing transaction id `xid`, waiting
    /// for each fragment to be ACKed and retrying up to [`MAX_RETRIES`]
    /// times before failing.
    pub fn write(&mut self, xid: u8, datagram: &[u8]) -> Result<(), AssemblerError> {
        let chunks: Vec<&[u8]> = if datagram.is_empty() {
            vec![&[]]
        } else {
            datagram.chunks(MAX_FRAGMENT_SIZE).collect()
        };
        let total_len = datagram.len();
        let last_index = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut flags = 0u8;
            if i == 0 {
                flags |= FLAG_FIRST;
            }
            if i == last_index {
                flags |= FLAG_LAST;
            }
            let size: u16 = if i == 0 { total_len as u16 } else { chunk.len() as u16 };

            let mut body = Vec::with_capacity(4 + chunk.len());
            body.push(PacketType::Data as u8);
            body.push(flags);
            body.extend_from_slice(&size.to_be_bytes());
            body.extend_from_slice(chunk);

            self.send_fragment_with_retry(xid, &body)?;
        }
        Ok(())
    }

    fn send_fragment_with_retry(&mut self, xid: u8, body: &[u8]) -> Result<(), AssemblerError> {
        for attempt in 0..=MAX_RETRIES {
            self.framer.send(SOCKET_DLP, SOCKET_DLP, 0, xid, body)?;
            match self.await_ack(xid) {
                Ok(()) => return Ok(()),
                Err(AssemblerError::Framer(FramerError::Timeout)) => {
                    tracing::debug!(xid, attempt, "fragment unacked, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(AssemblerError::PeerUnresponsive(MAX_RETRIES))
    }

    fn await_ack(&mut self, xid: u8) -> Result<(), AssemblerError> {
        let deadline = Instant::now() + self.fragment_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(AssemblerError::Framer(FramerError::Timeout));
            }
            let frame = self.framer.recv()?;
            if frame.body.len() < 2 {
                continue;
            }
            let packet_type = PacketType::from_u8(frame.body[0]);
            if packet_type == Some(PacketType::Ack) && frame.xid == xid {
                return Ok(());
            }
            // Anything else (e.g. a stray tickle) is ignored while waiting
            // for this specific fragment's ack.
        }
    }

    /// Read and reassemble the next complete datagram, returning the
    /// transaction id it was sent under alongside its payload. Acks each
    /// fragment as it arrives and silently drops retransmitted duplicates
    /// of the last fully delivered datagram.
    pub fn read(&mut self) -> Result<(u8, Vec<u8>), AssemblerError> {
        let mut assembled = Vec::new();

        loop {
            let frame = self.recv_with_retry()?;
            if frame.body.len() < 4 {
                continue;
            }
            let packet_type = PacketType::from_u8(frame.body[0]);
            let flags = frame.body[1];
            let payload = &frame.body[4..];

            match packet_type {
                Some(PacketType::Tickle) => continue,
                Some(PacketType::Abort) => {
                    return Err(AssemblerError::PeerUnresponsive(0));
                }
                Some(PacketType::Data) => {}
                _ => continue,
            }

            if flags & FLAG_MEMORY_ERROR != 0 {
                self.ack(frame.xid)?;
                return Err(AssemblerError::DeviceMemoryError);
            }

            if flags & FLAG_FIRST != 0 && Some(frame.xid) == self.last_delivered_xid {
                // Our ack was lost and the peer retransmitted the whole
                // datagram; ack again and drop the duplicate.
                self.ack(frame.xid)?;
                continue;
            }

            if flags & FLAG_FIRST != 0 {
                assembled.clear();
            }
            assembled.extend_from_slice(payload);
            self.ack(frame.xid)?;

            if flags & FLAG_LAST != 0 {
                self.last_delivered_xid = Some(frame.xid);
                return Ok((frame.xid, assembled));
            }
        }
    }

    fn recv_with_retry(&mut self) -> Result<Frame, AssemblerError> {
        for _ in 0..=MAX_RETRIES {
            match self.framer.recv() {
                Ok(frame) => return Ok(frame),
                Err(FramerError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AssemblerError::PeerUnresponsive(MAX_RETRIES))
    }

    fn ack(&mut self, xid: u8) -> Result<(), AssemblerError> {
        let body = [PacketType::Ack as u8, FLAG_FIRST | FLAG_LAST, 0, 0];
        self.framer.send(SOCKET_DLP, SOCKET_DLP, 0, xid, &body)?;
        Ok(())
    }

    /// Send a zero-payload keepalive. Used by the Commander between long
    /// local operations to prevent the device's inactivity timeout. Not
    /// part of any transaction, so it carries no ack wait.
    pub fn tickle(&mut self) -> Result<(), AssemblerError> {
        let body = [PacketType::Tickle as u8, FLAG_FIRST | FLAG_LAST, 0, 0];
        self.framer.send(SOCKET_DLP, SOCKET_DLP, 0, TICKLE_XID, &body)?;
        Ok(())
    }
}
