//! Session lifecycle: `Closed -> Awaiting-Wakeup -> Negotiating
//! -> Live -> Draining -> Closed`. Modeled as a small state machine owning
//! whichever layer of the protocol stack is alive at each stage, so it's
//! impossible to call a Commander operation before the wakeup/negotiate
//! handshake has completed.

use std::time::Duration;

use thiserror::Error;

use cs_core::CoreError;
use cs_proto::{Assembler, Framer, FramerError, Transactor, Transport, DEFAULT_NEGOTIATED_RATE};

use crate::commander::Commander;
use crate::types::EndOfSyncStatus;

const SOCKET_CMP: u8 = 0x01;
const CMP_WAKEUP: u8 = 1;
const CMP_INIT: u8 = 2;

/// How long the host will wait for a wakeup packet before giving up. The
/// source waits indefinitely; this implementation bounds it so a daemon
/// process doesn't block forever on a dead listener (documented deviation,
/// see DESIGN.md).
const WAKEUP_POLL_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    AwaitingWakeup,
    Live,
    Draining,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] FramerError),
    #[error("I/O error negotiating link speed: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation not valid in the session's current state")]
    WrongState,
    #[error("no wakeup packet received within the polling window")]
    NoWakeup,
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Link(_) => CoreError::Link(e.to_string()),
            SessionError::Io(_) => CoreError::Link(e.to_string()),
            SessionError::WrongState => CoreError::Local(e.to_string()),
            SessionError::NoWakeup => CoreError::LostConnection,
        }
    }
}

enum Stage<T> {
    AwaitingWakeup(Framer<T>),
    Live(Commander<T>),
    Draining(Commander<T>),
    Closed,
}

pub struct Session<T> {
    stage: Stage<T>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Session { stage: Stage::AwaitingWakeup(Framer::new(transport)) }
    }

    pub fn state(&self) -> SessionState {
        match &self.stage {
            Stage::AwaitingWakeup(_) => SessionState::AwaitingWakeup,
            Stage::Live(_) => SessionState::Live,
            Stage::Draining(_) => SessionState::Draining,
            Stage::Closed => SessionState::Closed,
        }
    }

    /// Wait for a well-formed wakeup packet, discarding everything else
    ///. Frame-level read timeouts are not wakeup failures; only
    /// [`WAKEUP_POLL_TIMEOUT`] worth of them in a row gives up.
    fn await_wakeup(framer: &mut Framer<T>) -> Result<(), SessionError> {
        let deadline = std::time::Instant::now() + WAKEUP_POLL_TIMEOUT;
        loop {
            match framer.recv() {
                Ok(frame) if frame.packet_type == CMP_WAKEUP => return Ok(()),
                Ok(_other) => continue,
                Err(FramerError::Timeout) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(SessionError::NoWakeup);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the full `Awaiting-Wakeup -> Negotiating -> Live` handshake:
    /// block for the wakeup packet, propose `preferred_rate`, and adopt
    /// whatever rate the device accepts.
    pub fn establish(mut self, preferred_rate: u32) -> Result<Self, SessionError> {
        let mut framer = match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::AwaitingWakeup(f) => f,
            _ => return Err(SessionError::WrongState),
        };

        Self::await_wakeup(&mut framer)?;

        framer.send(SOCKET_CMP, SOCKET_CMP, CMP_INIT, 0, &preferred_rate.to_be_bytes())?;
        let accepted_rate = match framer.recv() {
            Ok(frame) if frame.packet_type == CMP_INIT && frame.body.len() >= 4 => {
                u32::from_be_bytes(frame.body[0..4].try_into().unwrap())
            }
            Ok(_) => preferred_rate,
            Err(FramerError::Timeout) => preferred_rate,
            Err(e) => return Err(e.into()),
        };
        framer.transport_mut().set_speed(accepted_rate)?;

        let commander = Commander::new(Transactor::new(Assembler::new(framer)));
        self.stage = Stage::Live(commander);
        Ok(self)
    }

    pub fn establish_default(self) -> Result<Self, SessionError> {
        self.establish(DEFAULT_NEGOTIATED_RATE)
    }

    pub fn commander_mut(&mut self) -> Result<&mut Commander<T>, SessionError> {
        match &mut self.stage {
            Stage::Live(c) => Ok(c),
            _ => Err(SessionError::WrongState),
        }
    }

    /// Sends `end_of_sync` (unless `link_already_dead`), then moves to
    /// `Draining`. `end_of_sync` is sent exactly once, and a known-dead
    /// link skips it entirely.
    pub fn end_of_sync(mut self, status: EndOfSyncStatus, link_already_dead: bool) -> Result<Self, SessionError> {
        let mut commander = match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Live(c) => c,
            _ => return Err(SessionError::WrongState),
        };
        if !link_already_dead {
            let _ = commander.end_of_sync(status);
        }
        self.stage = Stage::Draining(commander);
        Ok(self)
    }

    /// Flush any queued bytes and tear down the transport, completing the
    /// `Draining -> Closed` transition.
    pub fn close(mut self) -> Result<(), SessionError> {
        let commander = match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Draining(c) => c,
            Stage::Live(c) => c,
            Stage::Closed => return Ok(()),
            Stage::AwaitingWakeup(_) => return Err(SessionError::WrongState),
        };
        let mut commander = commander;
        let transport = commander.transactor_mut().assembler_mut().framer_mut().transport_mut();
        transport.drain()?;
        transport.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    #[derive(Default)]
    struct FakeLink {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        speed: Option<u32>,
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.inbound.len());
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for FakeLink {
        fn set_speed(&mut self, bps: u32) -> io::Result<()> {
            self.speed = Some(bps);
            Ok(())
        }
        fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn encode_frame(dst: u8, src: u8, packet_type: u8, xid: u8, body: &[u8]) -> Vec<u8> {
        let mut framer = Framer::new(FakeLink::default());
        framer.send(dst, src, packet_type, xid, body).unwrap();
        framer.transport_mut().outbound.clone()
    }

    #[test]
    fn establish_moves_from_awaiting_wakeup_to_live() {
        let mut link = FakeLink::default();
        link.inbound.extend(encode_frame(SOCKET_CMP, SOCKET_CMP, CMP_WAKEUP, 0, &[]));
        link.inbound.extend(encode_frame(SOCKET_CMP, SOCKET_CMP, CMP_INIT, 0, &57_600u32.to_be_bytes()));

        let session = Session::new(link);
        assert_eq!(session.state(), SessionState::AwaitingWakeup);
        let session = session.establish(57_600).unwrap();
        assert_eq!(session.state(), SessionState::Live);
    }

    #[test]
    fn non_wakeup_frames_before_the_real_wakeup_are_discarded() {
        let mut link = FakeLink::default();
        link.inbound.extend(encode_frame(SOCKET_CMP, SOCKET_CMP, 99, 0, b"noise"));
        link.inbound.extend(encode_frame(SOCKET_CMP, SOCKET_CMP, CMP_WAKEUP, 0, &[]));
        link.inbound.extend(encode_frame(SOCKET_CMP, SOCKET_CMP, CMP_INIT, 0, &38_400u32.to_be_bytes()));

        let session = Session::new(link).establish(38_400).unwrap();
        assert_eq!(session.state(), SessionState::Live);
    }

    #[test]
    fn commander_mut_fails_before_live() {
        let link = FakeLink::default();
        let mut session = Session::new(link);
        assert!(session.commander_mut().is_err());
    }
}
