//! The transport seam: `io_drain`, `io_close`,
//! `io_setspeed`, and `dlp.{read,write}` in the source are four function
//! pointers bolted onto whatever device handle was opened. Here they become
//! one narrow trait with three implementations. Everything above this line
//! (Framer, Assembler, Transactor, Commander) is transport-agnostic.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::time::Duration;

/// Default bit rate proposed during wakeup negotiation.
pub const DEFAULT_NEGOTIATED_RATE: u32 = 38_400;

/// A byte-level duplex link to the device. Framing, CRC, and packet
/// assembly all live one layer up; a `Transport` only knows how to move
/// bytes and (for serial links) renegotiate its bit rate.
pub trait Transport: Read + Write {
    /// Renegotiate the link's bit rate after a successful wakeup handshake.
    /// USB and TCP transports treat this as a no-op since their effective
    /// throughput isn't governed by a serial baud rate.
    fn set_speed(&mut self, bps: u32) -> io::Result<()>;

    /// Flush any buffered output and wait for in-flight bytes to physically
    /// leave, used when draining the link after `end_of_sync`.
    fn drain(&mut self) -> io::Result<()>;

    /// Tear down the transport. Idempotent.
    fn close(&mut self) -> io::Result<()>;

    /// Bound how long a `read` may block, used by the Framer to implement
    /// the 2s post-first-byte timeout.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// A serial link, 8N1, starting at 9600 bit/s.
#[cfg(unix)]
pub struct SerialTransport {
    file: std::fs::File,
}

#[cfg(unix)]
impl SerialTransport {
    pub fn open(path: &str) -> io::Result<Self> {
        use std::fs::OpenOptions;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut transport = SerialTransport { file };
        transport.set_speed(9600)?;
        Ok(transport)
    }

    fn fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.file.as_raw_fd()
    }
}

#[cfg(unix)]
impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(unix)]
impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(unix)]
impl Transport for SerialTransport {
    fn set_speed(&mut self, bps: u32) -> io::Result<()> {
        use nix::sys::termios::{self, BaudRate, SetArg};

        let baud = baud_rate_for(bps)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unsupported baud rate"))?;

        let mut tio = termios::tcgetattr(&self.file).map_err(nix_to_io)?;
        termios::cfmakeraw(&mut tio);
        tio.control_flags.remove(termios::ControlFlags::CSTOPB); // 8N1
        termios::cfsetspeed(&mut tio, baud).map_err(nix_to_io)?;
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &tio).map_err(nix_to_io)?;
        let _ = self.fd();
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        self.file.flush()?;
        nix::sys::termios::tcdrain(&self.file).map_err(nix_to_io)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        // Plain files don't support SO_RCVTIMEO; the Framer enforces its
        // own deadline around `recv()` instead for this transport.
        Ok(())
    }
}

#[cfg(unix)]
fn baud_rate_for(bps: u32) -> Option<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate::*;
    Some(match bps {
        1200 => B1200,
        2400 => B2400,
        4800 => B4800,
        9600 => B9600,
        19200 => B19200,
        38400 => B38400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        57600 => nix::sys::termios::BaudRate::B57600,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        115200 => nix::sys::termios::BaudRate::B115200,
        _ => return None,
    })
}

#[cfg(unix)]
fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// A USB link. Logically the same framer sits above it; in practice this
/// wraps whatever character device the kernel driver exposes for the
/// device's USB endpoint, so most of the implementation is shared with
/// [`SerialTransport`] minus the baud-rate concept.
#[cfg(unix)]
pub struct UsbTransport {
    file: std::fs::File,
}

#[cfg(unix)]
impl UsbTransport {
    pub fn open(path: &str) -> io::Result<Self> {
        use std::fs::OpenOptions;
        Ok(UsbTransport {
            file: OpenOptions::new().read(true).write(true).open(path)?,
        })
    }
}

#[cfg(unix)]
impl Read for UsbTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[cfg(unix)]
impl Write for UsbTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(unix)]
impl Transport for UsbTransport {
    fn set_speed(&mut self, _bps: u32) -> io::Result<()> {
        // USB endpoints have no serial notion of bit rate; negotiation is a
        // no-op that the Session layer still goes through uniformly.
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

/// A TCP link, reached via a UDP wakeup handshake: a magic `0xFADE`
/// datagram is sent to UDP port 14237 up to three times; on ack, the peer
/// opens TCP to port 14238 and normal framing proceeds.
pub struct TcpTransport {
    stream: TcpStream,
}

const NETSYNC_MAGIC: u16 = 0xFADE;
const NETSYNC_WAKEUP_PORT: u16 = 14237;
const NETSYNC_DATA_PORT: u16 = 14238;
const NETSYNC_TYPE_WAKEUP: u8 = 1;
const NETSYNC_TYPE_ACK: u8 = 2;

impl TcpTransport {
    /// Perform the pre-handshake UDP wakeup against `peer`, then accept the
    /// resulting TCP connection on `NETSYNC_DATA_PORT`.
    pub fn wakeup(
        peer: Ipv4Addr,
        host_id: u32,
        netmask: Ipv4Addr,
        hostname: &str,
    ) -> io::Result<Self> {
        let udp = UdpSocket::bind("0.0.0.0:0")?;
        udp.set_read_timeout(Some(Duration::from_secs(2)))?;
        let dest = SocketAddr::V4(SocketAddrV4::new(peer, NETSYNC_WAKEUP_PORT));

        let mut datagram = Vec::with_capacity(16 + hostname.len() + 1);
        datagram.extend_from_slice(&NETSYNC_MAGIC.to_be_bytes());
        datagram.push(NETSYNC_TYPE_WAKEUP);
        datagram.push(0); // reserved
        datagram.extend_from_slice(&host_id.to_be_bytes());
        datagram.extend_from_slice(&u32::from_be_bytes(netmask.octets()).to_be_bytes());
        datagram.extend_from_slice(hostname.as_bytes());
        datagram.push(0);

        let mut acked = false;
        let mut buf = [0u8; 512];
        for attempt in 0..3 {
            udp.send_to(&datagram, dest)?;
            match udp.recv_from(&mut buf) {
                Ok((n, _from)) if n >= 4 => {
                    let magic = u16::from_be_bytes([buf[0], buf[1]]);
                    if magic == NETSYNC_MAGIC && buf[2] == NETSYNC_TYPE_ACK {
                        acked = true;
                        break;
                    }
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    tracing::debug!(attempt, "netsync wakeup ack not received, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        if !acked {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no wakeup ack after 3 attempts",
            ));
        }

        let stream = TcpStream::connect(SocketAddr::V4(SocketAddrV4::new(peer, NETSYNC_DATA_PORT)))?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn set_speed(&mut self, _bps: u32) -> io::Result<()> {
        // TCP has no bit-rate concept; negotiation is a no-op here too.
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}
