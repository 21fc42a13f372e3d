//! The four-layer protocol stack plus the transport seam: byte-level
//! framing, segmentation/reassembly, and command transactions, all
//! transport-agnostic above [`transport::Transport`].

pub mod assembler;
pub mod framer;
pub mod transactor;
pub mod transport;

pub use assembler::{Assembler, AssemblerError};
pub use framer::{Frame, Framer, FramerError};
pub use transactor::{Argument, Transactor, TransactorError};
pub use transport::{Transport, DEFAULT_NEGOTIATED_RATE};

#[cfg(unix)]
pub use transport::{SerialTransport, UsbTransport};
pub use transport::TcpTransport;
