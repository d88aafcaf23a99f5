//! # Transport Abstraction
//!
//! A minimal, async interface for moving whole frames between servers.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: `send` takes one encoded frame and `recv` yields one.
//!   Stream transports reassemble frames themselves (see `tcp`).
//! - **Opaque**: The transport never looks inside a frame.

use std::fmt;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The peer sent a frame larger than the configured maximum.
    FrameTooLarge(usize),
    /// The byte stream could not be split into frames.
    Framing(meshpack::Error),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::FrameTooLarge(len) => write!(f, "Frame of {} bytes exceeds limit", len),
            Self::Framing(e) => write!(f, "Framing error: {}", e),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<meshpack::Error> for Error {
    fn from(e: meshpack::Error) -> Self {
        match e {
            meshpack::Error::FrameTooLarge(len) => Self::FrameTooLarge(len),
            other => Self::Framing(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional pipe of encoded frames.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one encoded frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receives the next encoded frame, or `None` once the peer has closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops both directions. Pending `recv` calls return `None` or an error.
    async fn close(&self) {}
}
