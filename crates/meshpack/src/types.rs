//! Core types for the meshpack wire format

/// Largest frame body accepted by default, in bytes.
pub const DEFAULT_MAX_FRAME: usize = 4 * 1024 * 1024;

/// Size of the `[len][msg_id][seq]` frame header.
pub const FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted; `n` more bytes are required.
    Pending(usize),
    /// A length or count prefix was negative.
    NegativeLength(i64),
    /// A blob or list is too long for its length prefix.
    TooLong(usize),
    /// A frame announced a size above the configured maximum.
    FrameTooLarge(usize),
    /// A frame announced a size smaller than its own header.
    FrameTooShort(usize),
    /// Bool byte other than 0 or 1.
    InvalidBool(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Bytes left over after a complete value was decoded.
    Trailing(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(n) => write!(f, "buffer exhausted, {} more bytes required", n),
            Self::NegativeLength(n) => write!(f, "negative length prefix: {}", n),
            Self::TooLong(n) => write!(f, "value of {} elements exceeds its length prefix", n),
            Self::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds the maximum", n),
            Self::FrameTooShort(n) => write!(f, "frame of {} bytes is shorter than its header", n),
            Self::InvalidBool(b) => write!(f, "invalid bool byte: {:#04x}", b),
            Self::InvalidUtf8 => write!(f, "string data is not valid UTF-8"),
            Self::Trailing(n) => write!(f, "{} trailing bytes after value", n),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
