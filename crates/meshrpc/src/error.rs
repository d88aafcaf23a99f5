//! # Error Definitions

use meshpack::Error as PackError;

/// Failures while turning messages into bytes or back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying meshpack layer failed (short buffer, bad prefix, ...).
    Pack(PackError),
    /// No decoder is registered for this message id.
    UnknownMessage(i32),
    /// The frame carried a different message id than the decoder expects.
    UnexpectedMessage { expected: i32, found: i32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pack(e) => write!(f, "wire error: {}", e),
            Self::UnknownMessage(id) => write!(f, "no decoder registered for message {}", id),
            Self::UnexpectedMessage { expected, found } => {
                write!(f, "expected message {}, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pack(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self {
        Self::Pack(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
