//! # Meshpack
//!
//! Fixed-layout binary primitives for cluster wire messages.
//!
//! ## Philosophy
//!
//! - **Fixed Layout**: Fields have no tags. The message id in the frame header
//!   decides how the body is read.
//! - **Big-Endian**: Every integer, length and count prefix.
//! - **Bounded**: Decoding is a bounds-checked view over a borrowed slice.
//!
//! ## Format
//!
//! - **Scalars**: `bool` (1b), `i16`, `i32`, `i64`
//! - **Blobs**: `[Len: i32][Data: Len]`
//! - **Strings**: `[Len: i16][UTF-8: Len]`
//! - **Lists**: `[Count: i16][Items]`

pub mod types;
pub mod encoder;
pub mod cursor;
pub mod frame;

pub use types::Result;
pub use types::Error;
pub use types::DEFAULT_MAX_FRAME;
pub use types::FRAME_HEADER_LEN;

pub use encoder::Encoder;
pub use cursor::Cursor;

pub use frame::Frame;
pub use frame::FrameBuffer;

#[cfg(test)]
mod tests;
