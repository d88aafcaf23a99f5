//! # Frames
//!
//! Every message on a connection travels as one frame:
//!
//! ```text
//! [len: i32][msg_id: i32][seq: i32][body: len - 8 bytes]
//! ```
//!
//! All integers are big-endian and `len` counts every byte after itself.
//! `seq` is the correlation number: positive for a request expecting a reply,
//! negative for the reply to the request with the same magnitude, zero for
//! one-way traffic.

use crate::cursor::Cursor;
use crate::types::Error;
use crate::types::Result;
use crate::types::DEFAULT_MAX_FRAME;
use crate::types::FRAME_HEADER_LEN;

/// A decoded frame: the message id, its sequence number and the raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_id: i32,
    pub seq: i32,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(msg_id: i32, seq: i32, body: Vec<u8>) -> Self {
        Self { msg_id, seq, body }
    }

    /// Serializes the frame including its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.body.len() + FRAME_HEADER_LEN - 4;
        let len = i32::try_from(len).map_err(|_| Error::TooLong(self.body.len()))?;
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Decodes exactly one complete frame. Trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let len = cur.i32()?;
        check_len(len, usize::MAX)?;
        let msg_id = cur.i32()?;
        let seq = cur.i32()?;
        let body = cur.read_bytes(len as usize - 8)?.to_vec();
        cur.expect_end()?;
        Ok(Self { msg_id, seq, body })
    }
}

fn check_len(len: i32, max: usize) -> Result<()> {
    if len < 0 {
        return Err(Error::NegativeLength(len as i64));
    }
    let len = len as usize;
    if len < FRAME_HEADER_LEN - 4 {
        return Err(Error::FrameTooShort(len));
    }
    if len > max {
        return Err(Error::FrameTooLarge(len));
    }
    Ok(())
}

/// Reassembles frames from a byte stream that arrives in arbitrary chunks.
pub struct FrameBuffer {
    data: Vec<u8>,
    valid_start: usize,
    max_frame: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            data: Vec::new(),
            valid_start: 0,
            max_frame,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.valid_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the next complete frame, length prefix included, as raw bytes.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived. An oversized or
    /// malformed length prefix is an error; the stream cannot be resynced.
    pub fn next_frame_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let window = &self.data[self.valid_start..];
        if window.len() < 4 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([window[0], window[1], window[2], window[3]]);
        check_len(len, self.max_frame)?;
        let total = 4 + len as usize;
        if window.len() < total {
            return Ok(None);
        }
        let bytes = window[..total].to_vec();
        self.valid_start += total;
        self.compact();
        Ok(Some(bytes))
    }

    /// Pops and decodes the next complete frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.next_frame_bytes()? {
            Some(bytes) => Frame::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn compact(&mut self) {
        if self.valid_start > 0 && self.valid_start * 2 >= self.data.len() {
            self.data.drain(..self.valid_start);
            self.valid_start = 0;
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
