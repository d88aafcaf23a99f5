use crate::types::Error;
use crate::types::Result;

/// A growable buffer that encodes values in the meshpack layout.
///
/// Scalars cannot fail. Length-prefixed values fail with `Error::TooLong`
/// when they do not fit their prefix, leaving the buffer untouched.
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends bytes verbatim, without a length prefix.
    pub fn raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes an `i32` length prefix and the bytes.
    pub fn blob(&mut self, v: &[u8]) -> Result<()> {
        let len = i32::try_from(v.len()).map_err(|_| Error::TooLong(v.len()))?;
        self.i32(len);
        self.raw(v);
        Ok(())
    }

    /// Writes an `i16` length prefix and the UTF-8 bytes.
    pub fn str(&mut self, v: &str) -> Result<()> {
        let len = i16::try_from(v.len()).map_err(|_| Error::TooLong(v.len()))?;
        self.i16(len);
        self.raw(v.as_bytes());
        Ok(())
    }

    /// Writes an `i16` count prefix and each element.
    pub fn i32_list(&mut self, v: &[i32]) -> Result<()> {
        let count = i16::try_from(v.len()).map_err(|_| Error::TooLong(v.len()))?;
        self.i16(count);
        for item in v {
            self.i32(*item);
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
