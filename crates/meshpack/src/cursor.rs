use crate::types::Error;
use crate::types::Result;

/// A cursor tracks position within a borrowed buffer slice.
///
/// Every read is bounds-checked and big-endian. A short buffer yields
/// `Error::Pending` with the number of missing bytes, never a panic.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    slice: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        Self { slice, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.slice.len().saturating_sub(self.pos)
    }

    pub fn as_slice(&self) -> &'a [u8] {
        &self.slice[self.pos..]
    }

    /// Fails with `Error::Trailing` unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::Trailing(n)),
        }
    }

    #[inline]
    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.slice.len() {
            Err(Error::Pending(self.pos + n - self.slice.len()))
        } else {
            Ok(())
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.slice[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let slice = &self.slice[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.need(len)?;
        self.pos += len;
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::InvalidBool(b)),
        }
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    /// Reads an `i32` length prefix followed by that many raw bytes.
    pub fn blob(&mut self) -> Result<&'a [u8]> {
        let len = self.i32()?;
        if len < 0 {
            return Err(Error::NegativeLength(len as i64));
        }
        self.read_bytes(len as usize)
    }

    /// Reads an `i16` length prefix followed by UTF-8 bytes.
    pub fn str(&mut self) -> Result<&'a str> {
        let len = self.i16()?;
        if len < 0 {
            return Err(Error::NegativeLength(len as i64));
        }
        let bytes = self.read_bytes(len as usize)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Reads an `i16` count prefix followed by that many `i32`s.
    pub fn i32_list(&mut self) -> Result<Vec<i32>> {
        let count = self.i16()?;
        if count < 0 {
            return Err(Error::NegativeLength(count as i64));
        }
        let count = count as usize;
        self.need(count * 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.i32()?);
        }
        Ok(out)
    }
}
