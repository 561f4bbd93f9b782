#![forbid(unsafe_code)]
//! Big-endian cursors shared by the log record and redo codecs.

use crate::types::{Lsa, ReclaimError, Result};

/// Appends big-endian fields to a byte vector.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the writer, returning the encoded bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a big-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a log position, NULL included.
    pub fn put_lsa(&mut self, lsa: Lsa) {
        self.put_u64(lsa.page);
        self.put_u32(lsa.offset);
    }

    /// Appends a u16 length prefix followed by the bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| ReclaimError::Invalid("byte field longer than 65535"))?;
        self.put_u16(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// Reads big-endian fields, failing with `Corruption` when input runs out.
pub struct ByteReader<'a> {
    src: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    /// Reader over `src`; `what` names the structure in truncation errors.
    pub fn new(src: &'a [u8], what: &'static str) -> Self {
        Self { src, pos: 0, what }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ReclaimError::Corruption(self.what));
        }
        let out = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian u16.
    pub fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(b))
    }

    /// Reads a big-endian u32.
    pub fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    /// Reads a big-endian u64.
    pub fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    /// Reads a log position written by [`ByteWriter::put_lsa`].
    pub fn lsa(&mut self) -> Result<Lsa> {
        Ok(Lsa::new(self.u64()?, self.u32()?))
    }

    /// Reads a u16 length-prefixed byte field.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
