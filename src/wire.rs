//! Bounds-checked cursors over byte slices.
//!
//! Every read or write that would run past the end of the slice fails with
//! [`Error::BufferTooShort`] and leaves the cursor where it was.

use crate::error::Error;
use crate::varint::{decode_varint, encode_varint, encode_varint_with_len};

/// Read cursor.
pub struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Bytes consumed so far.
    pub fn off(&self) -> usize {
        self.off
    }

    /// Bytes left to read.
    pub fn cap(&self) -> usize {
        self.buf.len() - self.off
    }

    pub fn is_empty(&self) -> bool {
        self.cap() == 0
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn peek_u8(&self) -> Result<u8, Error> {
        self.buf
            .get(self.off)
            .copied()
            .ok_or(Error::BufferTooShort { needed: 1 })
    }

    pub fn get_u16(&mut self) -> Result<u16, Error> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_varint(&mut self) -> Result<u64, Error> {
        let (v, n) = decode_varint(&self.buf[self.off..])?;
        self.off += n;
        Ok(v)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.cap() < len {
            return Err(Error::BufferTooShort { needed: len - self.cap() });
        }
        let out = &self.buf[self.off..self.off + len];
        self.off += len;
        Ok(out)
    }

    /// A u8 length prefix followed by that many bytes.
    pub fn get_bytes_with_u8_length(&mut self) -> Result<&'a [u8], Error> {
        let start = self.off;
        let len = self.get_u8()? as usize;
        self.get_bytes(len).inspect_err(|_| self.off = start)
    }

    /// A varint length prefix followed by that many bytes.
    pub fn get_bytes_with_varint_length(&mut self) -> Result<&'a [u8], Error> {
        let start = self.off;
        let len = self.get_varint()?;
        let len = usize::try_from(len).map_err(|_| Error::BufferTooShort { needed: usize::MAX })?;
        self.get_bytes(len).inspect_err(|_| self.off = start)
    }

    /// Everything that has not been read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.off..];
        self.off = self.buf.len();
        out
    }

    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.get_bytes(len).map(|_| ())
    }
}

/// Write cursor.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Bytes written so far.
    pub fn off(&self) -> usize {
        self.off
    }

    /// Room left.
    pub fn cap(&self) -> usize {
        self.buf.len() - self.off
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8], Error> {
        if self.cap() < len {
            return Err(Error::BufferTooShort { needed: len - self.cap() });
        }
        let start = self.off;
        self.off += len;
        Ok(&mut self.buf[start..start + len])
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), Error> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), Error> {
        self.reserve(2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), Error> {
        self.reserve(4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn put_varint(&mut self, v: u64) -> Result<(), Error> {
        let n = encode_varint(v, &mut self.buf[self.off..])?;
        self.off += n;
        Ok(())
    }

    /// Varint of a fixed encoded width.
    pub fn put_varint_with_len(&mut self, v: u64, len: usize) -> Result<(), Error> {
        let n = encode_varint_with_len(v, len, &mut self.buf[self.off..])?;
        self.off += n;
        Ok(())
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Fill `len` bytes with zeroes (PADDING frames on the wire).
    pub fn put_zeroes(&mut self, len: usize) -> Result<(), Error> {
        self.reserve(len)?.fill(0);
        Ok(())
    }

    pub fn into_inner(self) -> &'a mut [u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_tracks_offset() {
        let data = [0x01, 0x00, 0x02, 0x40, 0x25, 0x02, 0xaa, 0xbb];
        let mut r = Reader::new(&data);
        assert_eq!(r.get_u8().unwrap(), 1);
        assert_eq!(r.get_u16().unwrap(), 2);
        assert_eq!(r.get_varint().unwrap(), 37);
        assert_eq!(r.get_bytes_with_u8_length().unwrap(), &[0xaa, 0xbb]);
        assert!(r.is_empty());
        assert_eq!(r.off(), data.len());
    }

    #[test]
    fn failed_read_does_not_advance() {
        let data = [0x05, 0x01];
        let mut r = Reader::new(&data);
        assert!(r.get_bytes_with_u8_length().is_err());
        assert_eq!(r.off(), 0);
        assert!(r.get_u32().is_err());
        assert_eq!(r.cap(), 2);
    }

    #[test]
    fn writer_bounds() {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        w.put_u16(0x0102).unwrap();
        w.put_varint(37).unwrap();
        assert_eq!(
            w.put_u16(7),
            Err(Error::BufferTooShort { needed: 1 })
        );
        w.put_zeroes(1).unwrap();
        assert_eq!(w.off(), 4);
        assert_eq!(buf, [0x01, 0x02, 0x25, 0x00]);
    }
}
