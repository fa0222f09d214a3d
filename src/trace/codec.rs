//! Little-endian field encoding shared by every record in a trace directory.

use std::{convert::TryInto, io};

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Encoder {
        Encoder {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Length prefixed (u32) byte string.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    /// Bytes with no length prefix.
    pub fn put_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(invalid_data(format!(
                "record too short: wanted {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> io::Result<u32> {
        // take() returned exactly 4 bytes.
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> io::Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> io::Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self) -> io::Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_raw(&mut self, n: usize) -> io::Result<&'a [u8]> {
        self.take(n)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Error out if there are unread bytes.
    pub fn finish(self) -> io::Result<()> {
        if self.remaining() != 0 {
            return Err(invalid_data(format!(
                "{} trailing bytes in record",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub fn invalid_data<S: Into<String>>(msg: S) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_decode_in_order() {
        let mut e = Encoder::new();
        e.put_u8(7)
            .put_i32(-100)
            .put_u64(u64::MAX)
            .put_bytes(b"/lib/libc.so.6")
            .put_i64(-1);
        let buf = e.into_inner();
        let mut d = Decoder::new(&buf);
        assert_eq!(7, d.get_u8().unwrap());
        assert_eq!(-100, d.get_i32().unwrap());
        assert_eq!(u64::MAX, d.get_u64().unwrap());
        assert_eq!(b"/lib/libc.so.6", d.get_bytes().unwrap());
        assert_eq!(-1, d.get_i64().unwrap());
        d.finish().unwrap();
    }

    #[test]
    fn short_record_is_invalid_data() {
        let mut d = Decoder::new(&[1, 2, 3]);
        let err = d.get_u32().unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut e = Encoder::new();
        e.put_u32(1000).put_raw(b"abc");
        let buf = e.into_inner();
        assert!(Decoder::new(&buf).get_bytes().is_err());
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let d = Decoder::new(&[0u8; 2]);
        assert!(d.finish().is_err());
    }
}
