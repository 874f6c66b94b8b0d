//! Primitive field readers and writers shared by both dialects.
//!
//! A [`Reader`] walks a borrowed body slice and fails with
//! [`CodecError::Truncated`] when a field runs off the end.  A [`Writer`]
//! appends to an owned buffer and enforces the wire limits on strings and
//! arrays.  Payload tails are always copied out (`take_rest`), never
//! aliased, so a decoded message stays valid after the input buffer is
//! reused.

use crate::{ByteOrder, CodecError, MAX_STRING_LEN};

pub struct Reader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Reader { buf, order }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let b: [u8; 2] = self.take(2)?.try_into().expect("length checked");
        Ok(match self.order {
            ByteOrder::Big => u16::from_be_bytes(b),
            ByteOrder::Little => u16::from_le_bytes(b),
        })
    }

    pub fn i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b: [u8; 4] = self.take(4)?.try_into().expect("length checked");
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(b),
            ByteOrder::Little => u32::from_le_bytes(b),
        })
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let b: [u8; 8] = self.take(8)?.try_into().expect("length checked");
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(b),
            ByteOrder::Little => u64::from_le_bytes(b),
        })
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    pub fn u64_array(&mut self) -> Result<Vec<u64>, CodecError> {
        let count = self.u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.u64()?);
        }
        Ok(out)
    }

    pub fn string_array(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.string()?);
        }
        Ok(out)
    }

    /// Copies whatever is left of the body into an owned payload.
    pub fn take_rest(&mut self) -> Vec<u8> {
        let rest = self.buf.to_vec();
        self.buf = &[];
        rest
    }
}

pub struct Writer {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Writer {
    pub fn with_capacity(cap: usize, order: ByteOrder) -> Self {
        Writer {
            buf: Vec::with_capacity(cap),
            order,
        }
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn i16(&mut self, v: i16) {
        self.u16(v as u16);
    }

    pub fn u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Writes `u16 len || utf8 bytes`, capped at `max_len` bytes.
    pub fn string(&mut self, s: &str, max_len: usize) -> Result<(), CodecError> {
        if s.len() > max_len || s.len() > MAX_STRING_LEN {
            return Err(CodecError::MessageTooLarge);
        }
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn u64_array(&mut self, values: &[u64]) -> Result<(), CodecError> {
        if values.len() > u16::MAX as usize {
            return Err(CodecError::MessageTooLarge);
        }
        self.u16(values.len() as u16);
        for v in values {
            self.u64(*v);
        }
        Ok(())
    }

    pub fn string_array(&mut self, values: &[String], max_len: usize) -> Result<(), CodecError> {
        if values.len() > u16::MAX as usize {
            return Err(CodecError::MessageTooLarge);
        }
        self.u16(values.len() as u16);
        for v in values {
            self.string(v, max_len)?;
        }
        Ok(())
    }

    pub fn bytes(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives_in_both_orders() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let mut w = Writer::with_capacity(64, order);
            w.u8(7);
            w.u16(513);
            w.i16(-2);
            w.u32(70_000);
            w.u64(1 << 40);
            w.string("echo", MAX_STRING_LEN).unwrap();
            w.u64_array(&[1, 2, 3]).unwrap();
            w.string_array(&["a".into(), "bb".into()], MAX_STRING_LEN)
                .unwrap();
            w.bytes(b"tail");
            let buf = w.into_inner();

            let mut r = Reader::new(&buf, order);
            assert_eq!(r.u8().unwrap(), 7);
            assert_eq!(r.u16().unwrap(), 513);
            assert_eq!(r.i16().unwrap(), -2);
            assert_eq!(r.u32().unwrap(), 70_000);
            assert_eq!(r.u64().unwrap(), 1 << 40);
            assert_eq!(r.string().unwrap(), "echo");
            assert_eq!(r.u64_array().unwrap(), vec![1, 2, 3]);
            assert_eq!(r.string_array().unwrap(), vec!["a", "bb"]);
            assert_eq!(r.take_rest(), b"tail");
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn truncated_fields_fail() {
        let mut r = Reader::new(&[0x01], ByteOrder::Little);
        assert_eq!(r.u16(), Err(CodecError::Truncated));

        // String length claims more bytes than the buffer holds.
        let mut r = Reader::new(&[0x05, 0x00, b'a'], ByteOrder::Little);
        assert_eq!(r.string(), Err(CodecError::Truncated));

        // Array count claims more elements than the buffer holds.
        let mut r = Reader::new(&[0x02, 0x00, 0, 0, 0, 0, 0, 0, 0, 0], ByteOrder::Little);
        assert_eq!(r.u64_array(), Err(CodecError::Truncated));
    }

    #[test]
    fn string_limit_is_enforced_on_encode() {
        let mut w = Writer::with_capacity(8, ByteOrder::Little);
        let long = "s".repeat(256);
        assert_eq!(w.string(&long, 255), Err(CodecError::MessageTooLarge));
        let huge = "s".repeat(MAX_STRING_LEN + 1);
        assert_eq!(
            w.string(&huge, MAX_STRING_LEN),
            Err(CodecError::MessageTooLarge)
        );
    }
}
