//! Little-endian primitives shared by value payloads and generation records.

use crate::error::{CoreError, CoreResult};

/// Appends fixed-width and length-prefixed fields to a buffer.
pub(crate) trait PutBytes {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_i32(&mut self, v: i32);
    fn put_i64(&mut self, v: i64);
    fn put_f32(&mut self, v: f32);
    fn put_bytes(&mut self, v: &[u8]);
    fn put_str(&mut self, v: &str);
}

impl PutBytes for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.extend_from_slice(v);
    }

    fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }
}

/// Cursor over an encoded buffer. Every read is bounds-checked and reports
/// running out of bytes as corruption.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CoreError::corruption(format!(
                "need {len} bytes at offset {}, only {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn i32(&mut self) -> CoreResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn i64(&mut self) -> CoreResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn f32(&mut self) -> CoreResult<f32> {
        Ok(f32::from_bits(u32::from_le_bytes(self.take_array()?)))
    }

    pub(crate) fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn string(&mut self) -> CoreResult<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| CoreError::corruption(format!("invalid UTF-8: {e}")))
    }

    /// Reads an element count and rejects counts that could not possibly fit
    /// in the remaining bytes, so a flipped length never triggers a huge
    /// allocation.
    pub(crate) fn count(&mut self, min_element_size: usize) -> CoreResult<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_element_size.max(1)) > self.remaining() {
            return Err(CoreError::corruption(format!(
                "element count {count} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub(crate) fn expect_end(&self) -> CoreResult<()> {
        if self.remaining() != 0 {
            return Err(CoreError::corruption(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// CRC32C of `data`.
pub(crate) fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_what_was_written() {
        let mut buf = Vec::new();
        buf.put_u8(7);
        buf.put_u16(513);
        buf.put_i32(-5);
        buf.put_i64(1 << 40);
        buf.put_f32(2.5);
        buf.put_str("lat");

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 513);
        assert_eq!(r.i32().unwrap(), -5);
        assert_eq!(r.i64().unwrap(), 1 << 40);
        assert_eq!(r.f32().unwrap(), 2.5);
        assert_eq!(r.string().unwrap(), "lat");
        r.expect_end().unwrap();
    }

    #[test]
    fn short_buffer_is_corruption() {
        let mut r = ByteReader::new(&[1, 2]);
        assert!(r.u32().unwrap_err().is_corruption());
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut buf = Vec::new();
        buf.put_u32(u32::MAX);
        let mut r = ByteReader::new(&buf);
        assert!(r.count(4).is_err());
    }

    #[test]
    fn checksum_is_crc32c() {
        // Standard CRC-32C check value.
        assert_eq!(checksum(b"123456789"), 0xE306_9283);
    }
}
