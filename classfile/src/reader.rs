use crate::error::ParseError;
use byteorder::{BigEndian, ByteOrder};

/// Big-endian cursor over raw class bytes. All multi-byte reads follow the
/// class-file format's network byte order.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::UnexpectedEof(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ParseError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn i32(&mut self) -> Result<i32, ParseError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn i64(&mut self) -> Result<i64, ParseError> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    pub fn f32(&mut self) -> Result<f32, ParseError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn f64(&mut self) -> Result<f64, ParseError> {
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>, ParseError> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.take(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        let mut r = Reader::new(&[0xca, 0xfe, 0xba, 0xbe, 0x00, 0x01]);
        assert_eq!(r.u32().unwrap(), 0xCAFE_BABE);
        assert_eq!(r.u16().unwrap(), 1);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_read_reports_offset() {
        let mut r = Reader::new(&[0x00]);
        assert_eq!(r.u16(), Err(ParseError::UnexpectedEof(0)));
    }
}
