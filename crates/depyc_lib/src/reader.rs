use byteorder::{ByteOrder, LittleEndian};

use crate::DepycError;

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, DepycError> {
        if self.remaining() < 1 {
            return Err(DepycError::Eof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16, DepycError> {
        if self.remaining() < 2 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_u16(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, DepycError> {
        if self.remaining() < 4 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn get_i32(&mut self) -> Result<i32, DepycError> {
        Ok(self.get_u32()? as i32)
    }

    pub(crate) fn get_i64(&mut self) -> Result<i64, DepycError> {
        if self.remaining() < 8 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_i64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub(crate) fn get_f64(&mut self) -> Result<f64, DepycError> {
        if self.remaining() < 8 {
            return Err(DepycError::Eof);
        }
        let v = LittleEndian::read_f64(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    pub(crate) fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], DepycError> {
        if self.remaining() < n {
            return Err(DepycError::Eof);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_words() {
        let mut r = Reader::new(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xff]);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0x1234_5678);
        assert_eq!(r.pos(), 6);
        assert_eq!(r.get_u8().unwrap(), 0xff);
        assert!(r.at_eof());
    }

    #[test]
    fn short_input_is_eof() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(matches!(r.get_u32(), Err(DepycError::Eof)));
        assert!(matches!(r.get_bytes(4), Err(DepycError::Eof)));
        assert_eq!(r.get_bytes(3).unwrap(), &[1, 2, 3]);
    }
}
