//! Cursor-based primitive reader over a byte span.

/// Errors raised while reading primitives out of a byte span.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// Not enough bytes left for the requested primitive
    #[error("unexpected end of data at offset {offset}: needed {needed} byte(s), {available} available")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A varint kept its continuation bit set past 64 bits of payload
    #[error("varint starting at offset {offset} overflows 64 bits")]
    VarintOverflow { offset: usize },
}

/// Little-endian cursor over a borrowed byte span.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Create a reader already positioned at `offset`.
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset.min(data.len()) }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes consumed since `start`, used to slice out an instruction encoding.
    pub fn consumed_since(&self, start: usize) -> &'a [u8] {
        &self.data[start.min(self.pos)..self.pos]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < n {
            return Err(ReadError::UnexpectedEof {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ReadError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_f32(&mut self) -> Result<f32, ReadError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, ReadError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        self.take(n)
    }

    /// Read an unsigned LEB128 value of any encoded length.
    ///
    /// Redundant zero-padding bytes are accepted; only payload bits that do
    /// not fit into 64 bits are rejected.
    pub fn read_uleb128(&mut self) -> Result<u64, ReadError> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut shift: u32 = 0;

        loop {
            let byte = self.read_u8().map_err(|_| ReadError::UnexpectedEof {
                offset: start,
                needed: self.pos - start + 1,
                available: self.pos - start,
            })?;
            let payload = u64::from(byte & 0x7f);

            if shift < 64 {
                let shifted = payload << shift;
                if shift > 0 && (shifted >> shift) != payload {
                    return Err(ReadError::VarintOverflow { offset: start });
                }
                result |= shifted;
            } else if payload != 0 {
                return Err(ReadError::VarintOverflow { offset: start });
            }

            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift = shift.saturating_add(7);
        }
    }

    /// Read a signed LEB128 value, sign-extending from the last payload bit.
    pub fn read_sleb128(&mut self) -> Result<i64, ReadError> {
        let start = self.pos;
        let mut result: i64 = 0;
        let mut shift: u32 = 0;

        loop {
            let byte = self.read_u8().map_err(|_| ReadError::UnexpectedEof {
                offset: start,
                needed: self.pos - start + 1,
                available: self.pos - start,
            })?;

            if shift >= 64 {
                // Only sign-extension padding may follow a full payload.
                let pad = byte & 0x7f;
                let sign = if result < 0 { 0x7f } else { 0 };
                if pad != sign {
                    return Err(ReadError::VarintOverflow { offset: start });
                }
            } else if shift == 63 {
                // bit 63 plus six bits that must repeat it
                let payload = byte & 0x7f;
                if payload != 0 && payload != 0x7f {
                    return Err(ReadError::VarintOverflow { offset: start });
                }
                result |= i64::from(payload & 1) << 63;
            } else {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift = shift.saturating_add(7);

            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_positions() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xff];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_bytes(5).unwrap(), &[0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(reader.position(), 6);
        assert_eq!(reader.remaining(), 3);
        assert_eq!(reader.consumed_since(2), &[0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_eof_is_reported_with_offset() {
        let data = [0xaa, 0xbb];
        let mut reader = ByteReader::at(&data, 1);
        let err = reader.read_f32().unwrap_err();
        assert_eq!(
            err,
            ReadError::UnexpectedEof {
                offset: 1,
                needed: 4,
                available: 1
            }
        );
    }

    #[test]
    fn test_uleb128_multiple_continuation_bytes() {
        // 624485 = 0xE5 0x8E 0x26
        let mut reader = ByteReader::new(&[0xe5, 0x8e, 0x26]);
        assert_eq!(reader.read_uleb128().unwrap(), 624_485);
        assert!(reader.is_empty());

        // u32::MAX needs five bytes
        let mut reader = ByteReader::new(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(reader.read_uleb128().unwrap(), u64::from(u32::MAX));

        // padded zero is still accepted
        let mut reader = ByteReader::new(&[0x80, 0x80, 0x00]);
        assert_eq!(reader.read_uleb128().unwrap(), 0);
    }

    #[test]
    fn test_uleb128_u64_max_and_overflow() {
        let max = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(ByteReader::new(&max).read_uleb128().unwrap(), u64::MAX);

        let too_big = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
        assert_eq!(
            ByteReader::new(&too_big).read_uleb128().unwrap_err(),
            ReadError::VarintOverflow { offset: 0 }
        );
    }

    #[test]
    fn test_uleb128_truncated() {
        let mut reader = ByteReader::new(&[0x80, 0x80]);
        assert!(matches!(
            reader.read_uleb128(),
            Err(ReadError::UnexpectedEof { offset: 0, .. })
        ));
    }

    #[test]
    fn test_sleb128_values() {
        assert_eq!(ByteReader::new(&[0x7f]).read_sleb128().unwrap(), -1);
        assert_eq!(ByteReader::new(&[0x3f]).read_sleb128().unwrap(), 63);
        assert_eq!(ByteReader::new(&[0xc0, 0xbb, 0x78]).read_sleb128().unwrap(), -123_456);
        assert_eq!(ByteReader::new(&[0x80, 0x01]).read_sleb128().unwrap(), 128);
    }

    #[test]
    fn test_sleb128_ten_byte_limits() {
        let min = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f];
        assert_eq!(ByteReader::new(&min).read_sleb128().unwrap(), i64::MIN);

        let max = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];
        assert_eq!(ByteReader::new(&max).read_sleb128().unwrap(), i64::MAX);

        let minus_one = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert_eq!(ByteReader::new(&minus_one).read_sleb128().unwrap(), -1);

        // 2^63 and wider payloads do not fit
        for last in [0x01, 0x0e, 0x40] {
            let mut too_big = [0x80; 10];
            too_big[9] = last;
            assert_eq!(
                ByteReader::new(&too_big).read_sleb128().unwrap_err(),
                ReadError::VarintOverflow { offset: 0 }
            );
        }
    }

    #[test]
    fn test_floats() {
        let mut data = Vec::new();
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.extend_from_slice(&(-2.25f64).to_le_bytes());
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_f64().unwrap(), -2.25);
    }
}
