use crate::protocol::ProtocolError;

/// Bounds-checked cursor over a request frame. All multi-byte reads are
/// big-endian; running past the end yields [`ProtocolError::Truncated`].
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(ProtocolError::Truncated)?;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    /// Reads `n` bytes as text; invalid UTF-8 is replaced, matching how the
    /// address is treated as an opaque label rather than validated.
    pub fn read_string(&mut self, n: usize) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.read_slice(n)?).into_owned())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.read_slice(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        let mut r = ByteReader::new(&[0x01, 0x00, 0x50, 0xff]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 80);
        assert_eq!(r.position(), 3);
    }

    #[test]
    fn underflow_is_truncated() {
        let mut r = ByteReader::new(&[0x01]);
        assert_eq!(r.read_u16().unwrap_err(), ProtocolError::Truncated);
        // the failed read consumes nothing
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u8().unwrap_err(), ProtocolError::Truncated);
    }

    #[test]
    fn reads_lossy_text() {
        let mut r = ByteReader::new(b"foo\xffbar");
        assert_eq!(r.read_string(3).unwrap(), "foo");
        r.skip(1).unwrap();
        assert_eq!(r.read_string(3).unwrap(), "bar");
    }
}
