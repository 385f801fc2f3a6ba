use crate::error::CryptoError;

/// Cursor over a byte slice for the binary record and wire formats.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn truncated() -> CryptoError {
    CryptoError::DecodeError("unexpected end of input".into())
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[cfg(test)]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CryptoError> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.data.len() {
            return Err(truncated());
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        self.read_bytes(N)?.try_into().map_err(|_| truncated())
    }

    pub fn read_u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CryptoError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// A `0x00` / `0x01` presence flag.
    pub fn read_flag(&mut self) -> Result<bool, CryptoError> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(CryptoError::DecodeError(format!("invalid flag byte {other:#04x}"))),
        }
    }

    /// Fails unless the input has been consumed completely.
    pub fn finish(&self) -> Result<(), CryptoError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(CryptoError::DecodeError(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )))
        }
    }
}
