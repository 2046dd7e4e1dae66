use crate::errors::RatchetError;

/// Cursor over the versioned binary layouts used by pickled state.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], RatchetError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(RatchetError::DeserializationFailed)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(RatchetError::DeserializationFailed)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], RatchetError> {
        self.read_bytes(N)?
            .try_into()
            .map_err(|_| RatchetError::DeserializationFailed)
    }

    pub fn read_u8(&mut self) -> Result<u8, RatchetError> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    pub fn read_bool(&mut self) -> Result<bool, RatchetError> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            _ => Err(RatchetError::DeserializationFailed),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, RatchetError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// A u32 big-endian length followed by that many bytes.
    pub fn read_prefixed(&mut self) -> Result<&'a [u8], RatchetError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn read_option(&mut self) -> Result<Option<[u8; 32]>, RatchetError> {
        match self.read_u8()? {
            0x00 => Ok(None),
            0x01 => Ok(Some(self.read_array()?)),
            _ => Err(RatchetError::DeserializationFailed),
        }
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(self) -> Result<(), RatchetError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(RatchetError::DeserializationFailed)
        }
    }
}

pub(crate) fn write_option(buf: &mut Vec<u8>, opt: Option<&[u8; 32]>) {
    match opt {
        Some(data) => {
            buf.push(0x01);
            buf.extend_from_slice(data);
        }
        None => buf.push(0x00),
    }
}

pub(crate) fn write_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}
