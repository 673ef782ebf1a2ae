use crate::error::{Error, Result};

/// A reusable byte buffer that only ever grows.
///
/// Owned by the device group and used for checkpoint reads, which can be
/// much larger than ordinary result frames. Growing reports
/// [`Error::AllocationFailure`] instead of aborting.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    /// Make sure at least `len` bytes are available and return the whole buffer.
    pub fn ensure(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.buf.len() {
            self.buf
                .try_reserve_exact(len - self.buf.len())
                .map_err(|_| Error::AllocationFailure(len))?;
            self.buf.resize(len, 0);
        }
        Ok(&mut self.buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}
