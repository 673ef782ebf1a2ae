use thiserror::Error;

/// Everything that can go wrong while talking to a device group or decoding
/// what it sent back.
///
/// Transport-level faults ([`Timeout`](Self::Timeout),
/// [`TransportFailure`](Self::TransportFailure)) leave the group cursors
/// untouched, so the same slot can be retried by the caller.
/// [`DeviceReportedStatus`](Self::DeviceReportedStatus) carries the
/// firmware's own status code unmodified.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transfer timed out")]
    Timeout,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("bad header stamp (magic 0x{magic:08X})")]
    BadHeaderStamp { magic: u32 },

    #[error("frame size mismatch (expected {expected}, got {actual})")]
    SizeMismatch { expected: u32, actual: u32 },

    #[error("job id mismatch (expected {expected}, got {actual})")]
    JobIdMismatch { expected: u32, actual: u32 },

    #[error("device reported status {0}")]
    DeviceReportedStatus(u32),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("model {0} is not loaded")]
    ModelNotLoaded(u32),

    #[error("input node count mismatch (model expects {expected}, got {actual})")]
    InputNodeCountMismatch { expected: usize, actual: usize },

    #[error("payload too large ({size} bytes, device slot holds {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("allocation of {0} bytes failed")]
    AllocationFailure(usize),

    #[error("invalid data layout: {0}")]
    InvalidDataLayout(String),

    #[error("invalid checkpoint data: {0}")]
    InvalidCheckpointData(String),

    #[error("index {requested} out of range (have {available})")]
    InvalidIndex { requested: usize, available: usize },

    #[error("truncated data: {len} bytes at offset {offset} exceed buffer of {available}")]
    TruncatedData {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for [`Error::Timeout`]; handy for caller-side retry loops.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_status_is_passed_through_verbatim() {
        let err = Error::DeviceReportedStatus(1234);
        assert_eq!(err.to_string(), "device reported status 1234");
        assert!(!err.is_timeout());
    }

    #[test]
    fn header_stamp_error_shows_magic_in_hex() {
        let err = Error::BadHeaderStamp { magic: 0xDEADBEEF };
        assert_eq!(err.to_string(), "bad header stamp (magic 0xDEADBEEF)");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(Error::Timeout.is_timeout());
    }
}
