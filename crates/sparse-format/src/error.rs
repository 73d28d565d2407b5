use thiserror::Error;

/// Errors that can occur when reading or writing sparse images.
#[derive(Debug, Error)]
pub enum Error {
    /// The file header does not start with the sparse magic.
    #[error("invalid sparse magic: {0:#010x}")]
    InvalidMagic(u32),

    /// The header declares a major version this decoder cannot read.
    #[error("unsupported sparse version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// A header field is out of range.
    #[error("invalid sparse header: {0}")]
    InvalidHeader(String),

    /// A chunk header is malformed.
    #[error("invalid chunk {index}: {reason}")]
    InvalidChunk { index: u32, reason: String },

    /// A chunk header carries a type this decoder does not know.
    #[error("unknown chunk type {chunk_type:#06x} in chunk {index}")]
    UnknownChunkType { index: u32, chunk_type: u16 },

    /// The chunks do not cover the output size declared by the header.
    #[error("chunks cover {actual} blocks, header declares {expected}")]
    BlockCountMismatch { expected: u64, actual: u64 },

    /// Builder input is not usable.
    #[error("invalid builder input: {0}")]
    InvalidInput(String),

    /// I/O error from the underlying stream.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Operating system error code behind this error, if any.
    ///
    /// Structural errors never carry one, nor do I/O errors synthesized by
    /// the standard library (short reads, for instance).
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::IoError(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Result type for sparse-format operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_raw_os_error_only_for_os_failures() {
        let os = Error::IoError(io::Error::from_raw_os_error(libc_enoent()));
        assert_eq!(os.raw_os_error(), Some(libc_enoent()));

        let eof = Error::IoError(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(eof.raw_os_error(), None);

        assert_eq!(Error::InvalidMagic(0).raw_os_error(), None);
    }

    #[test]
    fn test_structural_error_into_io_error() {
        let err: io::Error = Error::InvalidHeader("block size is zero".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("block size is zero"));
    }

    // ENOENT is 2 on every platform this crate targets.
    fn libc_enoent() -> i32 {
        2
    }
}
