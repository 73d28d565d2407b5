use std::os::raw::c_int;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the filesystem callbacks.
#[derive(Debug, Error)]
pub enum FsError {
    /// Write access was requested on the read-only file.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Allocating per-call state failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The kernel handed back a file handle that is not open.
    #[error("unknown file handle {0}")]
    BadHandle(u64),

    /// The backing file or the sparse decoder failed.
    #[error("{}: {}: {}", .path.display(), .action, .source)]
    Source {
        path: PathBuf,
        action: &'static str,
        #[source]
        source: sparse_format::Error,
    },
}

impl FsError {
    pub(crate) fn from_source(
        path: impl Into<PathBuf>,
        action: &'static str,
        source: impl Into<sparse_format::Error>,
    ) -> Self {
        FsError::Source {
            path: path.into(),
            action,
            source: source.into(),
        }
    }

    /// Errno to reply with.
    ///
    /// OS failures keep their own code; structural decode failures have no
    /// POSIX equivalent and collapse to `EIO`. `fuser` negates the value on
    /// the wire, so it is returned positive here.
    pub fn to_errno(&self) -> c_int {
        match self {
            FsError::ReadOnly => libc::EROFS,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Source { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result type for filesystem operations.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FsError, c_int)> = vec![
            (FsError::ReadOnly, libc::EROFS),
            (FsError::OutOfMemory, libc::ENOMEM),
            (FsError::BadHandle(9), libc::EBADF),
            (
                FsError::from_source(
                    "/img",
                    "Failed to open file",
                    io::Error::from_raw_os_error(libc::EACCES),
                ),
                libc::EACCES,
            ),
            (
                FsError::from_source(
                    "/img",
                    "Failed to read sparse file",
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                ),
                libc::EIO,
            ),
            (
                FsError::from_source(
                    "/img",
                    "Failed to open sparse file",
                    sparse_format::Error::InvalidMagic(0),
                ),
                libc::EIO,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_errno(), expected, "{}", error);
        }
    }

    #[test]
    fn source_error_message_names_path() {
        let error = FsError::from_source(
            "/proc/self/fd/3",
            "Failed to open sparse file",
            sparse_format::Error::InvalidMagic(0x1234),
        );
        assert_eq!(
            error.to_string(),
            "/proc/self/fd/3: Failed to open sparse file: invalid sparse magic: 0x00001234"
        );
    }
}
