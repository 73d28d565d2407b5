//! Read-only access to the file holding the sparse image.

use crate::error::{FsError, Result};
use log::{debug, error};
use sparse_format::SparseFile;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A read-only, seekable view of the backing image.
///
/// Every handle opens its own `BackingFile` so file positions are never
/// shared between handles.
#[derive(Debug)]
pub struct BackingFile {
    file: File,
    path: PathBuf,
}

impl BackingFile {
    /// Open `path` read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for BackingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for BackingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Open a fresh backing file and decoder for `path`.
///
/// Failures are logged as `<path>: <message>` before being returned.
pub(crate) fn open_sparse(path: &Path) -> Result<SparseFile<BackingFile>> {
    let backing = BackingFile::open(path).map_err(|e| {
        let err = FsError::from_source(path, "Failed to open file", e);
        error!("{}", err);
        err
    })?;

    // On failure the decoder drops the backing file with it.
    let sparse = SparseFile::open(backing).map_err(|e| {
        let err = FsError::from_source(path, "Failed to open sparse file", e);
        error!("{}", err);
        err
    })?;

    debug!("{}: decoded size {} bytes", path.display(), sparse.size());
    Ok(sparse)
}

/// The user's source image, held open for the life of the process.
///
/// On Linux the session path is `/proc/self/fd/<n>` so that every handle
/// reopens this exact file even if the original path is renamed or
/// replaced while mounted.
#[derive(Debug)]
pub struct SourceDescriptor {
    _file: File,
    path: PathBuf,
    original_path: PathBuf,
}

impl SourceDescriptor {
    /// Open the source image read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let original_path = path.as_ref().to_path_buf();
        let file = File::open(&original_path)?;
        let path = descriptor_path(&file).unwrap_or_else(|| original_path.clone());

        debug!(
            "Source {} available as {}",
            original_path.display(),
            path.display()
        );

        Ok(Self {
            _file: file,
            path,
            original_path,
        })
    }

    /// Path that reopens the held descriptor.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path given by the user.
    pub fn original_path(&self) -> &Path {
        &self.original_path
    }
}

#[cfg(target_os = "linux")]
fn descriptor_path(file: &File) -> Option<PathBuf> {
    use std::os::fd::AsRawFd;

    let path = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
    // Without procfs fall back to the original path.
    path.exists().then_some(path)
}

#[cfg(not(target_os = "linux"))]
fn descriptor_path(_file: &File) -> Option<PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparse_format::SparseBuilder;
    use tempfile::tempdir;

    #[test]
    fn test_backing_file_reads_and_seeks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut backing = BackingFile::open(&path).unwrap();
        backing.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        backing.read_exact(&mut buf).unwrap();

        assert_eq!(&buf, b"456");
        assert_eq!(backing.path(), path.as_path());
    }

    #[test]
    fn test_open_sparse_missing_file_keeps_errno() {
        let dir = tempdir().unwrap();
        let err = open_sparse(&dir.path().join("missing.img")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(err.to_string().contains("Failed to open file"));
    }

    #[test]
    fn test_open_sparse_rejects_plain_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let err = open_sparse(&path).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().contains("Failed to open sparse file"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_source_descriptor_survives_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.img");
        SparseBuilder::new(4)
            .with_raw(b"abcd".to_vec())
            .write_to(&path)
            .unwrap();

        let source = SourceDescriptor::open(&path).unwrap();
        assert_eq!(source.original_path(), path.as_path());
        assert!(source.path().starts_with("/proc/self/fd"));

        std::fs::rename(&path, dir.path().join("moved.img")).unwrap();
        let sparse = open_sparse(source.path()).unwrap();
        assert_eq!(sparse.size(), 4);
    }
}
