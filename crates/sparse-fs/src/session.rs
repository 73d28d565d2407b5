use crate::backing::open_sparse;
use crate::error::Result;
use log::info;
use std::path::{Path, PathBuf};

/// Values fixed for the lifetime of a mount.
///
/// The attribute callback answers from here without touching the source, so
/// the decoded size is discovered once before the filesystem is registered.
#[derive(Debug, Clone)]
pub struct MountSession {
    source_path: PathBuf,
    logical_size: u64,
}

impl MountSession {
    /// Open `source_path` once to learn its decoded size.
    ///
    /// The decoder used here is dropped before returning; handles always
    /// open their own.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened or is not a valid
    /// sparse image. The failure has already been logged.
    pub fn discover<P: AsRef<Path>>(source_path: P) -> Result<Self> {
        let source_path = source_path.as_ref().to_path_buf();
        let logical_size = open_sparse(&source_path)?.size();

        info!(
            "{}: sparse image decodes to {} bytes",
            source_path.display(),
            logical_size
        );

        Ok(Self {
            source_path,
            logical_size,
        })
    }

    /// Session with a known size, skipping discovery.
    pub fn new<P: Into<PathBuf>>(source_path: P, logical_size: u64) -> Self {
        Self {
            source_path: source_path.into(),
            logical_size,
        }
    }

    /// Path every handle opens.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Decoded size of the image in bytes.
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }
}
