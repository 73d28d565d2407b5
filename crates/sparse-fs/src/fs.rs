//! The four callbacks behind the single-file filesystem.
//!
//! [`SparseFs`] is independent of any FUSE binding: every method takes
//! `&self` and may be called from many dispatch threads at once.

use crate::error::{FsError, Result};
use crate::handle::{HandleContext, HandleTable};
use crate::session::MountSession;
use log::{debug, trace, warn};

/// Permission bits of the exposed file: read-only for everyone.
pub const FILE_PERM: u16 = 0o444;

/// Attributes of the exposed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Decoded size of the image.
    pub size: u64,
    /// Full mode, file type included.
    pub mode: u32,
}

impl FileStat {
    /// Permission bits without the file type.
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

/// Read-only, single-file view of a sparse image.
#[derive(Debug)]
pub struct SparseFs {
    session: MountSession,
    handles: HandleTable,
}

impl SparseFs {
    pub fn new(session: MountSession) -> Self {
        Self {
            session,
            handles: HandleTable::new(),
        }
    }

    pub fn session(&self) -> &MountSession {
        &self.session
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Attributes of the file. Never touches the source.
    pub fn getattr(&self) -> FileStat {
        FileStat {
            size: self.session.logical_size(),
            mode: libc::S_IFREG as u32 | u32::from(FILE_PERM),
        }
    }

    /// Open the file and return a new handle number.
    ///
    /// # Errors
    ///
    /// - [`FsError::ReadOnly`] if `flags` ask for write access
    /// - [`FsError::OutOfMemory`] if the handle table cannot grow
    /// - [`FsError::Source`] if the backing file or decoder cannot be opened
    pub fn open(&self, flags: i32) -> Result<u64> {
        trace!("open(flags={:#o})", flags);

        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            debug!("open: rejecting write access (flags={:#o})", flags);
            return Err(FsError::ReadOnly);
        }

        let context = HandleContext::open(self.session.source_path())?;
        let fh = self.handles.insert(context)?;

        debug!("open: handle {} ({} open)", fh, self.handles.len());
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset` through handle `fh`.
    ///
    /// Offsets at or past the end produce an empty buffer, not an error.
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        trace!("read(fh={}, offset={}, size={})", fh, offset, size);

        let context = self.handles.get(fh).ok_or(FsError::BadHandle(fh))?;

        let remaining = self.session.logical_size().saturating_sub(offset);
        let len = usize::try_from(remaining).map_or(size, |remaining| remaining.min(size));

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| FsError::OutOfMemory)?;
        buffer.resize(len, 0);

        let n = context.read_at(offset, &mut buffer)?;
        buffer.truncate(n);

        trace!("read: {} bytes from offset {}", n, offset);
        Ok(buffer)
    }

    /// Drop handle `fh`, closing its decoder and backing file.
    ///
    /// Always succeeds; an unknown handle is only logged.
    pub fn release(&self, fh: u64) {
        match self.handles.remove(fh) {
            Some(_) => debug!("release: handle {} ({} open)", fh, self.handles.len()),
            None => warn!("release: unknown handle {}", fh),
        }
    }
}
