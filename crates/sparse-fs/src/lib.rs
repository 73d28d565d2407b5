//! # sparse-fs
//!
//! Expose a sparse image as a single, fully decoded, read-only file.
//!
//! This crate provides:
//! - [`MountSession`]: the source path and decoded size, discovered once
//! - [`SparseFs`]: the getattr/open/read/release callbacks, safe to call
//!   from many threads, with one decoder per open handle
//! - [`BackingFile`] and [`SourceDescriptor`] for read-only source access
//! - FUSE mounting (with the `fuse` feature) and the `fuse-sparse` binary
//!   (with the `cli` feature)
//!
//! ## Example
//!
//! ```ignore
//! use sparse_fs::{MountSession, SparseFs};
//!
//! let session = MountSession::discover("system.img")?;
//! let fs = SparseFs::new(session);
//!
//! let fh = fs.open(libc::O_RDONLY)?;
//! let head = fs.read(fh, 0, 4096)?;
//! fs.release(fh);
//! ```
//!
//! ## FUSE Support
//!
//! Enable the `fuse` feature to mount the image over a regular file, which
//! can then be loop-mounted or read with `dd`:
//!
//! ```ignore
//! use sparse_fs::fuse::{mount, MountConfig};
//! use sparse_fs::{MountSession, SparseFs};
//!
//! let session = MountSession::discover("system.img")?;
//! mount(SparseFs::new(session), "/tmp/system.raw", &MountConfig::new("system.img"))?;
//! ```

mod backing;
mod error;
mod fs;
mod handle;
mod session;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use backing::{BackingFile, SourceDescriptor};
pub use error::{FsError, Result};
pub use fs::{FileStat, SparseFs, FILE_PERM};
pub use handle::{HandleContext, HandleTable};
pub use session::MountSession;

// Re-export sparse-format types for convenience
pub use sparse_format::{SparseBuilder, SparseFile};
