//! FUSE binding for [`SparseFs`](crate::SparseFs).
//!
//! This module mounts the decoded image as a single read-only regular file.
//! The root inode of the mount *is* that file, so the mount point must be an
//! existing regular file rather than a directory.
//!
//! # Example
//!
//! ```ignore
//! use sparse_fs::fuse::{mount, MountConfig};
//! use sparse_fs::{MountSession, SparseFs};
//!
//! let session = MountSession::discover("system.img")?;
//! let config = MountConfig::new("system.img");
//! mount(SparseFs::new(session), "/tmp/system.raw", &config)?;
//! ```

mod adapter;
mod options;

pub use adapter::*;
pub use options::{parse_mount_options, MountConfig, OptionError};
