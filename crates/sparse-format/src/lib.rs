//! # sparse-format
//!
//! Core library for Android sparse image decoding and creation.
//!
//! This crate provides:
//! - Sparse header and chunk header parsing and validation
//! - [`SparseFile`], a seekable decoder over any `Read + Seek` stream
//! - [`SparseBuilder`] for writing sparse images, including chunking of
//!   raw images
//!
//! ## Example
//!
//! ```ignore
//! use sparse_format::{SparseBuilder, SparseFile};
//! use std::fs::File;
//! use std::io::SeekFrom;
//!
//! // Create a new image
//! SparseBuilder::new(4096)
//!     .with_raw(vec![0xaa; 4096])
//!     .with_fill(0, 255)
//!     .write_to("system.img")?;
//!
//! // Decode it
//! let mut sparse = SparseFile::open(File::open("system.img")?)?;
//! assert_eq!(sparse.size(), 1024 * 1024);
//! sparse.seek(SeekFrom::Start(4096))?;
//! let mut buf = [0u8; 512];
//! let n = sparse.read(&mut buf)?;
//! ```

mod builder;
mod error;
pub mod format;
mod reader;

pub use builder::SparseBuilder;
pub use error::{Error, Result};
pub use format::{ChunkHeader, ChunkType, FileHeader, SPARSE_MAGIC};
pub use reader::SparseFile;
