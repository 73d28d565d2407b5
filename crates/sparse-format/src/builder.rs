use crate::format::{validate_block_size, ChunkHeader, ChunkType, FileHeader, CHUNK_HEADER_SIZE};
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Largest RAW chunk produced by [`SparseBuilder::from_raw_image`].
const MAX_RAW_CHUNK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingChunk {
    Raw(Vec<u8>),
    Fill { pattern: [u8; 4], blocks: u32 },
    DontCare(u32),
    Crc32(u32),
}

/// Builder for creating sparse images.
#[derive(Debug, Clone)]
pub struct SparseBuilder {
    block_size: u32,
    chunks: Vec<PendingChunk>,
}

impl SparseBuilder {
    /// Create a new builder for images with the given block size.
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            chunks: Vec::new(),
        }
    }

    /// Append a RAW chunk. The length must be a multiple of the block size.
    pub fn with_raw(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.chunks.push(PendingChunk::Raw(data.into()));
        self
    }

    /// Append a FILL chunk repeating `pattern` (little-endian) over `blocks`.
    pub fn with_fill(mut self, pattern: u32, blocks: u32) -> Self {
        self.chunks.push(PendingChunk::Fill {
            pattern: pattern.to_le_bytes(),
            blocks,
        });
        self
    }

    /// Append a DONT_CARE chunk spanning `blocks`.
    pub fn with_dont_care(mut self, blocks: u32) -> Self {
        self.chunks.push(PendingChunk::DontCare(blocks));
        self
    }

    /// Append a CRC32 chunk.
    pub fn with_crc32(mut self, crc: u32) -> Self {
        self.chunks.push(PendingChunk::Crc32(crc));
        self
    }

    /// Chunk a raw image.
    ///
    /// Blocks consisting of a single repeated 4-byte pattern become FILL
    /// chunks, everything else RAW. A trailing partial block is zero-padded.
    pub fn from_raw_image(data: &[u8], block_size: u32) -> Self {
        let mut builder = Self::new(block_size);
        if block_size == 0 || block_size % 4 != 0 {
            // Rejected by to_bytes().
            return builder;
        }

        let block_len = block_size as usize;
        for block in data.chunks(block_len) {
            let mut block = block.to_vec();
            block.resize(block_len, 0);

            match uniform_pattern(&block) {
                Some(pattern) => builder.push_fill_block(pattern),
                None => builder.push_raw_block(block),
            }
        }

        builder
    }

    fn push_fill_block(&mut self, pattern: [u8; 4]) {
        if let Some(PendingChunk::Fill {
            pattern: last,
            blocks,
        }) = self.chunks.last_mut()
        {
            if *last == pattern && *blocks < u32::MAX {
                *blocks += 1;
                return;
            }
        }
        self.chunks.push(PendingChunk::Fill { pattern, blocks: 1 });
    }

    fn push_raw_block(&mut self, block: Vec<u8>) {
        if let Some(PendingChunk::Raw(data)) = self.chunks.last_mut() {
            if data.len() + block.len() <= MAX_RAW_CHUNK_BYTES {
                data.extend_from_slice(&block);
                return;
            }
        }
        self.chunks.push(PendingChunk::Raw(block));
    }

    /// Number of output blocks described so far.
    pub fn total_blocks(&self) -> u64 {
        let block_size = u64::from(self.block_size.max(1));
        self.chunks
            .iter()
            .map(|chunk| match chunk {
                PendingChunk::Raw(data) => data.len() as u64 / block_size,
                PendingChunk::Fill { blocks, .. } | PendingChunk::DontCare(blocks) => {
                    u64::from(*blocks)
                }
                PendingChunk::Crc32(_) => 0,
            })
            .sum()
    }

    /// Encode the image.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Write the image to the specified path.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(path)?);
        self.encode(&mut writer)?;
        writer.flush()?;

        Ok(path.to_path_buf())
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        validate_block_size(self.block_size).map_err(|e| Error::InvalidInput(e.to_string()))?;

        let total_blocks = u32::try_from(self.total_blocks()).map_err(|_| {
            Error::InvalidInput(format!(
                "{} blocks exceed the format limit",
                self.total_blocks()
            ))
        })?;
        let total_chunks = u32::try_from(self.chunks.len())
            .map_err(|_| Error::InvalidInput("too many chunks".to_string()))?;

        FileHeader::new(self.block_size, total_blocks, total_chunks).write_to(writer)?;

        for chunk in &self.chunks {
            match chunk {
                PendingChunk::Raw(data) => {
                    if data.len() % self.block_size as usize != 0 {
                        return Err(Error::InvalidInput(format!(
                            "raw chunk of {} bytes is not a multiple of block size {}",
                            data.len(),
                            self.block_size
                        )));
                    }
                    let total_size = u32::try_from(data.len() + usize::from(CHUNK_HEADER_SIZE))
                        .map_err(|_| Error::InvalidInput("raw chunk too large".to_string()))?;
                    let header = ChunkHeader {
                        chunk_type: ChunkType::Raw,
                        chunk_blocks: (data.len() / self.block_size as usize) as u32,
                        total_size,
                    };
                    header.write_to(writer)?;
                    writer.write_all(data)?;
                }
                PendingChunk::Fill { pattern, blocks } => {
                    let header = ChunkHeader {
                        chunk_type: ChunkType::Fill,
                        chunk_blocks: *blocks,
                        total_size: u32::from(CHUNK_HEADER_SIZE) + 4,
                    };
                    header.write_to(writer)?;
                    writer.write_all(pattern)?;
                }
                PendingChunk::DontCare(blocks) => {
                    let header = ChunkHeader {
                        chunk_type: ChunkType::DontCare,
                        chunk_blocks: *blocks,
                        total_size: u32::from(CHUNK_HEADER_SIZE),
                    };
                    header.write_to(writer)?;
                }
                PendingChunk::Crc32(crc) => {
                    let header = ChunkHeader {
                        chunk_type: ChunkType::Crc32,
                        chunk_blocks: 0,
                        total_size: u32::from(CHUNK_HEADER_SIZE) + 4,
                    };
                    header.write_to(writer)?;
                    writer.write_all(&crc.to_le_bytes())?;
                }
            }
        }

        Ok(())
    }
}

/// The repeated 4-byte pattern of `block`, if it has one.
fn uniform_pattern(block: &[u8]) -> Option<[u8; 4]> {
    let mut words = block.chunks_exact(4);
    let first: [u8; 4] = words.next()?.try_into().ok()?;
    words.all(|word| word == first).then_some(first)
}
