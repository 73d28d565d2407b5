//! Random-access decoder for sparse images.

use crate::error::{Error, Result};
use crate::format::{ChunkHeader, ChunkType, FileHeader};
use log::{debug, trace};
use std::io::{self, Read, Seek, SeekFrom};

/// Upper bound on chunk index entries reserved up front.
const INITIAL_CHUNK_CAPACITY: usize = 4096;

/// Where the bytes of an output range come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkData {
    /// Copied from the input starting at this offset.
    Raw { offset: u64 },
    /// A repeated 4-byte pattern.
    Fill([u8; 4]),
    /// Zeros.
    Zero,
}

/// One entry of the chunk index, covering output bytes `[start, end)`.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    start: u64,
    end: u64,
    data: ChunkData,
}

/// A decoded view of a sparse image.
///
/// `SparseFile` owns the stream it decodes from. Opening the image reads the
/// file header and every chunk header once to build an index; payload bytes
/// are only touched by [`SparseFile::read`].
///
/// The decoder keeps a single cursor and is not safe for concurrent use;
/// callers that share one must serialize access themselves.
#[derive(Debug)]
pub struct SparseFile<R> {
    inner: R,
    header: FileHeader,
    chunks: Vec<Chunk>,
    size: u64,
    position: u64,
}

impl<R: Read + Seek> SparseFile<R> {
    /// Decode the sparse image held by `inner`.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the header or any chunk header is
    /// malformed, or an I/O error if the stream fails.
    pub fn open(mut inner: R) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        let header = FileHeader::read_from(&mut inner)?;

        let size = header.output_size();
        let chunk_header_size = u64::from(header.chunk_header_size);
        let mut chunks =
            Vec::with_capacity((header.total_chunks as usize).min(INITIAL_CHUNK_CAPACITY));
        let mut input_offset = u64::from(header.file_header_size);
        let mut output_offset = 0u64;

        for index in 0..header.total_chunks {
            inner.seek(SeekFrom::Start(input_offset))?;
            let chunk = ChunkHeader::read_from(&mut inner, index)?;
            chunk.payload_size(index, &header)?;

            let data_offset = input_offset + chunk_header_size;
            let output_size = chunk.output_size(header.block_size);
            let output_end = output_offset
                .checked_add(output_size)
                .filter(|end| *end <= size)
                .ok_or_else(|| Error::InvalidChunk {
                    index,
                    reason: format!(
                        "output ends past the {} byte image declared by the header",
                        size
                    ),
                })?;

            let data = match chunk.chunk_type {
                ChunkType::Raw => Some(ChunkData::Raw {
                    offset: data_offset,
                }),
                ChunkType::Fill => {
                    inner.seek(SeekFrom::Start(data_offset))?;
                    let mut pattern = [0u8; 4];
                    inner.read_exact(&mut pattern).map_err(|e| truncated(e, index))?;
                    Some(ChunkData::Fill(pattern))
                }
                ChunkType::DontCare => Some(ChunkData::Zero),
                ChunkType::Crc32 => {
                    trace!("skipping CRC32 chunk {}", index);
                    None
                }
            };

            if let Some(data) = data {
                if output_size > 0 {
                    chunks.push(Chunk {
                        start: output_offset,
                        end: output_end,
                        data,
                    });
                }
            }

            output_offset = output_end;
            input_offset = input_offset
                .checked_add(u64::from(chunk.total_size))
                .ok_or_else(|| Error::InvalidChunk {
                    index,
                    reason: "input offset overflows".to_string(),
                })?;
        }

        if output_offset != size {
            return Err(Error::BlockCountMismatch {
                expected: u64::from(header.total_blocks),
                actual: output_offset / u64::from(header.block_size),
            });
        }

        let input_size = inner.seek(SeekFrom::End(0))?;
        if input_size < input_offset {
            return Err(Error::InvalidHeader(format!(
                "input truncated: chunks need {} bytes, stream has {}",
                input_offset, input_size
            )));
        }

        debug!(
            "Opened sparse image: {} chunks, {} blocks of {} bytes",
            header.total_chunks, header.total_blocks, header.block_size
        );

        Ok(Self {
            inner,
            header,
            chunks,
            size,
            position: 0,
        })
    }

    /// Move the cursor. Positions past the end are allowed and read as EOF.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };

        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(Error::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid seek to {:?}", pos),
            ))),
        }
    }

    /// Read decoded bytes at the cursor into `buf`.
    ///
    /// Returns the number of bytes produced, which is short only at the end
    /// of the image and zero at or past it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;

        while filled < buf.len() && self.position < self.size {
            let chunk = self.chunks[self.chunk_at(self.position)];
            let within = self.position - chunk.start;
            let count = (chunk.end - self.position).min((buf.len() - filled) as u64) as usize;
            let dest = &mut buf[filled..filled + count];

            match chunk.data {
                ChunkData::Raw { offset } => {
                    self.inner.seek(SeekFrom::Start(offset + within))?;
                    self.inner.read_exact(dest)?;
                }
                ChunkData::Fill(pattern) => {
                    let phase = (within % 4) as usize;
                    for (i, byte) in dest.iter_mut().enumerate() {
                        *byte = pattern[(phase + i) % 4];
                    }
                }
                ChunkData::Zero => dest.fill(0),
            }

            filled += count;
            self.position += count as u64;
        }

        Ok(filled)
    }

    fn chunk_at(&self, position: u64) -> usize {
        self.chunks.partition_point(|chunk| chunk.end <= position)
    }
}

impl<R> SparseFile<R> {
    /// Size of the decoded image in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The parsed file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Number of chunks that produce output.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for SparseFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SparseFile::read(self, buf).map_err(Into::into)
    }
}

impl<R: Read + Seek> Seek for SparseFile<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        SparseFile::seek(self, pos).map_err(Into::into)
    }
}

fn truncated(err: io::Error, index: u32) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::InvalidChunk {
            index,
            reason: "truncated fill pattern".to_string(),
        }
    } else {
        Error::IoError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SparseBuilder;
    use std::io::Cursor;

    fn open(bytes: Vec<u8>) -> SparseFile<Cursor<Vec<u8>>> {
        SparseFile::open(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_fill_pattern_keeps_phase() {
        let image = SparseBuilder::new(8)
            .with_fill(0x0403_0201, 2)
            .to_bytes()
            .unwrap();
        let mut sparse = open(image);

        sparse.seek(SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(sparse.read(&mut buf).unwrap(), 6);
        assert_eq!(buf, [4, 1, 2, 3, 4, 1]);
        assert_eq!(sparse.position(), 9);
    }

    #[test]
    fn test_read_crosses_chunk_boundaries() {
        let image = SparseBuilder::new(4)
            .with_raw(b"abcd".to_vec())
            .with_dont_care(1)
            .with_crc32(0xdead_beef)
            .with_fill(u32::from_le_bytes(*b"wxyz"), 1)
            .to_bytes()
            .unwrap();
        let mut sparse = open(image);
        assert_eq!(sparse.size(), 12);
        assert_eq!(sparse.chunk_count(), 3);

        sparse.seek(SeekFrom::Start(2)).unwrap();
        let mut buf = [0xffu8; 16];
        assert_eq!(sparse.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"cd\0\0\0\0wxyz");
    }

    #[test]
    fn test_read_past_end_is_empty() {
        let image = SparseBuilder::new(4).with_raw(b"abcd".to_vec()).to_bytes().unwrap();
        let mut sparse = open(image);

        assert_eq!(sparse.seek(SeekFrom::End(100)).unwrap(), 104);
        let mut buf = [0u8; 4];
        assert_eq!(sparse.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_seek_before_start_fails() {
        let image = SparseBuilder::new(4).with_dont_care(1).to_bytes().unwrap();
        let mut sparse = open(image);

        let err = sparse.seek(SeekFrom::Current(-1)).unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
        assert_eq!(err.raw_os_error(), None);
        assert_eq!(sparse.position(), 0);
    }

    #[test]
    fn test_block_count_mismatch() {
        let mut image = SparseBuilder::new(4).with_dont_care(2).to_bytes().unwrap();
        // total_blocks lives at byte 16 of the header
        image[16..20].copy_from_slice(&3u32.to_le_bytes());

        let err = SparseFile::open(Cursor::new(image)).unwrap_err();
        assert!(matches!(
            err,
            Error::BlockCountMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_oversized_chunks_rejected_without_overflow() {
        // Block size 0xfffffffc, one output block, two DONT_CARE chunks of
        // u32::MAX blocks each: the summed output would overflow a u64.
        let mut image = Vec::new();
        FileHeader::new(0xffff_fffc, 1, 2).write_to(&mut image).unwrap();
        for _ in 0..2 {
            ChunkHeader {
                chunk_type: ChunkType::DontCare,
                chunk_blocks: u32::MAX,
                total_size: 12,
            }
            .write_to(&mut image)
            .unwrap();
        }

        let err = SparseFile::open(Cursor::new(image)).unwrap_err();
        assert!(matches!(err, Error::InvalidChunk { index: 0, .. }), "{:?}", err);
        assert_eq!(err.raw_os_error(), None);
    }

    #[test]
    fn test_chunk_past_declared_size_rejected() {
        let mut image = SparseBuilder::new(4)
            .with_dont_care(2)
            .with_fill(7, 1)
            .to_bytes()
            .unwrap();
        // Shrink total_blocks (byte 16) so the FILL chunk overshoots.
        image[16..20].copy_from_slice(&2u32.to_le_bytes());

        let err = SparseFile::open(Cursor::new(image)).unwrap_err();
        assert!(matches!(err, Error::InvalidChunk { index: 1, .. }), "{:?}", err);
    }

    #[test]
    fn test_truncated_raw_payload_rejected_at_open() {
        let mut image = SparseBuilder::new(4)
            .with_raw(b"abcdefgh".to_vec())
            .to_bytes()
            .unwrap();
        image.truncate(image.len() - 3);

        let err = SparseFile::open(Cursor::new(image)).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_std_io_traits() {
        let image = SparseBuilder::new(4)
            .with_raw(b"1234".to_vec())
            .with_fill(0, 1)
            .to_bytes()
            .unwrap();
        let mut sparse = open(image);

        let mut out = Vec::new();
        Read::read_to_end(&mut sparse, &mut out).unwrap();
        assert_eq!(out, b"1234\0\0\0\0");
    }
}
