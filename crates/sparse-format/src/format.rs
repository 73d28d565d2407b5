//! On-disk layout of Android sparse images.
//!
//! An image is a 28-byte file header followed by `total_chunks` chunks.
//! Every chunk starts with a 12-byte chunk header; all integers are
//! little-endian.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Magic number at the start of every sparse image.
pub const SPARSE_MAGIC: u32 = 0xed26_ff3a;

/// Major version understood by this crate.
pub const MAJOR_VERSION: u16 = 1;

/// Minor version written by [`crate::SparseBuilder`].
pub const MINOR_VERSION: u16 = 0;

/// Size of the file header as written by this crate.
pub const FILE_HEADER_SIZE: u16 = 28;

/// Size of a chunk header as written by this crate.
pub const CHUNK_HEADER_SIZE: u16 = 12;

/// Raw chunk: payload copied verbatim to the output.
pub const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk: a 4-byte pattern repeated across the output range.
pub const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Don't-care chunk: no payload, output is unspecified (read as zeros).
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk: checksum of the preceding data, no output.
pub const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Kind of a sparse chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl ChunkType {
    /// Decode a chunk type from its on-disk value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            CHUNK_TYPE_RAW => Some(ChunkType::Raw),
            CHUNK_TYPE_FILL => Some(ChunkType::Fill),
            CHUNK_TYPE_DONT_CARE => Some(ChunkType::DontCare),
            CHUNK_TYPE_CRC32 => Some(ChunkType::Crc32),
            _ => None,
        }
    }

    /// On-disk value of this chunk type.
    pub fn as_u16(self) -> u16 {
        match self {
            ChunkType::Raw => CHUNK_TYPE_RAW,
            ChunkType::Fill => CHUNK_TYPE_FILL,
            ChunkType::DontCare => CHUNK_TYPE_DONT_CARE,
            ChunkType::Crc32 => CHUNK_TYPE_CRC32,
        }
    }
}

/// Sparse image file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub major_version: u16,
    pub minor_version: u16,
    /// Size of the file header in bytes; anything past 28 is skipped.
    pub file_header_size: u16,
    /// Size of each chunk header in bytes; anything past 12 is skipped.
    pub chunk_header_size: u16,
    /// Output block size in bytes.
    pub block_size: u32,
    /// Number of output blocks.
    pub total_blocks: u32,
    /// Number of chunks following the header.
    pub total_chunks: u32,
    /// CRC32 of the output; not verified by the decoder.
    pub image_checksum: u32,
}

impl FileHeader {
    /// Header for a fresh image with the given geometry.
    pub fn new(block_size: u32, total_blocks: u32, total_chunks: u32) -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            file_header_size: FILE_HEADER_SIZE,
            chunk_header_size: CHUNK_HEADER_SIZE,
            block_size,
            total_blocks,
            total_chunks,
            image_checksum: 0,
        }
    }

    /// Read and validate a header from the current position of `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| truncated_header(e, "magic"))?;
        if magic != SPARSE_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let header = Self::read_fields(reader).map_err(|e| truncated_header(e, "fields"))?;
        header.validate()?;
        Ok(header)
    }

    fn read_fields<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            major_version: reader.read_u16::<LittleEndian>()?,
            minor_version: reader.read_u16::<LittleEndian>()?,
            file_header_size: reader.read_u16::<LittleEndian>()?,
            chunk_header_size: reader.read_u16::<LittleEndian>()?,
            block_size: reader.read_u32::<LittleEndian>()?,
            total_blocks: reader.read_u32::<LittleEndian>()?,
            total_chunks: reader.read_u32::<LittleEndian>()?,
            image_checksum: reader.read_u32::<LittleEndian>()?,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.major_version != MAJOR_VERSION {
            return Err(Error::UnsupportedVersion {
                major: self.major_version,
                minor: self.minor_version,
            });
        }
        if self.file_header_size < FILE_HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "file header size {} is smaller than {}",
                self.file_header_size, FILE_HEADER_SIZE
            )));
        }
        if self.chunk_header_size < CHUNK_HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "chunk header size {} is smaller than {}",
                self.chunk_header_size, CHUNK_HEADER_SIZE
            )));
        }
        validate_block_size(self.block_size)
    }

    /// Write the header in its 28-byte on-disk form.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(SPARSE_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.major_version)?;
        writer.write_u16::<LittleEndian>(self.minor_version)?;
        writer.write_u16::<LittleEndian>(self.file_header_size)?;
        writer.write_u16::<LittleEndian>(self.chunk_header_size)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u32::<LittleEndian>(self.total_blocks)?;
        writer.write_u32::<LittleEndian>(self.total_chunks)?;
        writer.write_u32::<LittleEndian>(self.image_checksum)
    }

    /// Size of the decoded image in bytes.
    pub fn output_size(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }
}

/// Sparse chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    /// Output size of the chunk in blocks.
    pub chunk_blocks: u32,
    /// Input size of the chunk in bytes, header included.
    pub total_size: u32,
}

impl ChunkHeader {
    /// Read the chunk header of chunk `index` from `reader`.
    pub fn read_from<R: Read>(reader: &mut R, index: u32) -> Result<Self> {
        let (raw_type, chunk_blocks, total_size) = match read_chunk_fields(reader) {
            Ok(fields) => fields,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::InvalidChunk {
                    index,
                    reason: "truncated chunk header".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let chunk_type = ChunkType::from_u16(raw_type).ok_or(Error::UnknownChunkType {
            index,
            chunk_type: raw_type,
        })?;

        Ok(Self {
            chunk_type,
            chunk_blocks,
            total_size,
        })
    }

    /// Write the header in its 12-byte on-disk form.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.chunk_type.as_u16())?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(self.chunk_blocks)?;
        writer.write_u32::<LittleEndian>(self.total_size)
    }

    /// Payload length implied by the chunk type, checked against `total_size`.
    pub fn payload_size(&self, index: u32, header: &FileHeader) -> Result<u64> {
        let expected = match self.chunk_type {
            ChunkType::Raw => u64::from(self.chunk_blocks) * u64::from(header.block_size),
            ChunkType::Fill | ChunkType::Crc32 => 4,
            ChunkType::DontCare => 0,
        };

        let declared = u64::from(self.total_size);
        let header_size = u64::from(header.chunk_header_size);
        if declared != header_size + expected {
            return Err(Error::InvalidChunk {
                index,
                reason: format!(
                    "{:?} chunk declares {} bytes, expected {}",
                    self.chunk_type,
                    declared,
                    header_size + expected
                ),
            });
        }

        Ok(expected)
    }

    /// Output size of the chunk in bytes.
    pub fn output_size(&self, block_size: u32) -> u64 {
        match self.chunk_type {
            ChunkType::Crc32 => 0,
            _ => u64::from(self.chunk_blocks) * u64::from(block_size),
        }
    }
}

fn read_chunk_fields<R: Read>(reader: &mut R) -> io::Result<(u16, u32, u32)> {
    let chunk_type = reader.read_u16::<LittleEndian>()?;
    let _reserved = reader.read_u16::<LittleEndian>()?;
    let chunk_blocks = reader.read_u32::<LittleEndian>()?;
    let total_size = reader.read_u32::<LittleEndian>()?;
    Ok((chunk_type, chunk_blocks, total_size))
}

/// Check that `block_size` is usable as a sparse block size.
pub(crate) fn validate_block_size(block_size: u32) -> Result<()> {
    if block_size == 0 || block_size % 4 != 0 {
        return Err(Error::InvalidHeader(format!(
            "block size {} is not a non-zero multiple of 4",
            block_size
        )));
    }
    Ok(())
}

fn truncated_header(err: io::Error, what: &str) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::InvalidHeader(format!("truncated header ({})", what))
    } else {
        Error::IoError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(header: &FileHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_header_layout() {
        let header = FileHeader::new(4096, 256, 3);
        let bytes = header_bytes(&header);

        assert_eq!(bytes.len(), FILE_HEADER_SIZE as usize);
        assert_eq!(&bytes[0..4], &[0x3a, 0xff, 0x26, 0xed]);
        assert_eq!(&bytes[12..16], &4096u32.to_le_bytes());

        let parsed = FileHeader::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.output_size(), 1024 * 1024);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = header_bytes(&FileHeader::new(4096, 1, 1));
        bytes[0] = 0;

        let err = FileHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::InvalidMagic(_)));
    }

    #[test]
    fn test_header_rejects_future_major_version() {
        let mut header = FileHeader::new(4096, 1, 1);
        header.major_version = 2;

        let err = FileHeader::read_from(&mut Cursor::new(header_bytes(&header))).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedVersion { major: 2, minor: 0 }
        ));
    }

    #[test]
    fn test_header_rejects_odd_block_size() {
        let header = FileHeader::new(1022, 1, 1);

        let err = FileHeader::read_from(&mut Cursor::new(header_bytes(&header))).unwrap_err();
        assert!(err.to_string().contains("block size"));
    }

    #[test]
    fn test_truncated_header_is_structural() {
        let bytes = header_bytes(&FileHeader::new(4096, 1, 1));

        let err = FileHeader::read_from(&mut Cursor::new(&bytes[..10])).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader(_)));
        assert_eq!(err.raw_os_error(), None);
    }

    #[test]
    fn test_chunk_payload_size_checks_total() {
        let header = FileHeader::new(4096, 4, 1);
        let raw = ChunkHeader {
            chunk_type: ChunkType::Raw,
            chunk_blocks: 2,
            total_size: 12 + 8192,
        };
        assert_eq!(raw.payload_size(0, &header).unwrap(), 8192);
        assert_eq!(raw.output_size(4096), 8192);

        let bad_fill = ChunkHeader {
            chunk_type: ChunkType::Fill,
            chunk_blocks: 2,
            total_size: 12,
        };
        let err = bad_fill.payload_size(3, &header).unwrap_err();
        assert!(matches!(err, Error::InvalidChunk { index: 3, .. }));
    }

    #[test]
    fn test_unknown_chunk_type() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xbeefu16.to_le_bytes());
        bytes.extend_from_slice(&[0; 10]);

        let err = ChunkHeader::read_from(&mut Cursor::new(bytes), 7).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownChunkType {
                index: 7,
                chunk_type: 0xbeef
            }
        ));
    }

    #[test]
    fn test_crc_chunk_has_no_output() {
        let crc = ChunkHeader {
            chunk_type: ChunkType::Crc32,
            chunk_blocks: 0,
            total_size: 16,
        };
        assert_eq!(crc.output_size(4096), 0);
    }
}
