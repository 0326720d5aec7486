// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Random-access reader for Android sparse images. Unlike a streaming reader,
//! this builds an index of every chunk up front so that arbitrary block ranges
//! can be read from multiple threads at once.

use std::{fmt, io, mem};

use thiserror::Error;
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::ReadAt;

/// Magic value for [`RawHeader::magic`].
pub const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
/// CRC32 chunk type for [`RawChunk::chunk_type`].
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Invalid file header size: {0} < {size}", size = mem::size_of::<RawHeader>())]
    InvalidFileHeaderSize(u16),
    #[error("Invalid chunk header size: {0} < {size}", size = mem::size_of::<RawChunk>())]
    InvalidChunkHeaderSize(u16),
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Invalid type: {chunk_type}")]
    InvalidChunkType { index: u32, chunk_type: u16 },
    #[error("Chunk #{index}: Block count overflow: {start_block} + {chunk_size}")]
    BlockCountOverflow {
        index: u32,
        start_block: u32,
        chunk_size: u32,
    },
    #[error("Chunk #{index}: End block {end_block} exceeds total blocks {total_blocks}")]
    EndBlockExceedsTotal {
        index: u32,
        end_block: u32,
        total_blocks: u32,
    },
    #[error("Chunk #{index}: Expected total size {expected_size}, but have {total_size}")]
    InvalidChunkSize {
        index: u32,
        expected_size: u64,
        total_size: u32,
    },
    #[error("Chunks cover {actual} blocks, but header says {expected}")]
    MismatchedBlockCount { expected: u32, actual: u32 },
    // Reader errors.
    #[error("Block range {start}..{end} exceeds total blocks {total_blocks}")]
    ReadOutOfBounds {
        start: u64,
        end: u64,
        total_blocks: u32,
    },
    // Wrapped errors.
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    pub(crate) magic: little_endian::U32,
    /// Major version. [`MAJOR_VERSION`] is the only version supported.
    pub(crate) major_version: little_endian::U16,
    /// Minor version. Newer minor versions only add fields to the headers and
    /// are skipped via the header sizes.
    pub(crate) minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    pub(crate) file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`].
    pub(crate) chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    pub(crate) blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    pub(crate) total_blks: little_endian::U32,
    /// Number of chunks.
    pub(crate) total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data.
    pub(crate) image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    fn validate(&self) -> Result<()> {
        if self.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(self.magic.get()));
        }

        if self.major_version.get() != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(self.major_version.get()));
        }

        if self.file_hdr_sz.get() < mem::size_of::<Self>() as u16 {
            return Err(Error::InvalidFileHeaderSize(self.file_hdr_sz.get()));
        } else if self.chunk_hdr_sz.get() < mem::size_of::<RawChunk>() as u16 {
            return Err(Error::InvalidChunkHeaderSize(self.chunk_hdr_sz.get()));
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawChunk {
    /// Chunk type. Must be [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`],
    /// [`CHUNK_TYPE_DONT_CARE`], or [`CHUNK_TYPE_CRC32`].
    pub(crate) chunk_type: little_endian::U16,
    /// Unused.
    pub(crate) reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    pub(crate) chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    pub(crate) total_sz: little_endian::U32,
}

impl RawChunk {
    fn expected_size(&self, index: u32, header: &RawHeader) -> Result<u64> {
        let data_size = match self.chunk_type.get() {
            CHUNK_TYPE_RAW => u64::from(self.chunk_sz.get()) * u64::from(header.blk_sz.get()),
            CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => 4,
            CHUNK_TYPE_DONT_CARE => 0,
            t => {
                return Err(Error::InvalidChunkType {
                    index,
                    chunk_type: t,
                });
            }
        };

        Ok(data_size + u64::from(header.chunk_hdr_sz.get()))
    }
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// The type of data contained in a chunk. CRC32 checkpoints do not cover any
/// blocks and are not indexed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// Raw data stored at the given offset in the sparse file.
    Data { offset: u64 },
    /// Repeating pattern of the specified integer encoded in little-endian.
    Fill(u32),
    /// A hole that does not represent useful or valid data.
    Hole,
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { offset } => f.debug_struct("Data").field("offset", offset).finish(),
            Self::Fill(value) => f
                .debug_tuple("Fill")
                .field(&format_args!("{value:#010x}"))
                .finish(),
            Self::Hole => write!(f, "Hole"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

/// Check whether the reader starts with the sparse image magic.
pub fn is_sparse(reader: &impl ReadAt) -> Result<bool> {
    let mut magic = [0u8; 4];

    match reader.read_exact_at(&mut magic, 0) {
        Ok(()) => Ok(u32::from_le_bytes(magic) == HEADER_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(Error::DataRead("magic", e)),
    }
}

/// A sparse image with an in-memory chunk index.
pub struct SparseFile<R> {
    inner: R,
    block_size: u32,
    num_blocks: u32,
    chunks: Vec<Chunk>,
}

impl<R: ReadAt> SparseFile<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut buf = [0u8; mem::size_of::<RawHeader>()];
        inner
            .read_exact_at(&mut buf, 0)
            .map_err(|e| Error::DataRead("header", e))?;

        let Ok(header) = RawHeader::read_from_bytes(&buf) else {
            unreachable!("Buffer is sized for header");
        };
        header.validate()?;

        let block_size = header.blk_sz.get();
        let num_blocks = header.total_blks.get();
        let mut chunks = Vec::new();
        let mut offset = u64::from(header.file_hdr_sz.get());
        let mut block = 0u32;

        for index in 0..header.total_chunks.get() {
            let mut buf = [0u8; mem::size_of::<RawChunk>()];
            inner
                .read_exact_at(&mut buf, offset)
                .map_err(|e| Error::DataRead("chunk_header", e))?;

            let Ok(raw_chunk) = RawChunk::read_from_bytes(&buf) else {
                unreachable!("Buffer is sized for chunk header");
            };

            let expected_size = raw_chunk.expected_size(index, &header)?;
            if expected_size != u64::from(raw_chunk.total_sz.get()) {
                return Err(Error::InvalidChunkSize {
                    index,
                    expected_size,
                    total_size: raw_chunk.total_sz.get(),
                });
            }

            let end = block
                .checked_add(raw_chunk.chunk_sz.get())
                .ok_or_else(|| Error::BlockCountOverflow {
                    index,
                    start_block: block,
                    chunk_size: raw_chunk.chunk_sz.get(),
                })?;
            if end > num_blocks {
                return Err(Error::EndBlockExceedsTotal {
                    index,
                    end_block: end,
                    total_blocks: num_blocks,
                });
            }

            let data_offset = offset + u64::from(header.chunk_hdr_sz.get());
            let data = match raw_chunk.chunk_type.get() {
                CHUNK_TYPE_RAW => Some(ChunkData::Data {
                    offset: data_offset,
                }),
                CHUNK_TYPE_FILL => {
                    let mut fill = [0u8; 4];
                    inner
                        .read_exact_at(&mut fill, data_offset)
                        .map_err(|e| Error::DataRead("fill_value", e))?;
                    Some(ChunkData::Fill(u32::from_le_bytes(fill)))
                }
                CHUNK_TYPE_DONT_CARE => Some(ChunkData::Hole),
                // Checkpoints are not needed for random access.
                _ => None,
            };

            if let Some(data) = data {
                if end > block {
                    chunks.push(Chunk {
                        bounds: ChunkBounds { start: block, end },
                        data,
                    });
                }
            }

            block = end;
            offset += expected_size;
        }

        if block != num_blocks {
            return Err(Error::MismatchedBlockCount {
                expected: num_blocks,
                actual: block,
            });
        }

        Ok(Self {
            inner,
            block_size,
            num_blocks,
            chunks,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Read `buf.len() / block_size` blocks starting at block `start`. Holes
    /// read as zeros.
    pub fn read_blocks(&self, start: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = u64::from(self.block_size);
        let count = buf.len() as u64 / block_size;
        let end = start + count;

        if end > u64::from(self.num_blocks) {
            return Err(Error::ReadOutOfBounds {
                start,
                end,
                total_blocks: self.num_blocks,
            });
        }

        let mut block = start;
        let mut index = self
            .chunks
            .partition_point(|c| u64::from(c.bounds.end) <= start);
        let mut buf = &mut buf[..(count * block_size) as usize];

        while !buf.is_empty() {
            let chunk = self.chunks.get(index);

            // Blocks before the next chunk (or after the last) that no chunk
            // covers. Only possible for zero-block CRC gaps, but be safe.
            let (chunk_end, data) = match chunk {
                Some(c) if u64::from(c.bounds.start) <= block => {
                    (u64::from(c.bounds.end), Some((c.bounds, c.data)))
                }
                Some(c) => (u64::from(c.bounds.start), None),
                None => (end, None),
            };

            let n_blocks = chunk_end.min(end) - block;
            let (piece, rest) = buf.split_at_mut((n_blocks * block_size) as usize);

            match data {
                Some((bounds, ChunkData::Data { offset })) => {
                    let skip = (block - u64::from(bounds.start)) * block_size;
                    self.inner
                        .read_exact_at(piece, offset + skip)
                        .map_err(|e| Error::DataRead("chunk_data", e))?;
                }
                Some((_, ChunkData::Fill(value))) => {
                    for word in piece.chunks_exact_mut(4) {
                        word.copy_from_slice(&value.to_le_bytes());
                    }
                }
                Some((_, ChunkData::Hole)) | None => piece.fill(0),
            }

            if data.is_some() {
                index += 1;
            }

            block += n_blocks;
            buf = rest;
        }

        Ok(())
    }
}
