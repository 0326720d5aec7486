// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Block-addressed views of partition images.

use std::{collections::BTreeMap, fmt, io, ops::Range};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        blockmap::BlockMap,
        rangeset::RangeSet,
        sparse::{self, ChunkData, SparseFile},
    },
    stream::ReadAt,
    util,
};

/// Block size used by every image and by the transfer list language.
pub const BLOCK_SIZE: u64 = 4096;

/// Number of blocks past the end of each care map interval that must read as
/// zeros after an update. Filesystem tools probe these blocks when detecting
/// the filesystem type.
pub const EXTENDED_BLOCKS: u64 = 512;

/// File map entry for care blocks containing only zeros.
pub const ZERO_FILE: &str = "__ZERO";
/// File map entry for care blocks not owned by any file.
pub const NONZERO_FILE: &str = "__NONZERO";
/// File map entry for clobbered blocks.
pub const COPY_FILE: &str = "__COPY";

/// Number of blocks read at a time when streaming ranges.
const READ_CHUNK_BLOCKS: u64 = 256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported block size: {0}")]
    UnsupportedBlockSize(u64),
    #[error("Raw image size is not a multiple of {BLOCK_SIZE}: {0}")]
    UnalignedSize(u64),
    #[error("Blocks {range:?} are outside of image with {total_blocks} blocks")]
    OutOfBounds {
        range: Range<u64>,
        total_blocks: u64,
    },
    #[error("File {0:?} shares blocks with another file")]
    SharedBlocks(String),
    #[error("Failed to read sparse image")]
    Sparse(#[from] sparse::Error),
    #[error("Failed to read image")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A partition image that can be read by block ranges. Implementations must be
/// safe to read from multiple threads at once.
pub trait Image: Send + Sync {
    fn block_size(&self) -> u64 {
        BLOCK_SIZE
    }

    fn total_blocks(&self) -> u64;

    /// Blocks whose content matters.
    fn care_map(&self) -> &RangeSet;

    /// Blocks that are always rewritten, regardless of their prior content.
    fn clobbered_blocks(&self) -> &RangeSet;

    /// Blocks past the care map that must read as zeros.
    fn extended(&self) -> &RangeSet;

    /// Mapping of file paths to the blocks containing their data. Together,
    /// the entries cover the care map exactly once.
    fn file_map(&self) -> &BTreeMap<String, RangeSet>;

    /// Read the blocks in `ranges` in ascending order, passing the data to
    /// `callback` in one or more pieces.
    fn read_ranges_into(
        &self,
        ranges: &RangeSet,
        callback: &mut dyn FnMut(&[u8]),
    ) -> Result<()>;

    /// Read the blocks in `ranges` into memory.
    fn read_ranges(&self, ranges: &RangeSet) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity((ranges.size() * self.block_size()) as usize);
        self.read_ranges_into(ranges, &mut |piece: &[u8]| data.extend_from_slice(piece))?;
        Ok(data)
    }

    /// SHA-1 digest of the care map, excluding the clobbered blocks unless
    /// `include_clobbered` is set.
    fn total_sha1(&self, include_clobbered: bool) -> Result<String> {
        let ranges = if include_clobbered {
            self.care_map().clone()
        } else {
            self.care_map().subtract(self.clobbered_blocks())
        };

        range_sha1(self, &ranges)
    }
}

/// Lowercase hex SHA-1 digest of the given blocks, read in ascending order.
pub fn range_sha1(image: &(impl Image + ?Sized), ranges: &RangeSet) -> Result<String> {
    let mut hasher = Sha1::new();
    image.read_ranges_into(ranges, &mut |piece: &[u8]| hasher.update(piece))?;
    Ok(hex::encode(hasher.finalize()))
}

fn check_bounds(ranges: &RangeSet, total_blocks: u64) -> Result<()> {
    match ranges.end() {
        Some(end) if end > total_blocks => Err(Error::OutOfBounds {
            range: ranges.start().unwrap_or_default()..end,
            total_blocks,
        }),
        _ => Ok(()),
    }
}

/// Split the given blocks into those that read as zeros and the rest.
fn split_zero_blocks(
    image: &impl Image,
    ranges: &RangeSet,
) -> Result<(RangeSet, RangeSet)> {
    let block_size = image.block_size() as usize;
    let mut zero = vec![];
    let mut nonzero = vec![];

    for range in ranges.iter() {
        let mut start = range.start;

        while start < range.end {
            let end = (start + READ_CHUNK_BLOCKS).min(range.end);
            let data = image.read_ranges(&RangeSet::from_range(start..end))?;

            for (i, block) in data.chunks_exact(block_size).enumerate() {
                let block_num = start + i as u64;
                if util::is_zero(block) {
                    zero.push(block_num..block_num + 1);
                } else {
                    nonzero.push(block_num..block_num + 1);
                }
            }

            start = end;
        }
    }

    Ok((RangeSet::from_ranges(zero), RangeSet::from_ranges(nonzero)))
}

fn insert_nonempty(map: &mut BTreeMap<String, RangeSet>, name: &str, ranges: RangeSet) {
    if !ranges.is_empty() {
        map.insert(name.to_owned(), ranges);
    }
}

/// An image backed by an in-memory buffer. Every block is in the care map.
pub struct DataImage {
    data: Vec<u8>,
    care_map: RangeSet,
    clobbered_blocks: RangeSet,
    extended: RangeSet,
    file_map: BTreeMap<String, RangeSet>,
}

impl DataImage {
    /// Wrap `data`, padding it with zeros to a multiple of the block size.
    pub fn new(mut data: Vec<u8>) -> Self {
        let padding = (BLOCK_SIZE - data.len() as u64 % BLOCK_SIZE) % BLOCK_SIZE;
        data.resize(data.len() + padding as usize, 0);

        let total_blocks = data.len() as u64 / BLOCK_SIZE;
        let mut zero = vec![];
        let mut nonzero = vec![];

        for (i, block) in data.chunks_exact(BLOCK_SIZE as usize).enumerate() {
            let i = i as u64;
            if util::is_zero(block) {
                zero.push(i..i + 1);
            } else {
                nonzero.push(i..i + 1);
            }
        }

        let mut file_map = BTreeMap::new();
        insert_nonempty(&mut file_map, ZERO_FILE, RangeSet::from_ranges(zero));
        insert_nonempty(&mut file_map, NONZERO_FILE, RangeSet::from_ranges(nonzero));

        Self {
            data,
            care_map: RangeSet::from_range(0..total_blocks),
            clobbered_blocks: RangeSet::new(),
            extended: RangeSet::new(),
            file_map,
        }
    }
}

impl Image for DataImage {
    fn total_blocks(&self) -> u64 {
        self.data.len() as u64 / BLOCK_SIZE
    }

    fn care_map(&self) -> &RangeSet {
        &self.care_map
    }

    fn clobbered_blocks(&self) -> &RangeSet {
        &self.clobbered_blocks
    }

    fn extended(&self) -> &RangeSet {
        &self.extended
    }

    fn file_map(&self) -> &BTreeMap<String, RangeSet> {
        &self.file_map
    }

    fn read_ranges_into(
        &self,
        ranges: &RangeSet,
        callback: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        check_bounds(ranges, self.total_blocks())?;

        for range in ranges.iter() {
            let start = (range.start * BLOCK_SIZE) as usize;
            let end = (range.end * BLOCK_SIZE) as usize;
            callback(&self.data[start..end]);
        }

        Ok(())
    }
}

enum Backing<R> {
    Sparse(SparseFile<R>),
    Raw(R),
}

#[derive(Clone, Debug, Default)]
pub struct SparseImageOptions {
    /// Mapping of files to blocks. Without a map, the whole image is treated
    /// as anonymous data.
    pub block_map: Option<BlockMap>,
    /// Blocks that are rewritten unconditionally.
    pub clobbered_blocks: RangeSet,
    /// Assign blocks shared by multiple files to the first file only instead
    /// of failing.
    pub allow_shared_blocks: bool,
}

/// An image backed by an Android sparse image or a raw image file.
pub struct SparseImage<R> {
    backing: Backing<R>,
    total_blocks: u64,
    care_map: RangeSet,
    clobbered_blocks: RangeSet,
    extended: RangeSet,
    file_map: BTreeMap<String, RangeSet>,
}

impl<R> fmt::Debug for SparseImage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseImage")
            .field("sparse", &matches!(self.backing, Backing::Sparse(_)))
            .field("total_blocks", &self.total_blocks)
            .field("care_map", &self.care_map)
            .field("clobbered_blocks", &self.clobbered_blocks)
            .field("extended", &self.extended)
            .field("file_map", &self.file_map)
            .finish()
    }
}

impl<R: ReadAt + Send + Sync> SparseImage<R> {
    pub fn new(reader: R, options: SparseImageOptions) -> Result<Self> {
        let (backing, total_blocks, care_map) = if sparse::is_sparse(&reader)? {
            let sparse = SparseFile::new(reader)?;
            let block_size = u64::from(sparse.block_size());
            if block_size != BLOCK_SIZE {
                return Err(Error::UnsupportedBlockSize(block_size));
            }

            let care_map = sparse
                .chunks()
                .iter()
                .filter(|c| !matches!(c.data, ChunkData::Hole))
                .map(|c| u64::from(c.bounds.start)..u64::from(c.bounds.end))
                .collect::<RangeSet>();
            let total_blocks = u64::from(sparse.num_blocks());

            (Backing::Sparse(sparse), total_blocks, care_map)
        } else {
            let size = reader.file_len()?;
            if size % BLOCK_SIZE != 0 {
                return Err(Error::UnalignedSize(size));
            }

            let total_blocks = size / BLOCK_SIZE;

            (
                Backing::Raw(reader),
                total_blocks,
                RangeSet::from_range(0..total_blocks),
            )
        };

        check_bounds(&options.clobbered_blocks, total_blocks)?;

        let extended = care_map
            .extend(EXTENDED_BLOCKS)
            .intersect(&RangeSet::from_range(0..total_blocks))
            .subtract(&care_map);

        let mut image = Self {
            backing,
            total_blocks,
            care_map,
            clobbered_blocks: options.clobbered_blocks,
            extended,
            file_map: BTreeMap::new(),
        };

        image.file_map = image.build_file_map(
            options.block_map.as_ref(),
            options.allow_shared_blocks,
        )?;

        debug!(
            "Loaded image with {} blocks, {} care blocks, {} files",
            image.total_blocks,
            image.care_map.size(),
            image.file_map.len(),
        );

        Ok(image)
    }

    fn build_file_map(
        &self,
        block_map: Option<&BlockMap>,
        allow_shared_blocks: bool,
    ) -> Result<BTreeMap<String, RangeSet>> {
        let mut file_map = BTreeMap::new();
        let mut reserved = self.clobbered_blocks.clone();

        for (path, ranges) in block_map.iter().flat_map(|m| &m.entries) {
            check_bounds(ranges, self.total_blocks)?;

            let ranges = if ranges.overlaps(&reserved) {
                if !allow_shared_blocks {
                    return Err(Error::SharedBlocks(path.clone()));
                }

                ranges.subtract(&reserved)
            } else {
                ranges.clone()
            };

            if ranges.is_empty() {
                continue;
            }

            reserved = reserved.union(&ranges);
            file_map.insert(path.clone(), ranges);
        }

        let leftover = self.care_map.subtract(&reserved);
        let (zero, nonzero) = split_zero_blocks(self, &leftover)?;

        insert_nonempty(&mut file_map, ZERO_FILE, zero);
        insert_nonempty(&mut file_map, NONZERO_FILE, nonzero);
        insert_nonempty(&mut file_map, COPY_FILE, self.clobbered_blocks.clone());

        Ok(file_map)
    }
}

impl<R: ReadAt + Send + Sync> Image for SparseImage<R> {
    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn care_map(&self) -> &RangeSet {
        &self.care_map
    }

    fn clobbered_blocks(&self) -> &RangeSet {
        &self.clobbered_blocks
    }

    fn extended(&self) -> &RangeSet {
        &self.extended
    }

    fn file_map(&self) -> &BTreeMap<String, RangeSet> {
        &self.file_map
    }

    fn read_ranges_into(
        &self,
        ranges: &RangeSet,
        callback: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        check_bounds(ranges, self.total_blocks)?;

        let mut buf = vec![0u8; (READ_CHUNK_BLOCKS * BLOCK_SIZE) as usize];

        for range in ranges.iter() {
            let mut start = range.start;

            while start < range.end {
                let n = (range.end - start).min(READ_CHUNK_BLOCKS);
                let piece = &mut buf[..(n * BLOCK_SIZE) as usize];

                match &self.backing {
                    Backing::Sparse(s) => s.read_blocks(start, piece)?,
                    Backing::Raw(r) => r.read_exact_at(piece, start * BLOCK_SIZE)?,
                }

                callback(piece);
                start += n;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::sparse::tests::{TestChunk, build_sparse};

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE as usize]
    }

    #[test]
    fn data_image_file_map() {
        let mut data = block(1);
        data.extend(block(0));
        data.extend(&[2u8; 10]);

        let image = DataImage::new(data);
        assert_eq!(image.total_blocks(), 3);
        assert_eq!(image.care_map(), &RangeSet::from_range(0..3));
        assert_eq!(image.file_map()[ZERO_FILE], RangeSet::from_range(1..2));
        assert_eq!(
            image.file_map()[NONZERO_FILE],
            RangeSet::from_ranges([0..1, 2..3])
        );

        let mut expected = Sha1::new();
        expected.update(block(1));
        expected.update(block(0));
        let expected = hex::encode(expected.finalize());
        assert_eq!(
            range_sha1(&image, &RangeSet::from_range(0..2)).unwrap(),
            expected
        );

        assert_matches!(
            image.read_ranges(&RangeSet::from_range(2..4)),
            Err(Error::OutOfBounds { .. })
        );
    }

    #[test]
    fn sparse_image_care_map_and_files() {
        let mut raw = block(7);
        raw.extend(block(0));
        raw.extend(block(9));
        let data = build_sparse(
            BLOCK_SIZE as u32,
            &[
                TestChunk::Raw(&raw),
                TestChunk::Hole(1000),
                TestChunk::Fill(1, 0x01010101),
            ],
        );

        let block_map = BlockMap::from_reader("/a 0\n/b 2 1003\n".as_bytes()).unwrap();
        let image = SparseImage::new(
            data,
            SparseImageOptions {
                block_map: Some(block_map),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(image.total_blocks(), 1004);
        assert_eq!(
            image.care_map(),
            &RangeSet::from_ranges([0..3, 1003..1004])
        );
        assert_eq!(image.extended(), &RangeSet::from_range(3..1003));
        assert_eq!(image.file_map()["/a"], RangeSet::from_range(0..1));
        assert_eq!(
            image.file_map()["/b"],
            RangeSet::from_ranges([2..3, 1003..1004])
        );
        assert_eq!(image.file_map()[ZERO_FILE], RangeSet::from_range(1..2));
        assert!(!image.file_map().contains_key(NONZERO_FILE));

        let tail = image.read_ranges(&RangeSet::from_range(1003..1004)).unwrap();
        assert_eq!(tail, block(1));
    }

    #[test]
    fn shared_and_clobbered_blocks() {
        let mut data = block(1);
        data.extend(block(2));
        data.extend(block(3));

        let block_map = BlockMap::from_reader("/a 0-1\n/b 1-2\n".as_bytes()).unwrap();
        let options = SparseImageOptions {
            block_map: Some(block_map),
            clobbered_blocks: RangeSet::from_range(0..1),
            allow_shared_blocks: false,
        };

        assert_matches!(
            SparseImage::new(data.clone(), options.clone()),
            Err(Error::SharedBlocks(p)) if p == "/a"
        );

        let image = SparseImage::new(
            data,
            SparseImageOptions {
                allow_shared_blocks: true,
                ..options
            },
        )
        .unwrap();

        assert_eq!(image.file_map()[COPY_FILE], RangeSet::from_range(0..1));
        assert_eq!(image.file_map()["/a"], RangeSet::from_range(1..2));
        assert_eq!(image.file_map()["/b"], RangeSet::from_range(2..3));
        assert_ne!(image.total_sha1(true).unwrap(), image.total_sha1(false).unwrap());
    }
}
