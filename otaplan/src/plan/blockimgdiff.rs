// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Block-level transfer planning between two images.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Config,
    diff::{self, DiffFile, Difference},
    format::{
        rangeset::RangeSet,
        transfer::{self, Command, TransferList},
    },
    image::{self, COPY_FILE, Image, ZERO_FILE},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read image")]
    Image(#[from] image::Error),
    #[error("Failed to compute file diffs")]
    Diff(#[from] diff::Error),
    #[error("Failed to build transfer list")]
    Transfer(#[from] transfer::Error),
    #[error("Failed to write {0:?}")]
    Write(PathBuf, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Paths of the three artifacts produced for a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub transfer_list: PathBuf,
    pub new_data: PathBuf,
    pub patch_data: PathBuf,
}

impl ArtifactPaths {
    /// Append `.transfer.list`, `.new.dat`, and `.patch.dat` to `prefix`.
    pub fn from_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut path = OsString::from(prefix.as_os_str());
            path.push(suffix);
            PathBuf::from(path)
        };

        Self {
            transfer_list: with_suffix(".transfer.list"),
            new_data: with_suffix(".new.dat"),
            patch_data: with_suffix(".patch.dat"),
        }
    }
}

/// Summary of a computed transfer, needed to write the verification script.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferPlan {
    /// Source blocks read by the transfer.
    pub touched_src_ranges: RangeSet,
    /// SHA-1 of [`Self::touched_src_ranges`] in the source image.
    pub touched_src_sha1: String,
    /// Maximum number of blocks stashed at any point during the transfer.
    pub max_stashed_blocks: u64,
}

/// Computes the transfer list, new data, and patch data that turn `src` into
/// `tgt`. Without a source, every block is written from the new data.
pub trait BlockImageDiff {
    fn compute(
        &self,
        tgt: &dyn Image,
        src: Option<&dyn Image>,
        version: u32,
        prefix: &Path,
    ) -> Result<TransferPlan>;
}

enum Step {
    Zero(RangeSet),
    New(RangeSet),
    Move {
        src_hash: String,
        tgt: RangeSet,
        src: RangeSet,
    },
    Diff {
        index: usize,
        src_hash: String,
        tgt_hash: String,
        tgt: RangeSet,
        src: RangeSet,
    },
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Transfer planner that never stashes blocks. Files are processed in order of
/// their first target block and any file whose source blocks were already
/// overwritten is sent as new data instead.
pub struct BlockImageDiffer<'a> {
    config: &'a Config,
}

impl<'a> BlockImageDiffer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn plan_steps(
        &self,
        tgt: &dyn Image,
        src: Option<&dyn Image>,
    ) -> Result<(Vec<Step>, Vec<Difference>)> {
        let mut files = tgt.file_map().iter().collect::<Vec<_>>();
        files.sort_by_key(|(_, r)| r.start());

        let mut steps = vec![];
        let mut diffs = vec![];
        let mut written = RangeSet::new();

        for (name, tgt_ranges) in files {
            let src_ranges = src.and_then(|s| s.file_map().get(name).map(|r| (s, r)));

            let step = match src_ranges {
                _ if name == ZERO_FILE => Step::Zero(tgt_ranges.clone()),
                _ if name == COPY_FILE => Step::New(tgt_ranges.clone()),
                Some((src, src_ranges)) if !src_ranges.overlaps(&written) => {
                    let tgt_data = tgt.read_ranges(tgt_ranges)?;
                    let src_data = src.read_ranges(src_ranges)?;

                    if tgt_data == src_data {
                        if tgt_ranges == src_ranges {
                            debug!("Unchanged in place: {name}");
                            continue;
                        }

                        Step::Move {
                            src_hash: sha1_hex(&src_data),
                            tgt: tgt_ranges.clone(),
                            src: src_ranges.clone(),
                        }
                    } else {
                        let src_hash = sha1_hex(&src_data);
                        let tgt_hash = sha1_hex(&tgt_data);

                        diffs.push(Difference::new(
                            DiffFile::new(name.clone(), tgt_data),
                            DiffFile::new(name.clone(), src_data),
                            self.config.disable_imgdiff,
                        ));

                        Step::Diff {
                            index: diffs.len() - 1,
                            src_hash,
                            tgt_hash,
                            tgt: tgt_ranges.clone(),
                            src: src_ranges.clone(),
                        }
                    }
                }
                Some(_) => {
                    debug!("Source blocks already overwritten: {name}");
                    Step::New(tgt_ranges.clone())
                }
                None => Step::New(tgt_ranges.clone()),
            };

            written = written.union(tgt_ranges);
            steps.push(step);
        }

        // Care blocks that no file claims.
        let mapped = tgt
            .file_map()
            .values()
            .fold(RangeSet::new(), |acc, r| acc.union(r));
        let unmapped = tgt.care_map().subtract(&mapped);
        if !unmapped.is_empty() {
            steps.push(Step::New(unmapped));
        }

        if !tgt.extended().is_empty() {
            steps.push(Step::Zero(tgt.extended().clone()));
        }

        Ok((steps, diffs))
    }
}

impl BlockImageDiff for BlockImageDiffer<'_> {
    fn compute(
        &self,
        tgt: &dyn Image,
        src: Option<&dyn Image>,
        version: u32,
        prefix: &Path,
    ) -> Result<TransferPlan> {
        let paths = ArtifactPaths::from_prefix(prefix);
        let mut list = TransferList::new(version)?;

        let (steps, mut diffs) = self.plan_steps(tgt, src)?;
        diff::compute_differences(&mut diffs, self.config)?;

        let create = |path: &Path| {
            File::create(path)
                .map(BufWriter::new)
                .map_err(|e| Error::Write(path.to_owned(), e))
        };
        let mut new_data = create(&paths.new_data)?;
        let mut patch_data = create(&paths.patch_data)?;
        let mut patch_offset = 0u64;
        let mut touched = RangeSet::new();

        for step in steps {
            let command = match step {
                Step::Zero(r) => Command::Zero(r),
                Step::New(r) => {
                    let data = tgt.read_ranges(&r)?;
                    new_data
                        .write_all(&data)
                        .map_err(|e| Error::Write(paths.new_data.clone(), e))?;
                    Command::New(r)
                }
                Step::Move { src_hash, tgt, src } => {
                    touched = touched.union(&src);
                    Command::Move { src_hash, tgt, src }
                }
                Step::Diff {
                    index,
                    src_hash,
                    tgt_hash,
                    tgt: tgt_ranges,
                    src: src_ranges,
                } => match diffs[index].patch.take() {
                    Some(patch) => {
                        patch_data
                            .write_all(&patch)
                            .map_err(|e| Error::Write(paths.patch_data.clone(), e))?;
                        touched = touched.union(&src_ranges);

                        let command = Command::Diff {
                            kind: diffs[index].program.patch_kind(),
                            patch_offset,
                            patch_len: patch.len() as u64,
                            src_hash,
                            tgt_hash,
                            tgt: tgt_ranges,
                            src: src_ranges,
                        };
                        patch_offset += patch.len() as u64;
                        command
                    }
                    None => {
                        new_data
                            .write_all(&diffs[index].target.data)
                            .map_err(|e| Error::Write(paths.new_data.clone(), e))?;
                        Command::New(tgt_ranges)
                    }
                },
            };

            list.commands.push(command);
        }

        // Blocks outside the care map carry nothing. Those not read by the
        // transfer can be discarded up front.
        let dont_care = RangeSet::from_range(0..tgt.total_blocks())
            .subtract(tgt.extended())
            .subtract(tgt.care_map());
        let erase_first = dont_care.subtract(&touched);
        let erase_last = dont_care.subtract(&erase_first);

        if !erase_first.is_empty() {
            list.commands.insert(0, Command::Erase(erase_first));
        }
        if !erase_last.is_empty() {
            list.commands.push(Command::Erase(erase_last));
        }

        new_data
            .flush()
            .map_err(|e| Error::Write(paths.new_data.clone(), e))?;
        patch_data
            .flush()
            .map_err(|e| Error::Write(paths.patch_data.clone(), e))?;

        let transfer_list = create(&paths.transfer_list)?;
        list.to_writer(transfer_list)?;

        let touched_src_sha1 = match src {
            Some(src) => image::range_sha1(src, &touched)?,
            None => sha1_hex(&[]),
        };

        info!(
            "Transfer list: {} commands, {} blocks written, {} source blocks read",
            list.commands.len(),
            list.total_blocks_written(),
            touched.size(),
        );

        Ok(TransferPlan {
            touched_src_ranges: touched,
            touched_src_sha1,
            max_stashed_blocks: list.max_stashed_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs, ops::Range};

    use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;
    use crate::image::{BLOCK_SIZE, DataImage};

    fn blocks(fills: &[u8]) -> Vec<u8> {
        fills
            .iter()
            .flat_map(|f| vec![*f; BLOCK_SIZE as usize])
            .collect()
    }

    fn read_list(paths: &ArtifactPaths) -> TransferList {
        fs::read_to_string(&paths.transfer_list)
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn full_transfer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let prefix = temp_dir.path().join("system");
        let paths = ArtifactPaths::from_prefix(&prefix);
        let config = Config::default();

        let tgt = DataImage::new(blocks(&[1, 0, 2]));
        let plan = BlockImageDiffer::new(&config)
            .compute(&tgt, None, 4, &prefix)
            .unwrap();

        assert!(plan.touched_src_ranges.is_empty());
        assert_eq!(plan.max_stashed_blocks, 0);

        let list = read_list(&paths);
        assert_eq!(
            list.commands,
            [
                Command::New(RangeSet::from_ranges([0..1, 2..3])),
                Command::Zero(RangeSet::from_range(1..2)),
            ]
        );
        assert_eq!(fs::read(&paths.new_data).unwrap(), blocks(&[1, 2]));
        assert!(fs::read(&paths.patch_data).unwrap().is_empty());
    }

    #[test]
    fn unchanged_blocks_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let prefix = temp_dir.path().join("vendor");
        let config = Config::default();

        let src = DataImage::new(blocks(&[1, 0]));
        let tgt = DataImage::new(blocks(&[1, 0]));
        let plan = BlockImageDiffer::new(&config)
            .compute(&tgt, Some(&src as &dyn Image), 3, &prefix)
            .unwrap();

        assert!(plan.touched_src_ranges.is_empty());

        let list = read_list(&ArtifactPaths::from_prefix(&prefix));
        assert_eq!(list.version, 3);
        assert_eq!(list.commands, [Command::Zero(RangeSet::from_range(1..2))]);
    }

    /// Image with an explicit file layout. Blocks outside the care map belong
    /// to no file.
    struct LayoutImage {
        data: Vec<u8>,
        care_map: RangeSet,
        file_map: BTreeMap<String, RangeSet>,
        empty: RangeSet,
    }

    impl Image for LayoutImage {
        fn total_blocks(&self) -> u64 {
            self.data.len() as u64 / BLOCK_SIZE
        }

        fn care_map(&self) -> &RangeSet {
            &self.care_map
        }

        fn clobbered_blocks(&self) -> &RangeSet {
            &self.empty
        }

        fn extended(&self) -> &RangeSet {
            &self.empty
        }

        fn file_map(&self) -> &BTreeMap<String, RangeSet> {
            &self.file_map
        }

        fn read_ranges_into(
            &self,
            ranges: &RangeSet,
            callback: &mut dyn FnMut(&[u8]),
        ) -> image::Result<()> {
            for range in ranges.iter() {
                callback(&self.data[byte_span(range)]);
            }

            Ok(())
        }
    }

    fn byte_span(range: &Range<u64>) -> Range<usize> {
        (range.start * BLOCK_SIZE) as usize..(range.end * BLOCK_SIZE) as usize
    }

    /// A file is described by the fill byte of each of its blocks.
    type FileFills = (String, Vec<u8>);

    /// Scatter the blocks of every file over the image, keeping each file's
    /// blocks in ascending order. `spare` blocks are left out of the care map
    /// and hold garbage.
    fn layout_image(rng: &mut StdRng, files: &[FileFills], spare: u64) -> LayoutImage {
        let total = files.iter().map(|(_, f)| f.len() as u64).sum::<u64>() + spare;
        let mut slots = (0..total).collect::<Vec<_>>();
        slots.shuffle(rng);

        let mut data = vec![0xdd; (total * BLOCK_SIZE) as usize];
        let mut file_map = BTreeMap::new();
        let mut slots = slots.into_iter();

        for (name, fills) in files {
            let mut positions = slots.by_ref().take(fills.len()).collect::<Vec<_>>();
            positions.sort_unstable();

            for (&pos, &fill) in positions.iter().zip(fills) {
                data[byte_span(&(pos..pos + 1))].fill(fill);
            }

            file_map.insert(
                name.clone(),
                positions.iter().map(|&p| p..p + 1).collect::<RangeSet>(),
            );
        }

        let care_map = file_map
            .values()
            .fold(RangeSet::new(), |acc, r: &RangeSet| acc.union(r));

        LayoutImage {
            data,
            care_map,
            file_map,
            empty: RangeSet::new(),
        }
    }

    fn random_fills(rng: &mut StdRng, blocks: usize) -> Vec<u8> {
        (0..blocks).map(|_| rng.gen_range(1..=u8::MAX)).collect()
    }

    /// Source and target builds where target files are dropped, kept, edited,
    /// rewritten, or added relative to the source.
    fn random_pair(rng: &mut StdRng) -> (LayoutImage, LayoutImage) {
        let mut src_files = vec![];
        for i in 0..rng.gen_range(1..=5) {
            let blocks = rng.gen_range(1..=4);
            src_files.push((format!("f{i}"), random_fills(rng, blocks)));
        }

        let mut tgt_files = vec![];
        for (name, fills) in &src_files {
            let fills = match rng.gen_range(0..4) {
                0 => continue,
                1 => fills.clone(),
                2 => {
                    let mut fills = fills.clone();
                    let i = rng.gen_range(0..fills.len());
                    fills[i] = fills[i] % u8::MAX + 1;
                    fills
                }
                _ => {
                    let blocks = rng.gen_range(1..=4);
                    random_fills(rng, blocks)
                }
            };
            tgt_files.push((name.clone(), fills));
        }
        for i in 0..rng.gen_range(1..=2) {
            let blocks = rng.gen_range(1..=3);
            tgt_files.push((format!("g{i}"), random_fills(rng, blocks)));
        }

        for files in [&mut src_files, &mut tgt_files] {
            let zero_blocks = rng.gen_range(0..=2);
            if zero_blocks > 0 {
                files.push((ZERO_FILE.to_owned(), vec![0; zero_blocks]));
            }
        }

        let src_spare = rng.gen_range(0..=2);
        let tgt_spare = rng.gen_range(0..=3);
        let src = layout_image(rng, &src_files, src_spare);
        let tgt = layout_image(rng, &tgt_files, tgt_spare);

        (src, tgt)
    }

    fn read_blocks(device: &[u8], ranges: &RangeSet) -> Vec<u8> {
        ranges
            .iter()
            .flat_map(|r| &device[byte_span(r)])
            .copied()
            .collect()
    }

    fn write_blocks(device: &mut [u8], ranges: &RangeSet, mut data: &[u8]) {
        for r in ranges.iter() {
            let span = byte_span(r);
            let (head, tail) = data.split_at(span.len());
            device[span].copy_from_slice(head);
            data = tail;
        }

        assert!(data.is_empty());
    }

    /// Apply the transfer list the way the device does. Every source hash is
    /// checked against the blocks present at that point, so reading blocks
    /// that an earlier command overwrote fails. The diff program copies the
    /// target, so a patch is the target data itself.
    fn apply(list: &TransferList, device: &mut [u8], mut new_data: &[u8], patch_data: &[u8]) {
        for command in &list.commands {
            match command {
                Command::Erase(r) => {
                    write_blocks(device, r, &vec![0xee; (r.size() * BLOCK_SIZE) as usize]);
                }
                Command::Zero(r) => {
                    write_blocks(device, r, &vec![0; (r.size() * BLOCK_SIZE) as usize]);
                }
                Command::New(r) => {
                    let (head, tail) = new_data.split_at((r.size() * BLOCK_SIZE) as usize);
                    write_blocks(device, r, head);
                    new_data = tail;
                }
                Command::Move { src_hash, tgt, src } => {
                    let data = read_blocks(device, src);
                    assert_eq!(&sha1_hex(&data), src_hash, "{command}");
                    write_blocks(device, tgt, &data);
                }
                Command::Diff {
                    patch_offset,
                    patch_len,
                    src_hash,
                    tgt_hash,
                    tgt,
                    src,
                    ..
                } => {
                    let data = read_blocks(device, src);
                    assert_eq!(&sha1_hex(&data), src_hash, "{command}");

                    let start = *patch_offset as usize;
                    let patch = &patch_data[start..start + *patch_len as usize];
                    assert_eq!(&sha1_hex(patch), tgt_hash, "{command}");
                    write_blocks(device, tgt, patch);
                }
            }
        }

        assert!(new_data.is_empty(), "{} bytes of new data unused", new_data.len());
    }

    fn stub_config(script: &str) -> Config {
        Config {
            worker_threads: 2,
            bsdiff_program: vec![
                "sh".to_owned(),
                "-c".to_owned(),
                script.to_owned(),
                "sh".to_owned(),
            ],
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn incremental_transfers_reproduce_target() {
        let temp_dir = tempfile::tempdir().unwrap();
        let copying = stub_config("cat \"$2\" > \"$3\"");
        // Every diff fails, so changed files must fall back to new data.
        let failing = stub_config("exit 1");

        let mut moves = 0;
        let mut diffs = 0;
        let mut erases = 0;

        for case in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(case);
            let (src, tgt) = random_pair(&mut rng);
            let diffs_fail = case % 4 == 3;
            let config = if diffs_fail { &failing } else { &copying };
            let version = if case % 2 == 0 { 4 } else { 3 };

            let prefix = temp_dir.path().join(format!("case{case}"));
            let paths = ArtifactPaths::from_prefix(&prefix);
            let plan = BlockImageDiffer::new(config)
                .compute(&tgt, Some(&src as &dyn Image), version, &prefix)
                .unwrap();

            let list = read_list(&paths);
            let new_data = fs::read(&paths.new_data).unwrap();
            let patch_data = fs::read(&paths.patch_data).unwrap();

            let mut device = src.data.clone();
            device.resize(src.data.len().max(tgt.data.len()), 0);
            apply(&list, &mut device, &new_data, &patch_data);

            assert_eq!(
                read_blocks(&device, &tgt.care_map),
                tgt.read_ranges(&tgt.care_map).unwrap(),
                "case {case}",
            );

            // Source blocks that are read survive until they are read, and
            // every block outside the care map is discarded exactly once.
            let dont_care = RangeSet::from_range(0..tgt.total_blocks()).subtract(&tgt.care_map);
            let mut erased = RangeSet::new();

            for (i, command) in list.commands.iter().enumerate() {
                match command {
                    Command::Erase(r) => {
                        if i == 0 {
                            assert!(!r.overlaps(&plan.touched_src_ranges), "case {case}");
                        } else {
                            assert_eq!(i, list.commands.len() - 1, "case {case}");
                        }
                        assert!(!r.overlaps(&erased), "case {case}");
                        erased = erased.union(r);
                        erases += 1;
                    }
                    Command::Move { src, .. } => {
                        assert!(src.subtract(&plan.touched_src_ranges).is_empty());
                        moves += 1;
                    }
                    Command::Diff { src, .. } => {
                        assert!(src.subtract(&plan.touched_src_ranges).is_empty());
                        assert!(!diffs_fail, "case {case}");
                        diffs += 1;
                    }
                    _ => {}
                }
            }

            assert_eq!(erased, dont_care, "case {case}");
            assert_eq!(
                plan.touched_src_sha1,
                image::range_sha1(&src, &plan.touched_src_ranges).unwrap(),
            );
        }

        assert!(moves > 0);
        assert!(diffs > 0);
        assert!(erases > 0);
    }
}
