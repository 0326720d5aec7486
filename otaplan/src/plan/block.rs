// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Per-partition update planning and the script statements that verify and
//! apply it.

use std::{
    fmt,
    fs::File,
    io::{self, Write},
    path::PathBuf,
};

use sha1::{Digest, Sha1};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Config,
    format::{
        compression::{CompressedFormat, CompressedWriter},
        fstab::{self, Fstab},
        rangeset::RangeSet,
        transfer::MIN_VERSION,
    },
    image::{self, Image},
    output::{self, OutputSink},
    plan::blockimgdiff::{self, ArtifactPaths, BlockImageDiff, TransferPlan},
    script::{self, Failure, ScriptSink},
    util::{self, NumBytes},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition name: {0:?}")]
    InvalidName(String),
    #[error("Transfer list version {0} does not support verification")]
    UnsupportedVersion(u32),
    #[error("{partition}: Update needs {required:?} of cache, but only {budget:?} is allowed")]
    InsufficientCache {
        partition: String,
        required: NumBytes<u64>,
        budget: NumBytes<u64>,
    },
    #[error("No fstab entry for non-dynamic partition: {0:?}")]
    DeviceNotFound(String),
    #[error("Failed to look up device")]
    Fstab(#[from] fstab::Error),
    #[error("Failed to create temporary directory")]
    TempDir(#[source] io::Error),
    #[error("Failed to compute transfer")]
    Transfer(#[from] blockimgdiff::Error),
    #[error("Failed to hash image")]
    Image(#[from] image::Error),
    #[error("Failed to write artifact")]
    Output(#[from] output::Error),
    #[error("Failed to compress new data: {0:?}")]
    Compress(PathBuf, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How the install-time interpreter refers to a partition's block device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceRef {
    /// A dynamic partition, mapped by name at install time.
    Dynamic(String),
    /// A fixed device path.
    Path(String),
}

impl DeviceRef {
    /// Dynamic partitions are always mapped by name. Everything else must have
    /// an entry for `/<partition>` in the recovery fstab.
    pub fn resolve(partition: &str, is_dynamic: bool, fstab: Option<&Fstab>) -> Result<Self> {
        if is_dynamic {
            return Ok(Self::Dynamic(partition.to_owned()));
        }

        let mount_point = format!("/{partition}");

        match fstab.map(|f| f.type_and_device(&mount_point)).transpose()? {
            Some(Some((_, device))) => Ok(Self::Path(device.to_owned())),
            _ => Err(Error::DeviceNotFound(partition.to_owned())),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic(p) => write!(f, "map_partition(\"{p}\")"),
            Self::Path(p) => write!(f, "\"{p}\""),
        }
    }
}

/// SHA-1 of `num_blocks` blocks of zeros.
fn hash_zero_blocks(num_blocks: u64, block_size: u64) -> String {
    let mut hasher = Sha1::new();
    let mut remain = num_blocks * block_size;

    while remain > 0 {
        let n = remain.min(util::ZEROS.len() as u64);
        hasher.update(&util::ZEROS[..n as usize]);
        remain -= n;
    }

    hex::encode(hasher.finalize())
}

/// The update of a single partition from an optional source image to a target
/// image. The transfer is computed when this is constructed and the artifacts
/// are kept in a temporary directory until this is dropped.
pub struct BlockDifference {
    partition: String,
    tgt: Box<dyn Image>,
    src: Option<Box<dyn Image>>,
    version: u32,
    check_first_block: bool,
    device: DeviceRef,
    plan: TransferPlan,
    artifacts: ArtifactPaths,
    compression: CompressedFormat,
    compression_level: u32,
    _temp_dir: TempDir,
}

impl fmt::Debug for BlockDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDifference")
            .field("partition", &self.partition)
            .field("version", &self.version)
            .field("device", &self.device)
            .field("full", &self.src.is_none())
            .finish_non_exhaustive()
    }
}

impl BlockDifference {
    pub fn new(
        partition: impl Into<String>,
        tgt: Box<dyn Image>,
        src: Option<Box<dyn Image>>,
        device: DeviceRef,
        check_first_block: bool,
        differ: &dyn BlockImageDiff,
        config: &Config,
    ) -> Result<Self> {
        let partition = partition.into();
        if !util::is_safe_name(&partition) {
            return Err(Error::InvalidName(partition));
        }

        let version = config.block_image_version;
        if version < MIN_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let temp_dir = TempDir::new().map_err(Error::TempDir)?;
        let prefix = temp_dir.path().join(&partition);

        info!("Computing transfer for {partition}");
        let plan = differ.compute(&*tgt, src.as_deref(), version, &prefix)?;

        let required = plan.max_stashed_blocks * tgt.block_size();
        if let Some(budget) = config.stash_budget {
            if required > budget {
                return Err(Error::InsufficientCache {
                    partition,
                    required: NumBytes(required),
                    budget: NumBytes(budget),
                });
            }
        }

        Ok(Self {
            partition,
            tgt,
            src,
            version,
            check_first_block,
            device,
            plan,
            artifacts: ArtifactPaths::from_prefix(&prefix),
            compression: config.new_data_compression,
            compression_level: config.compression_level,
            _temp_dir: temp_dir,
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn tgt(&self) -> &dyn Image {
        &*self.tgt
    }

    pub fn src(&self) -> Option<&dyn Image> {
        self.src.as_deref()
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn touched_src_ranges(&self) -> &RangeSet {
        &self.plan.touched_src_ranges
    }

    /// Number of bytes the transfer needs for stashing on the device.
    pub fn required_cache(&self) -> u64 {
        self.plan.max_stashed_blocks * self.tgt.block_size()
    }

    fn code(&self, failure: Failure) -> u32 {
        script::error_code(&self.partition, failure)
    }

    fn block_image_verify_call(&self) -> String {
        let p = &self.partition;

        format!(
            "block_image_verify({}, package_extract_file(\"{p}.transfer.list\"), \
             \"{p}.new.dat\", \"{p}.patch.dat\")",
            self.device,
        )
    }

    /// Write the full update: a banner, an optional progress update, the
    /// transfer itself, and optionally the post-install verification.
    pub fn write_script(
        &self,
        script: &mut dyn ScriptSink,
        output: &mut dyn OutputSink,
        progress: Option<f64>,
        write_verify_script: bool,
    ) -> Result<()> {
        if self.src.is_none() {
            script.print(&format!(
                "Patching {} image unconditionally...",
                self.partition
            ));
        } else {
            script.print(&format!(
                "Patching {} image after verification.",
                self.partition
            ));
        }

        if let Some(progress) = progress.filter(|p| *p != 0.0) {
            script.show_progress(progress, 0);
        }

        self.write_update(script, output)?;

        if write_verify_script {
            self.write_post_install_verify_script(script)?;
        }

        Ok(())
    }

    /// Check every care map block, including clobbered blocks, without
    /// aborting. Unlike [`Self::write_verify_script`], a partially updated
    /// image never passes.
    pub fn write_strict_verify_script(&self, script: &mut dyn ScriptSink) -> Result<()> {
        let partition = &self.partition;

        script.print(&format!("Verifying {partition}..."));
        script.append_extra(&format!(
            "range_sha1({}, \"{}\") == \"{}\" && ui_print(\"    Verified.\") || \
             ui_print(\"{partition} has unexpected contents.\");",
            self.device,
            self.tgt.care_map().to_string_raw(),
            self.tgt.total_sha1(true)?,
        ));
        script.append_extra("");

        Ok(())
    }

    /// Check that the source partition is in the expected state before the
    /// update is applied. If `touched_blocks_only` is set, only the blocks read
    /// by the transfer are checked.
    pub fn write_verify_script(
        &self,
        script: &mut dyn ScriptSink,
        touched_blocks_only: bool,
    ) -> Result<()> {
        let partition = &self.partition;

        let Some(src) = &self.src else {
            script.print(&format!(
                "Image {partition} will be patched unconditionally."
            ));
            return Ok(());
        };

        let (ranges, expected_sha1) = if touched_blocks_only {
            (
                self.plan.touched_src_ranges.clone(),
                self.plan.touched_src_sha1.clone(),
            )
        } else {
            (
                src.care_map().subtract(src.clobbered_blocks()),
                src.total_sha1(false)?,
            )
        };

        if ranges.is_empty() {
            debug!("{partition}: No source blocks to verify");
            return Ok(());
        }

        let ranges_str = ranges.to_string_raw();
        let verify_call = self.block_image_verify_call();

        script.append_extra(&format!(
            "if (range_sha1({}, \"{ranges_str}\") == \"{expected_sha1}\" || {verify_call}) then",
            self.device,
        ));
        script.print(&format!("Verified {partition} image..."));
        script.append_extra("else");

        if self.version >= 4 {
            // Version 4 can resume a partially applied update, so try to
            // repair the blocks before giving up.
            if self.check_first_block {
                script.append_extra(&format!("check_first_block({});", self.device));
            }

            script.append_extra(&format!(
                "ifelse (block_image_recover({}, \"{ranges_str}\") && {verify_call}, \
                 ui_print(\"{partition} recovered successfully.\"), \
                 abort(\"E{}: {partition} partition fails to recover\"));\n\
                 endif;",
                self.device,
                self.code(Failure::Recover),
            ));
        } else {
            script.append_extra(&format!(
                "abort(\"E{}: {partition} partition has unexpected contents\");\n\
                 endif;",
                self.code(Failure::Verification),
            ));
        }

        Ok(())
    }

    /// Check the whole target care map after the update, including clobbered
    /// blocks. Extended blocks must read as zeros.
    pub fn write_post_install_verify_script(&self, script: &mut dyn ScriptSink) -> Result<()> {
        let partition = &self.partition;

        script.print(&format!("Verifying the updated {partition} image..."));
        script.append_extra(&format!(
            "if range_sha1({}, \"{}\") == \"{}\" then",
            self.device,
            self.tgt.care_map().to_string_raw(),
            self.tgt.total_sha1(true)?,
        ));

        let extended = self.tgt.extended();
        if !extended.is_empty() {
            script.append_extra(&format!(
                "if range_sha1({}, \"{}\") == \"{}\" then",
                self.device,
                extended.to_string_raw(),
                hash_zero_blocks(extended.size(), self.tgt.block_size()),
            ));
            script.print(&format!("Verified the updated {partition} image."));
            script.append_extra(&format!(
                "else\n  abort(\"E{}: {partition} partition has unexpected non-zero contents \
                 after OTA update\");\nendif;",
                self.code(Failure::NonzeroContents),
            ));
        } else {
            script.print(&format!("Verified the updated {partition} image."));
        }

        script.append_extra(&format!(
            "else\n  abort(\"E{}: {partition} partition has unexpected contents after OTA \
             update\");\nendif;",
            self.code(Failure::UnexpectedContents),
        ));

        Ok(())
    }

    /// Store the artifacts and write the transfer invocation. For full
    /// installs, the new data is compressed first.
    pub fn write_update(
        &self,
        script: &mut dyn ScriptSink,
        output: &mut dyn OutputSink,
    ) -> Result<()> {
        let partition = &self.partition;

        output.write_file(
            &format!("{partition}.transfer.list"),
            &self.artifacts.transfer_list,
            false,
        )?;

        let new_data_name = if self.src.is_none() && self.compression != CompressedFormat::None {
            let name = format!("{partition}.new.dat{}", self.compression.extension());
            info!("Compressing {partition}.new.dat with {:?}", self.compression);

            let compress_err = |e: io::Error| Error::Compress(self.artifacts.new_data.clone(), e);
            let mut reader = File::open(&self.artifacts.new_data).map_err(compress_err)?;
            let mut writer = CompressedWriter::new(
                output.create(&name, true)?,
                self.compression,
                self.compression_level,
            );

            io::copy(&mut reader, &mut writer).map_err(compress_err)?;
            writer
                .finish()
                .and_then(|mut w| w.flush())
                .map_err(compress_err)?;

            name
        } else {
            let name = format!("{partition}.new.dat");
            output.write_file(&name, &self.artifacts.new_data, false)?;
            name
        };

        output.write_file(
            &format!("{partition}.patch.dat"),
            &self.artifacts.patch_data,
            true,
        )?;

        script.append_extra(&format!(
            "block_image_update({}, package_extract_file(\"{partition}.transfer.list\"), \
             \"{new_data_name}\", \"{partition}.patch.dat\") ||\n  \
             abort(\"E{}: Failed to update {partition} image.\");\n\
             delete_recursive(\"/data/system/package_cache\");",
            self.device,
            self.code(Failure::Update),
        ));

        Ok(())
    }
}
