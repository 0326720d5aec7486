// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Run-wide settings. A [`Config`] is passed explicitly to everything that
//! needs it instead of being read from global state.

use std::{num::NonZeroUsize, thread, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{
    compression::CompressedFormat,
    transfer::{MAX_VERSION, MIN_VERSION},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse config")]
    Parse(#[from] toml_edit::de::Error),
    #[error("worker_threads must be at least 1")]
    NoWorkers,
    #[error("block_image_version must be between {MIN_VERSION} and {MAX_VERSION}: {0}")]
    UnsupportedVersion(u32),
    #[error("{0} must not be empty")]
    EmptyProgram(&'static str),
}

type Result<T> = std::result::Result<T, Error>;

fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of concurrent diff processes.
    pub worker_threads: usize,
    /// Wall-clock limit for a single diff process.
    pub diff_timeout_secs: u64,
    /// Time to wait between asking a timed-out process to terminate and
    /// killing it.
    pub terminate_grace_secs: u64,
    /// Transfer list protocol version.
    pub block_image_version: u32,
    /// Maximum number of bytes an update may stash on the device cache. No
    /// limit if unset.
    pub stash_budget: Option<u64>,
    /// Compressor for the new data of full installs.
    pub new_data_compression: CompressedFormat,
    pub compression_level: u32,
    /// Use bsdiff for every file.
    pub disable_imgdiff: bool,
    /// Command prefix for bsdiff. The source, target, and patch paths are
    /// appended.
    pub bsdiff_program: Vec<String>,
    /// Command prefix for imgdiff.
    pub imgdiff_program: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            diff_timeout_secs: 300,
            terminate_grace_secs: 5,
            block_image_version: MAX_VERSION,
            stash_budget: None,
            new_data_compression: CompressedFormat::Xz,
            compression_level: 6,
            disable_imgdiff: false,
            bsdiff_program: vec!["bsdiff".to_owned()],
            imgdiff_program: vec!["imgdiff".to_owned()],
        }
    }
}

impl Config {
    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Self = toml_edit::de::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::NoWorkers);
        } else if !(MIN_VERSION..=MAX_VERSION).contains(&self.block_image_version) {
            return Err(Error::UnsupportedVersion(self.block_image_version));
        } else if self.bsdiff_program.is_empty() {
            return Err(Error::EmptyProgram("bsdiff_program"));
        } else if self.imgdiff_program.is_empty() {
            return Err(Error::EmptyProgram("imgdiff_program"));
        }

        Ok(())
    }

    pub fn diff_timeout(&self) -> Duration {
        Duration::from_secs(self.diff_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}
