// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser for version 2 recovery fstab files. Only the fields needed to locate
//! a partition's block device are kept.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::util::DebugString;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Line {line}: Expected 5 fields: {text:?}")]
    MalformedLine { line: usize, text: DebugString },
    #[error("Line {line}: Invalid length option: {text:?}")]
    InvalidLength { line: usize, text: DebugString },
    #[error("Mount point {mount_point:?} has unknown filesystem type: {fs_type:?}")]
    UnknownFsType { mount_point: String, fs_type: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Device access type understood by the install-time interpreter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionType {
    Emmc,
}

impl PartitionType {
    pub fn from_fs_type(fs_type: &str) -> Option<Self> {
        match fs_type {
            "ext4" | "emmc" | "f2fs" | "squashfs" => Some(Self::Emmc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emmc => "EMMC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FstabEntry {
    pub mount_point: String,
    pub fs_type: String,
    pub device: String,
    /// Value of the `length=` fs_mgr option, or 0 if absent.
    pub length: i64,
    /// The full `context=...` mount option, if present.
    pub context: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fstab {
    entries: BTreeMap<String, FstabEntry>,
}

impl Fstab {
    /// Parse the contents of a recovery fstab. Entries managed by vold are
    /// skipped and the first entry for a mount point wins.
    pub fn parse(data: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for (index, line) in data.lines().enumerate() {
            let line_num = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // <src> <mnt_point> <type> <mnt_flags and options> <fs_mgr_flags>
            let pieces = line.split_whitespace().collect::<Vec<_>>();
            let [device, mount_point, fs_type, mount_flags, fs_mgr_flags] = pieces[..] else {
                return Err(Error::MalformedLine {
                    line: line_num,
                    text: DebugString::new(line),
                });
            };

            if fs_mgr_flags.contains("voldmanaged=") {
                continue;
            }

            let mut length = 0;
            for option in fs_mgr_flags.split(',') {
                if let Some(value) = option.strip_prefix("length=") {
                    length = value.parse().map_err(|_| Error::InvalidLength {
                        line: line_num,
                        text: DebugString::new(option),
                    })?;
                }
            }

            let context = mount_flags
                .split(',')
                .filter(|o| o.starts_with("context="))
                .next_back()
                .map(str::to_owned);

            entries
                .entry(mount_point.to_owned())
                .or_insert_with(|| FstabEntry {
                    mount_point: mount_point.to_owned(),
                    fs_type: fs_type.to_owned(),
                    device: device.to_owned(),
                    length,
                    context,
                });
        }

        Ok(Self { entries })
    }

    pub fn get(&self, mount_point: &str) -> Option<&FstabEntry> {
        self.entries.get(mount_point)
    }

    /// Look up the partition type and device path for a mount point. A missing
    /// entry is not an error, but an entry with an unrecognized filesystem
    /// type is.
    pub fn type_and_device(&self, mount_point: &str) -> Result<Option<(PartitionType, &str)>> {
        let Some(entry) = self.entries.get(mount_point) else {
            return Ok(None);
        };

        let partition_type =
            PartitionType::from_fs_type(&entry.fs_type).ok_or_else(|| Error::UnknownFsType {
                mount_point: mount_point.to_owned(),
                fs_type: entry.fs_type.clone(),
            })?;

        Ok(Some((partition_type, &entry.device)))
    }
}
