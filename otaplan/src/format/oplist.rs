// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The dynamic partition operation list and a replayer that applies it to a
//! super partition layout the same way the install agent does.

use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Write},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::DebugString;

/// Group that always exists, has no size limit, and cannot be removed.
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Error)]
pub enum Error {
    // Parse errors.
    #[error("Line {line}: Unknown operation: {text:?}")]
    UnknownOperation { line: usize, text: DebugString },
    #[error("Line {line}: Wrong number of arguments: {text:?}")]
    WrongArgumentCount { line: usize, text: DebugString },
    #[error("Line {line}: Invalid size: {text:?}")]
    InvalidSize { line: usize, text: DebugString },
    // Replay errors.
    #[error("Partition does not exist: {0:?}")]
    PartitionNotFound(String),
    #[error("Partition already exists: {0:?}")]
    PartitionExists(String),
    #[error("Group does not exist: {0:?}")]
    GroupNotFound(String),
    #[error("Group already exists: {0:?}")]
    GroupExists(String),
    #[error("Group {group:?} would need {used} bytes, but its maximum size is {max_size}")]
    GroupOverflow {
        group: String,
        used: u64,
        max_size: u64,
    },
    #[error("Operation #{index} ({op}) failed")]
    Replay {
        index: usize,
        op: Operation,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to write op list")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A single metadata change. Sizes are in bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Resize { partition: String, size: u64 },
    ResizeGroup { group: String, size: u64 },
    Remove { partition: String },
    RemoveGroup { group: String },
    RemoveAllGroups,
    Add { partition: String, group: String },
    AddGroup { group: String, size: u64 },
    Move { partition: String, group: String },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resize { partition, size } => write!(f, "resize {partition} {size}"),
            Self::ResizeGroup { group, size } => write!(f, "resize_group {group} {size}"),
            Self::Remove { partition } => write!(f, "remove {partition}"),
            Self::RemoveGroup { group } => write!(f, "remove_group {group}"),
            Self::RemoveAllGroups => write!(f, "remove_all_groups"),
            Self::Add { partition, group } => write!(f, "add {partition} {group}"),
            Self::AddGroup { group, size } => write!(f, "add_group {group} {size}"),
            Self::Move { partition, group } => write!(f, "move {partition} {group}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpListEntry {
    Comment(String),
    Op(Operation),
}

impl fmt::Display for OpListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comment(c) => write!(f, "# {c}"),
            Self::Op(op) => write!(f, "{op}"),
        }
    }
}

/// An ordered operation list. This is replayed as a single metadata
/// transaction on the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpList {
    pub entries: Vec<OpListEntry>,
}

impl OpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.entries.push(OpListEntry::Op(op));
    }

    pub fn comment(&mut self, comment: impl Into<String>) {
        self.entries.push(OpListEntry::Comment(comment.into()));
    }

    /// Iterate over the operations, skipping comments.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().filter_map(|e| match e {
            OpListEntry::Op(op) => Some(op),
            OpListEntry::Comment(_) => None,
        })
    }

    pub fn to_writer(&self, mut writer: impl Write) -> Result<()> {
        for entry in &self.entries {
            writeln!(writer, "{entry}")?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![];
        for entry in &self.entries {
            buf.extend_from_slice(entry.to_string().as_bytes());
            buf.push(b'\n');
        }
        buf
    }
}

impl FromStr for OpList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut list = Self::new();

        for (index, line) in s.lines().enumerate() {
            let line_num = index + 1;
            let line = line.trim();

            if line.is_empty() {
                continue;
            } else if let Some(comment) = line.strip_prefix('#') {
                list.comment(comment.trim_start());
                continue;
            }

            let args = line.split_whitespace().collect::<Vec<_>>();
            let arg_count_err = || Error::WrongArgumentCount {
                line: line_num,
                text: DebugString::new(line),
            };
            let size = |text: &str| {
                text.parse::<u64>().map_err(|_| Error::InvalidSize {
                    line: line_num,
                    text: DebugString::new(text),
                })
            };

            let op = match args[0] {
                "resize" | "resize_group" | "add" | "add_group" | "move" if args.len() != 3 => {
                    return Err(arg_count_err());
                }
                "remove" | "remove_group" if args.len() != 2 => return Err(arg_count_err()),
                "remove_all_groups" if args.len() != 1 => return Err(arg_count_err()),
                "resize" => Operation::Resize {
                    partition: args[1].to_owned(),
                    size: size(args[2])?,
                },
                "resize_group" => Operation::ResizeGroup {
                    group: args[1].to_owned(),
                    size: size(args[2])?,
                },
                "remove" => Operation::Remove {
                    partition: args[1].to_owned(),
                },
                "remove_group" => Operation::RemoveGroup {
                    group: args[1].to_owned(),
                },
                "remove_all_groups" => Operation::RemoveAllGroups,
                "add" => Operation::Add {
                    partition: args[1].to_owned(),
                    group: args[2].to_owned(),
                },
                "add_group" => Operation::AddGroup {
                    group: args[1].to_owned(),
                    size: size(args[2])?,
                },
                "move" => Operation::Move {
                    partition: args[1].to_owned(),
                    group: args[2].to_owned(),
                },
                _ => {
                    return Err(Error::UnknownOperation {
                        line: line_num,
                        text: DebugString::new(line),
                    });
                }
            };

            list.push(op);
        }

        Ok(list)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionState {
    pub group: String,
    pub size: u64,
}

/// Snapshot of the super partition metadata: group ceilings and partition
/// placement. A `max_size` of 0 means the group has no limit.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SuperLayout {
    #[serde(default)]
    pub groups: BTreeMap<String, u64>,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionState>,
}

impl Default for SuperLayout {
    fn default() -> Self {
        Self {
            groups: BTreeMap::from([(DEFAULT_GROUP.to_owned(), 0)]),
            partitions: BTreeMap::new(),
        }
    }
}

impl SuperLayout {
    /// Total size of all partitions in a group.
    pub fn group_usage(&self, group: &str) -> u64 {
        self.partitions
            .values()
            .filter(|p| p.group == group)
            .map(|p| p.size)
            .sum()
    }

    fn check_group(&self, group: &str) -> Result<()> {
        let max_size = *self
            .groups
            .get(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_owned()))?;
        let used = self.group_usage(group);

        if max_size != 0 && used > max_size {
            return Err(Error::GroupOverflow {
                group: group.to_owned(),
                used,
                max_size,
            });
        }

        Ok(())
    }

    /// Check every group against its ceiling.
    pub fn validate(&self) -> Result<()> {
        for group in self.groups.keys() {
            self.check_group(group)?;
        }

        for partition in self.partitions.values() {
            if !self.groups.contains_key(&partition.group) {
                return Err(Error::GroupNotFound(partition.group.clone()));
            }
        }

        Ok(())
    }

    fn partition_mut(&mut self, partition: &str) -> Result<&mut PartitionState> {
        self.partitions
            .get_mut(partition)
            .ok_or_else(|| Error::PartitionNotFound(partition.to_owned()))
    }

    /// Apply a single operation. The layout is left unchanged if the operation
    /// fails.
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        let mut new = self.clone();

        match op {
            Operation::Resize { partition, size } => {
                let state = new.partition_mut(partition)?;
                state.size = *size;
                let group = state.group.clone();
                new.check_group(&group)?;
            }
            Operation::ResizeGroup { group, size } => {
                let max_size = new
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| Error::GroupNotFound(group.clone()))?;
                *max_size = *size;
                new.check_group(group)?;
            }
            Operation::Remove { partition } => {
                new.partitions
                    .remove(partition)
                    .ok_or_else(|| Error::PartitionNotFound(partition.clone()))?;
            }
            Operation::RemoveGroup { group } => {
                if group == DEFAULT_GROUP || new.groups.remove(group).is_none() {
                    return Err(Error::GroupNotFound(group.clone()));
                }
                new.partitions.retain(|_, p| p.group != *group);
            }
            Operation::RemoveAllGroups => {
                new.partitions.clear();
                new.groups.retain(|g, _| g == DEFAULT_GROUP);
            }
            Operation::Add { partition, group } => {
                if new.partitions.contains_key(partition) {
                    return Err(Error::PartitionExists(partition.clone()));
                } else if !new.groups.contains_key(group) {
                    return Err(Error::GroupNotFound(group.clone()));
                }
                new.partitions.insert(
                    partition.clone(),
                    PartitionState {
                        group: group.clone(),
                        size: 0,
                    },
                );
            }
            Operation::AddGroup { group, size } => {
                if new.groups.contains_key(group) {
                    return Err(Error::GroupExists(group.clone()));
                }
                new.groups.insert(group.clone(), *size);
            }
            Operation::Move { partition, group } => {
                if !new.groups.contains_key(group) {
                    return Err(Error::GroupNotFound(group.clone()));
                }
                new.partition_mut(partition)?.group = group.clone();
                new.check_group(group)?;
            }
        }

        *self = new;

        Ok(())
    }

    /// Apply every operation in order, stopping at the first failure.
    pub fn replay(&mut self, op_list: &OpList) -> Result<()> {
        for (index, op) in op_list.operations().enumerate() {
            self.apply(op).map_err(|e| Error::Replay {
                index,
                op: op.clone(),
                source: Box::new(e),
            })?;
        }

        Ok(())
    }
}
