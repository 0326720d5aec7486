// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Planning of dynamic partition metadata changes. The operation list is
//! ordered so that no group ever holds more than its maximum size while the
//! list is being applied:
//!
//! * Partitions changing groups are staged through the unlimited `default`
//!   group.
//! * Partitions shrink before their group does.
//! * Groups grow before their partitions do.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    format::oplist::{DEFAULT_GROUP, OpList, Operation},
    output::{self, OutputSink},
    plan::block::{self, BlockDifference},
    script::ScriptSink,
    util::{self, DebugString},
};

/// Name of the op list artifact.
pub const OP_LIST_NAME: &str = "dynamic_partitions_op_list";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Duplicate BlockDifference for partitions: {0:?}")]
    DuplicateBlockDifference(Vec<String>),
    #[error("{partition:?} is in {side} group {group:?}, but no BlockDifference was provided")]
    MissingBlockDifference {
        side: &'static str,
        partition: String,
        group: String,
    },
    #[error("{partition:?} is listed in multiple {side} groups")]
    MultipleGroups {
        side: &'static str,
        partition: String,
    },
    #[error("Duplicate {side} group: {group:?}")]
    DuplicateGroup { side: &'static str, group: String },
    #[error("Group name is reserved: {0:?}")]
    ReservedGroup(String),
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
    #[error("{side} dynamic partitions {declared:?} do not match BlockDifferences with {side} images {actual:?}")]
    PartitionSetMismatch {
        side: &'static str,
        declared: Vec<String>,
        actual: Vec<String>,
    },
    #[error("{side} partition {partition:?} is not in any group")]
    Ungrouped {
        side: &'static str,
        partition: String,
    },
    #[error("{side} group {group:?} needs {used} bytes, but its maximum size is {max_size}")]
    GroupOverflow {
        side: &'static str,
        group: String,
        used: u64,
        max_size: u64,
    },
    #[error("Invalid size for {key:?}: {value:?}")]
    InvalidSize { key: String, value: DebugString },
    #[error("Failed to write partition update")]
    Block(#[from] block::Error),
    #[error("Failed to write op list")]
    Output(#[from] output::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A resizable group of dynamic partitions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DynamicGroupInfo {
    pub name: String,
    /// Maximum total size of the group's partitions in bytes. 0 means there
    /// is no limit.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub partitions: Vec<String>,
}

/// The declared dynamic partition layout of a build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DynamicPartitionsInfo {
    #[serde(default)]
    pub groups: Vec<DynamicGroupInfo>,
    /// Every dynamic partition, regardless of group.
    #[serde(default)]
    pub partitions: Vec<String>,
}

/// Parse `key=value` lines. Blank lines and `#` comments are skipped.
pub fn parse_info_dict(data: &str) -> BTreeMap<String, String> {
    data.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

impl DynamicPartitionsInfo {
    /// Load the layout from a build's info dictionary, which describes it with
    /// the `super_partition_groups`, `super_<group>_group_size`,
    /// `super_<group>_partition_list`, and `dynamic_partition_list` keys.
    pub fn from_info_dict(info: &BTreeMap<String, String>) -> Result<Self> {
        let list = |key: &str| -> Vec<String> {
            info.get(key)
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default()
        };

        let mut groups = vec![];

        for name in list("super_partition_groups") {
            let size_key = format!("super_{name}_group_size");
            let max_size = match info.get(&size_key).map(|v| v.trim()) {
                Some(v) => v.parse().map_err(|_| Error::InvalidSize {
                    key: size_key.clone(),
                    value: DebugString::new(v),
                })?,
                None => 0,
            };
            let partitions = list(&format!("super_{name}_partition_list"));

            groups.push(DynamicGroupInfo {
                name,
                max_size,
                partitions,
            });
        }

        Ok(Self {
            groups,
            partitions: list("dynamic_partition_list"),
        })
    }
}

/// What the planner needs from a partition update.
pub trait PartitionDifference {
    fn partition(&self) -> &str;

    /// Size of the source image in bytes, or 0 if there is no source.
    fn src_size(&self) -> u64;

    /// Size of the target image in bytes, or 0 if there is no target.
    fn tgt_size(&self) -> u64;

    fn write_script(
        &self,
        script: &mut dyn ScriptSink,
        output: &mut dyn OutputSink,
        progress: Option<f64>,
        write_verify_script: bool,
    ) -> block::Result<()>;

    fn write_post_install_verify_script(&self, script: &mut dyn ScriptSink) -> block::Result<()>;
}

impl PartitionDifference for BlockDifference {
    fn partition(&self) -> &str {
        self.partition()
    }

    fn src_size(&self) -> u64 {
        self.src()
            .map(|s| s.block_size() * s.total_blocks())
            .unwrap_or(0)
    }

    fn tgt_size(&self) -> u64 {
        self.tgt().block_size() * self.tgt().total_blocks()
    }

    fn write_script(
        &self,
        script: &mut dyn ScriptSink,
        output: &mut dyn OutputSink,
        progress: Option<f64>,
        write_verify_script: bool,
    ) -> block::Result<()> {
        self.write_script(script, output, progress, write_verify_script)
    }

    fn write_post_install_verify_script(&self, script: &mut dyn ScriptSink) -> block::Result<()> {
        self.write_post_install_verify_script(script)
    }
}

#[derive(Debug)]
pub struct DynamicPartitionUpdate<D> {
    /// Group in the source build, if the partition exists there.
    pub src_group: Option<String>,
    /// Group in the target build, if the partition exists there.
    pub tgt_group: Option<String>,
    /// Fraction of the progress bar for this partition's update.
    pub progress: Option<f64>,
    pub block_difference: D,
}

impl<D: PartitionDifference> DynamicPartitionUpdate<D> {
    pub fn partition(&self) -> &str {
        self.block_difference.partition()
    }

    pub fn src_size(&self) -> u64 {
        self.block_difference.src_size()
    }

    pub fn tgt_size(&self) -> u64 {
        self.block_difference.tgt_size()
    }

    fn shrinks(&self) -> bool {
        let (src, tgt) = (self.src_size(), self.tgt_size());
        src != 0 && tgt != 0 && src > tgt
    }

    fn changes_group(&self) -> bool {
        matches!(
            (&self.src_group, &self.tgt_group),
            (Some(s), Some(t)) if s != t
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicGroupUpdate {
    pub name: String,
    /// Maximum size in the source build. `None` if the group does not exist
    /// there and 0 if it is unlimited.
    pub src_size: Option<u64>,
    /// Maximum size in the target build. `None` if the group is removed and 0
    /// if it is unlimited.
    pub tgt_size: Option<u64>,
}

/// Orders group ceilings with 0 treated as unlimited.
fn ceiling(size: u64) -> u64 {
    if size == 0 { u64::MAX } else { size }
}

fn collect_groups<D: PartitionDifference>(
    side: &'static str,
    info: &DynamicPartitionsInfo,
    updates: &mut [DynamicPartitionUpdate<D>],
    select: fn(&mut DynamicPartitionUpdate<D>) -> &mut Option<String>,
) -> Result<()> {
    let mut seen_groups = BTreeSet::new();

    for group in &info.groups {
        if group.name == DEFAULT_GROUP {
            return Err(Error::ReservedGroup(group.name.clone()));
        } else if !util::is_safe_name(&group.name) {
            return Err(Error::InvalidName(group.name.clone()));
        } else if !seen_groups.insert(&group.name) {
            return Err(Error::DuplicateGroup {
                side,
                group: group.name.clone(),
            });
        }

        for partition in &group.partitions {
            let update = updates
                .iter_mut()
                .find(|u| u.partition() == partition)
                .ok_or_else(|| Error::MissingBlockDifference {
                    side,
                    partition: partition.clone(),
                    group: group.name.clone(),
                })?;

            let slot = select(update);
            if slot.is_some() {
                return Err(Error::MultipleGroups {
                    side,
                    partition: partition.clone(),
                });
            }
            *slot = Some(group.name.clone());
        }
    }

    Ok(())
}

fn check_partition_set<D: PartitionDifference>(
    side: &'static str,
    info: &DynamicPartitionsInfo,
    updates: &[DynamicPartitionUpdate<D>],
    size: fn(&DynamicPartitionUpdate<D>) -> u64,
) -> Result<()> {
    let declared = info.partitions.iter().cloned().collect::<BTreeSet<_>>();
    let actual = updates
        .iter()
        .filter(|u| size(u) != 0)
        .map(|u| u.partition().to_owned())
        .collect::<BTreeSet<_>>();

    if declared != actual {
        return Err(Error::PartitionSetMismatch {
            side,
            declared: declared.into_iter().collect(),
            actual: actual.into_iter().collect(),
        });
    }

    Ok(())
}

fn check_grouped<D: PartitionDifference>(
    side: &'static str,
    updates: &[DynamicPartitionUpdate<D>],
    size: fn(&DynamicPartitionUpdate<D>) -> u64,
    group: fn(&DynamicPartitionUpdate<D>) -> &Option<String>,
) -> Result<()> {
    match updates.iter().find(|u| size(u) != 0 && group(u).is_none()) {
        Some(u) => Err(Error::Ungrouped {
            side,
            partition: u.partition().to_owned(),
        }),
        None => Ok(()),
    }
}

fn check_group_sizes<D: PartitionDifference>(
    side: &'static str,
    info: &DynamicPartitionsInfo,
    updates: &[DynamicPartitionUpdate<D>],
    size: fn(&DynamicPartitionUpdate<D>) -> u64,
) -> Result<()> {
    for group in info.groups.iter().filter(|g| g.max_size != 0) {
        let used = updates
            .iter()
            .filter(|u| group.partitions.iter().any(|p| p == u.partition()))
            .map(size)
            .sum::<u64>();

        if used > group.max_size {
            return Err(Error::GroupOverflow {
                side,
                group: group.name.clone(),
                used,
                max_size: group.max_size,
            });
        }
    }

    Ok(())
}

/// Metadata and content changes for every dynamic partition.
#[derive(Debug)]
pub struct DynamicPartitionsDifference<D = BlockDifference> {
    partition_updates: Vec<DynamicPartitionUpdate<D>>,
    group_updates: Vec<DynamicGroupUpdate>,
    op_list: OpList,
}

impl<D: PartitionDifference> DynamicPartitionsDifference<D> {
    /// Validate the layouts against the partition updates and compute the op
    /// list. Without a `source` layout, the op list starts by removing every
    /// existing group and partition. With `build_without_vendor`, partitions
    /// are only resized.
    pub fn new(
        target: &DynamicPartitionsInfo,
        source: Option<&DynamicPartitionsInfo>,
        block_diffs: Vec<D>,
        progress: &BTreeMap<String, f64>,
        build_without_vendor: bool,
    ) -> Result<Self> {
        let remove_all_before_apply = source.is_none();
        let empty = DynamicPartitionsInfo::default();
        let source = source.unwrap_or(&empty);

        let mut names = BTreeSet::new();
        let duplicates = block_diffs
            .iter()
            .map(|d| d.partition())
            .filter(|p| !names.insert(*p))
            .map(str::to_owned)
            .collect::<BTreeSet<_>>();
        if !duplicates.is_empty() {
            return Err(Error::DuplicateBlockDifference(
                duplicates.into_iter().collect(),
            ));
        }

        let mut partition_updates = block_diffs
            .into_iter()
            .map(|d| DynamicPartitionUpdate {
                src_group: None,
                tgt_group: None,
                progress: progress.get(d.partition()).copied(),
                block_difference: d,
            })
            .collect::<Vec<_>>();

        collect_groups("target", target, &mut partition_updates, |u| {
            &mut u.tgt_group
        })?;
        collect_groups("source", source, &mut partition_updates, |u| {
            &mut u.src_group
        })?;

        check_partition_set("target", target, &partition_updates, |u| u.tgt_size())?;
        check_partition_set("source", source, &partition_updates, |u| u.src_size())?;
        check_grouped("target", &partition_updates, |u| u.tgt_size(), |u| &u.tgt_group)?;
        check_grouped("source", &partition_updates, |u| u.src_size(), |u| &u.src_group)?;
        check_group_sizes("target", target, &partition_updates, |u| u.tgt_size())?;
        check_group_sizes("source", source, &partition_updates, |u| u.src_size())?;

        if !partition_updates.is_empty() {
            info!(
                "Updating dynamic partitions {:?}",
                partition_updates
                    .iter()
                    .map(|u| u.partition())
                    .collect::<Vec<_>>(),
            );
        }

        let mut group_updates = target
            .groups
            .iter()
            .map(|g| DynamicGroupUpdate {
                name: g.name.clone(),
                src_size: None,
                tgt_size: Some(g.max_size),
            })
            .collect::<Vec<_>>();

        for group in &source.groups {
            match group_updates.iter_mut().find(|u| u.name == group.name) {
                Some(u) => u.src_size = Some(group.max_size),
                None => group_updates.push(DynamicGroupUpdate {
                    name: group.name.clone(),
                    src_size: Some(group.max_size),
                    tgt_size: None,
                }),
            }
        }

        let op_list = compute_op_list(
            &partition_updates,
            &group_updates,
            remove_all_before_apply,
            build_without_vendor,
        );

        Ok(Self {
            partition_updates,
            group_updates,
            op_list,
        })
    }

    pub fn partition_updates(&self) -> &[DynamicPartitionUpdate<D>] {
        &self.partition_updates
    }

    pub fn group_updates(&self) -> &[DynamicGroupUpdate] {
        &self.group_updates
    }

    pub fn op_list(&self) -> &OpList {
        &self.op_list
    }

    /// Write the update in the same order as the op list: shrinking
    /// partitions are patched before the metadata update and everything else
    /// after it.
    pub fn write_script(
        &self,
        script: &mut dyn ScriptSink,
        output: &mut dyn OutputSink,
        write_verify_script: bool,
    ) -> Result<()> {
        script.comment("--- Start patching dynamic partitions ---");

        for u in self.partition_updates.iter().filter(|u| u.shrinks()) {
            script.comment(&format!("Patch partition {}", u.partition()));
            u.block_difference
                .write_script(script, output, u.progress, false)?;
        }

        output.write(OP_LIST_NAME, &self.op_list.to_bytes(), false)?;

        script.comment("Update dynamic partition metadata");
        script.append_extra(&format!(
            "assert(update_dynamic_partitions(package_extract_file(\"{OP_LIST_NAME}\")));"
        ));

        if write_verify_script {
            for u in self.partition_updates.iter().filter(|u| u.shrinks()) {
                u.block_difference.write_post_install_verify_script(script)?;
                // Errors are ignored.
                script.append_extra(&format!("unmap_partition(\"{}\");", u.partition()));
            }
        }

        for u in &self.partition_updates {
            if u.tgt_size() != 0 && u.src_size() <= u.tgt_size() {
                script.comment(&format!("Patch partition {}", u.partition()));
                u.block_difference
                    .write_script(script, output, u.progress, write_verify_script)?;

                if write_verify_script {
                    script.append_extra(&format!("unmap_partition(\"{}\");", u.partition()));
                }
            }
        }

        script.comment("--- End patching dynamic partitions ---");

        Ok(())
    }
}

fn compute_op_list<D: PartitionDifference>(
    partitions: &[DynamicPartitionUpdate<D>],
    groups: &[DynamicGroupUpdate],
    remove_all_before_apply: bool,
    build_without_vendor: bool,
) -> OpList {
    let mut ops = OpList::new();

    if build_without_vendor {
        ops.comment("System-only build, keep original vendor partition");
        // Nothing may be created or removed, so existing partitions can only
        // be resized.
        for u in partitions {
            ops.comment(format!("Resize partition {} to {}", u.partition(), u.tgt_size()));
            ops.push(Operation::Resize {
                partition: u.partition().to_owned(),
                size: u.tgt_size(),
            });
        }
        return ops;
    }

    if remove_all_before_apply {
        ops.comment("Remove all existing dynamic partitions and groups before applying full OTA");
        ops.push(Operation::RemoveAllGroups);
    }

    for u in partitions {
        if u.src_group.is_some() && u.tgt_group.is_none() {
            ops.push(Operation::Remove {
                partition: u.partition().to_owned(),
            });
        }
    }

    for u in partitions.iter().filter(|u| u.changes_group()) {
        if let Some(src_group) = &u.src_group {
            ops.comment(format!(
                "Move partition {} from {src_group} to {DEFAULT_GROUP}",
                u.partition(),
            ));
            ops.push(Operation::Move {
                partition: u.partition().to_owned(),
                group: DEFAULT_GROUP.to_owned(),
            });
        }
    }

    for u in partitions.iter().filter(|u| u.shrinks()) {
        ops.comment(format!(
            "Shrink partition {} from {} to {}",
            u.partition(),
            u.src_size(),
            u.tgt_size(),
        ));
        ops.push(Operation::Resize {
            partition: u.partition().to_owned(),
            size: u.tgt_size(),
        });
    }

    for g in groups {
        match (g.src_size, g.tgt_size) {
            (Some(_), None) => ops.push(Operation::RemoveGroup {
                group: g.name.clone(),
            }),
            (Some(src), Some(tgt)) if ceiling(src) > ceiling(tgt) => {
                ops.comment(format!("Shrink group {} from {src} to {tgt}", g.name));
                ops.push(Operation::ResizeGroup {
                    group: g.name.clone(),
                    size: tgt,
                });
            }
            _ => {}
        }
    }

    for g in groups {
        match (g.src_size, g.tgt_size) {
            (None, Some(tgt)) => {
                ops.comment(format!("Add group {} with maximum size {tgt}", g.name));
                ops.push(Operation::AddGroup {
                    group: g.name.clone(),
                    size: tgt,
                });
            }
            (Some(src), Some(tgt)) if ceiling(src) < ceiling(tgt) => {
                ops.comment(format!("Grow group {} from {src} to {tgt}", g.name));
                ops.push(Operation::ResizeGroup {
                    group: g.name.clone(),
                    size: tgt,
                });
            }
            _ => {}
        }
    }

    for u in partitions {
        if let (None, Some(tgt_group)) = (&u.src_group, &u.tgt_group) {
            ops.comment(format!("Add partition {} to group {tgt_group}", u.partition()));
            ops.push(Operation::Add {
                partition: u.partition().to_owned(),
                group: tgt_group.clone(),
            });
        }
    }

    for u in partitions {
        if u.tgt_size() != 0 && u.src_size() < u.tgt_size() {
            ops.comment(format!(
                "Grow partition {} from {} to {}",
                u.partition(),
                u.src_size(),
                u.tgt_size(),
            ));
            ops.push(Operation::Resize {
                partition: u.partition().to_owned(),
                size: u.tgt_size(),
            });
        }
    }

    for u in partitions.iter().filter(|u| u.changes_group()) {
        if let Some(tgt_group) = &u.tgt_group {
            ops.comment(format!(
                "Move partition {} from {DEFAULT_GROUP} to {tgt_group}",
                u.partition(),
            ));
            ops.push(Operation::Move {
                partition: u.partition().to_owned(),
                group: tgt_group.clone(),
            });
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::oplist::OpListEntry;

    #[derive(Debug)]
    struct FakeDiff {
        name: &'static str,
        src: u64,
        tgt: u64,
    }

    impl PartitionDifference for FakeDiff {
        fn partition(&self) -> &str {
            self.name
        }

        fn src_size(&self) -> u64 {
            self.src
        }

        fn tgt_size(&self) -> u64 {
            self.tgt
        }

        fn write_script(
            &self,
            script: &mut dyn ScriptSink,
            _output: &mut dyn OutputSink,
            _progress: Option<f64>,
            _write_verify_script: bool,
        ) -> block::Result<()> {
            script.append_extra(&format!("patch {}", self.name));
            Ok(())
        }

        fn write_post_install_verify_script(
            &self,
            script: &mut dyn ScriptSink,
        ) -> block::Result<()> {
            script.append_extra(&format!("verify {}", self.name));
            Ok(())
        }
    }

    fn info(groups: &[(&str, u64, &[&str])]) -> DynamicPartitionsInfo {
        DynamicPartitionsInfo {
            groups: groups
                .iter()
                .map(|(name, max_size, partitions)| DynamicGroupInfo {
                    name: (*name).to_owned(),
                    max_size: *max_size,
                    partitions: partitions.iter().map(|p| (*p).to_owned()).collect(),
                })
                .collect(),
            partitions: groups
                .iter()
                .flat_map(|(_, _, p)| p.iter().map(|p| (*p).to_owned()))
                .collect(),
        }
    }

    fn ops(diff: &DynamicPartitionsDifference<FakeDiff>) -> Vec<String> {
        diff.op_list()
            .entries
            .iter()
            .filter(|e| matches!(e, OpListEntry::Op(_)))
            .map(|e| e.to_string())
            .collect()
    }

    #[test]
    fn info_dict() {
        let dict = parse_info_dict(
            "# comment\n\
             super_partition_groups=group_a\n\
             super_group_a_group_size=4096\n\
             super_group_a_partition_list=system vendor\n\
             dynamic_partition_list= system vendor\n\
             ignored\n",
        );
        let info = DynamicPartitionsInfo::from_info_dict(&dict).unwrap();

        assert_eq!(info, self::info(&[("group_a", 4096, &["system", "vendor"])]));

        let dict = parse_info_dict("super_partition_groups=g\nsuper_g_group_size=big\n");
        assert_matches!(
            DynamicPartitionsInfo::from_info_dict(&dict),
            Err(Error::InvalidSize { .. })
        );
    }

    #[test]
    fn shrink_partition_before_group() {
        let diff = DynamicPartitionsDifference::new(
            &info(&[("g", 50, &["p"])]),
            Some(&info(&[("g", 100, &["p"])])),
            vec![FakeDiff { name: "p", src: 90, tgt: 40 }],
            &BTreeMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(ops(&diff), ["resize p 40", "resize_group g 50"]);
    }

    #[test]
    fn full_install_removes_everything_first() {
        let diff = DynamicPartitionsDifference::new(
            &info(&[("g", 100, &["p"])]),
            None,
            vec![FakeDiff { name: "p", src: 0, tgt: 30 }],
            &BTreeMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(
            ops(&diff),
            ["remove_all_groups", "add_group g 100", "add p g", "resize p 30"]
        );
    }

    #[test]
    fn system_only_build() {
        let diff = DynamicPartitionsDifference::new(
            &info(&[("g", 100, &["system"])]),
            Some(&info(&[("g", 100, &["system"])])),
            vec![FakeDiff { name: "system", src: 30, tgt: 40 }],
            &BTreeMap::new(),
            true,
        )
        .unwrap();

        assert_eq!(ops(&diff), ["resize system 40"]);
        assert_eq!(
            diff.op_list().entries[0],
            OpListEntry::Comment("System-only build, keep original vendor partition".into())
        );
    }

    #[test]
    fn unlimited_groups() {
        let diff = DynamicPartitionsDifference::new(
            &info(&[("a", 0, &["p"]), ("b", 50, &["q"])]),
            Some(&info(&[("a", 100, &["p"]), ("b", 0, &["q"])])),
            vec![
                FakeDiff { name: "p", src: 10, tgt: 10 },
                FakeDiff { name: "q", src: 10, tgt: 10 },
            ],
            &BTreeMap::new(),
            false,
        )
        .unwrap();

        assert_eq!(ops(&diff), ["resize_group b 50", "resize_group a 0"]);
    }

    #[test]
    fn reject_invalid_topology() {
        let none = BTreeMap::new();

        assert_matches!(
            DynamicPartitionsDifference::new(
                &info(&[("g", 0, &["p"])]),
                None,
                vec![
                    FakeDiff { name: "p", src: 0, tgt: 1 },
                    FakeDiff { name: "p", src: 0, tgt: 1 },
                ],
                &none,
                false,
            ),
            Err(Error::DuplicateBlockDifference(p)) if p == ["p"]
        );
        assert_matches!(
            DynamicPartitionsDifference::<FakeDiff>::new(
                &info(&[("g", 0, &["p"])]),
                None,
                vec![],
                &none,
                false,
            ),
            Err(Error::MissingBlockDifference { side: "target", .. })
        );
        assert_matches!(
            DynamicPartitionsDifference::new(
                &info(&[("g", 0, &["p"])]),
                None,
                vec![
                    FakeDiff { name: "p", src: 0, tgt: 1 },
                    FakeDiff { name: "q", src: 0, tgt: 1 },
                ],
                &none,
                false,
            ),
            Err(Error::PartitionSetMismatch { side: "target", .. })
        );
        assert_matches!(
            DynamicPartitionsDifference::new(
                &info(&[("default", 0, &["p"])]),
                None,
                vec![FakeDiff { name: "p", src: 0, tgt: 1 }],
                &none,
                false,
            ),
            Err(Error::ReservedGroup(_))
        );
        assert_matches!(
            DynamicPartitionsDifference::new(
                &info(&[("g", 10, &["p"])]),
                None,
                vec![FakeDiff { name: "p", src: 0, tgt: 11 }],
                &none,
                false,
            ),
            Err(Error::GroupOverflow { side: "target", used: 11, .. })
        );
    }

    #[test]
    fn reject_partition_without_group() {
        let mut source = info(&[("g", 100, &["p"])]);
        source.partitions.push("q".to_owned());

        assert_matches!(
            DynamicPartitionsDifference::new(
                &info(&[("g", 100, &["p", "q"])]),
                Some(&source),
                vec![
                    FakeDiff { name: "p", src: 10, tgt: 10 },
                    FakeDiff { name: "q", src: 10, tgt: 10 },
                ],
                &BTreeMap::new(),
                false,
            ),
            Err(Error::Ungrouped { side: "source", partition }) if partition == "q"
        );
    }
}
