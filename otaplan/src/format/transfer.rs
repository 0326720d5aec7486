// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Model of the block transfer list consumed by the install-time interpreter.
//! Only the stash-free subset of protocol versions 3 and 4 is represented.

use std::{
    fmt,
    io::{self, Write},
    str::FromStr,
};

use thiserror::Error;

use crate::{
    format::rangeset::{self, RangeSet},
    util::DebugString,
};

/// Oldest transfer list version that verifies source blocks before touching
/// the target.
pub const MIN_VERSION: u32 = 3;
/// Newest transfer list version.
pub const MAX_VERSION: u32 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported transfer list version: {0}")]
    UnsupportedVersion(u32),
    #[error("Unknown command: {0:?}")]
    UnknownCommand(DebugString),
    #[error("Missing argument for {0:?} command")]
    MissingArgument(&'static str),
    #[error("Invalid number for {0:?} command: {1:?}")]
    InvalidNumber(&'static str, DebugString),
    #[error("Invalid range set for {0:?} command")]
    InvalidRanges(&'static str, #[source] rangeset::Error),
    #[error("Missing header line: {0}")]
    MissingHeader(&'static str),
    #[error("Failed to write transfer list")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchKind {
    Bsdiff,
    Imgdiff,
}

impl PatchKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Bsdiff => "bsdiff",
            Self::Imgdiff => "imgdiff",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Discard blocks that carry no content in the target.
    Erase(RangeSet),
    /// Fill blocks with zeros.
    Zero(RangeSet),
    /// Write the next blocks from the new-data stream.
    New(RangeSet),
    /// Copy source blocks to the target blocks unchanged.
    Move {
        src_hash: String,
        tgt: RangeSet,
        src: RangeSet,
    },
    /// Apply a patch from the patch stream to the source blocks.
    Diff {
        kind: PatchKind,
        patch_offset: u64,
        patch_len: u64,
        src_hash: String,
        tgt_hash: String,
        tgt: RangeSet,
        src: RangeSet,
    },
}

impl Command {
    /// Blocks written by this command. Erased blocks are not counted as
    /// written.
    pub fn target_ranges(&self) -> Option<&RangeSet> {
        match self {
            Self::Erase(_) => None,
            Self::Zero(r) | Self::New(r) => Some(r),
            Self::Move { tgt, .. } | Self::Diff { tgt, .. } => Some(tgt),
        }
    }

    /// Blocks read from the source image by this command.
    pub fn source_ranges(&self) -> Option<&RangeSet> {
        match self {
            Self::Move { src, .. } | Self::Diff { src, .. } => Some(src),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase(r) => write!(f, "erase {}", r.to_string_raw()),
            Self::Zero(r) => write!(f, "zero {}", r.to_string_raw()),
            Self::New(r) => write!(f, "new {}", r.to_string_raw()),
            Self::Move { src_hash, tgt, src } => write!(
                f,
                "move {src_hash} {} {} {}",
                tgt.to_string_raw(),
                src.size(),
                src.to_string_raw(),
            ),
            Self::Diff {
                kind,
                patch_offset,
                patch_len,
                src_hash,
                tgt_hash,
                tgt,
                src,
            } => write!(
                f,
                "{} {patch_offset} {patch_len} {src_hash} {tgt_hash} {} {} {}",
                kind.name(),
                tgt.to_string_raw(),
                src.size(),
                src.to_string_raw(),
            ),
        }
    }
}

fn next_arg<'a>(args: &mut impl Iterator<Item = &'a str>, cmd: &'static str) -> Result<&'a str> {
    args.next().ok_or(Error::MissingArgument(cmd))
}

fn next_ranges<'a>(
    args: &mut impl Iterator<Item = &'a str>,
    cmd: &'static str,
) -> Result<RangeSet> {
    RangeSet::parse_raw(next_arg(args, cmd)?).map_err(|e| Error::InvalidRanges(cmd, e))
}

fn next_u64<'a>(args: &mut impl Iterator<Item = &'a str>, cmd: &'static str) -> Result<u64> {
    let arg = next_arg(args, cmd)?;
    arg.parse()
        .map_err(|_| Error::InvalidNumber(cmd, DebugString::new(arg)))
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut args = s.split_whitespace();

        match args.next() {
            Some("erase") => Ok(Self::Erase(next_ranges(&mut args, "erase")?)),
            Some("zero") => Ok(Self::Zero(next_ranges(&mut args, "zero")?)),
            Some("new") => Ok(Self::New(next_ranges(&mut args, "new")?)),
            Some("move") => {
                let src_hash = next_arg(&mut args, "move")?.to_owned();
                let tgt = next_ranges(&mut args, "move")?;
                next_u64(&mut args, "move")?;
                let src = next_ranges(&mut args, "move")?;

                Ok(Self::Move { src_hash, tgt, src })
            }
            Some(name @ ("bsdiff" | "imgdiff")) => {
                let (kind, cmd) = if name == "bsdiff" {
                    (PatchKind::Bsdiff, "bsdiff")
                } else {
                    (PatchKind::Imgdiff, "imgdiff")
                };

                let patch_offset = next_u64(&mut args, cmd)?;
                let patch_len = next_u64(&mut args, cmd)?;
                let src_hash = next_arg(&mut args, cmd)?.to_owned();
                let tgt_hash = next_arg(&mut args, cmd)?.to_owned();
                let tgt = next_ranges(&mut args, cmd)?;
                next_u64(&mut args, cmd)?;
                let src = next_ranges(&mut args, cmd)?;

                Ok(Self::Diff {
                    kind,
                    patch_offset,
                    patch_len,
                    src_hash,
                    tgt_hash,
                    tgt,
                    src,
                })
            }
            _ => Err(Error::UnknownCommand(DebugString::new(s))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferList {
    pub version: u32,
    /// Maximum number of stash entries alive at once.
    pub max_stash_entries: u64,
    /// Maximum number of blocks stashed at once.
    pub max_stashed_blocks: u64,
    pub commands: Vec<Command>,
}

impl TransferList {
    pub fn new(version: u32) -> Result<Self> {
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            max_stash_entries: 0,
            max_stashed_blocks: 0,
            commands: vec![],
        })
    }

    /// Total number of blocks written by all commands.
    pub fn total_blocks_written(&self) -> u64 {
        self.commands
            .iter()
            .filter_map(|c| c.target_ranges())
            .map(|r| r.size())
            .sum()
    }

    pub fn to_writer(&self, mut writer: impl Write) -> Result<()> {
        writeln!(writer, "{}", self.version)?;
        writeln!(writer, "{}", self.total_blocks_written())?;
        writeln!(writer, "{}", self.max_stash_entries)?;
        writeln!(writer, "{}", self.max_stashed_blocks)?;

        for command in &self.commands {
            writeln!(writer, "{command}")?;
        }

        Ok(())
    }
}

impl FromStr for TransferList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut lines = s.lines();

        let mut header = |name: &'static str| -> Result<u64> {
            let line = lines.next().ok_or(Error::MissingHeader(name))?;
            line.trim()
                .parse()
                .map_err(|_| Error::InvalidNumber(name, DebugString::new(line)))
        };

        let version = header("version")?;
        let version = u32::try_from(version).map_err(|_| Error::UnsupportedVersion(u32::MAX))?;
        let mut list = Self::new(version)?;
        header("total_blocks")?;
        list.max_stash_entries = header("max_stash_entries")?;
        list.max_stashed_blocks = header("max_stashed_blocks")?;

        for line in lines {
            if !line.trim().is_empty() {
                list.commands.push(line.parse()?);
            }
        }

        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn serialize_list() {
        let mut list = TransferList::new(4).unwrap();
        list.commands.push(Command::New(RangeSet::from_range(0..10)));
        list.commands.push(Command::Move {
            src_hash: "aa".into(),
            tgt: RangeSet::from_range(10..12),
            src: RangeSet::from_range(20..22),
        });
        list.commands.push(Command::Diff {
            kind: PatchKind::Imgdiff,
            patch_offset: 0,
            patch_len: 100,
            src_hash: "bb".into(),
            tgt_hash: "cc".into(),
            tgt: RangeSet::from_range(12..13),
            src: RangeSet::from_ranges([30..31, 40..42]),
        });
        list.commands.push(Command::Erase(RangeSet::from_range(50..60)));

        let mut buf = vec![];
        list.to_writer(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert_eq!(
            text,
            "4\n13\n0\n0\n\
             new 2,0,10\n\
             move aa 2,10,12 2 2,20,22\n\
             imgdiff 0 100 bb cc 2,12,13 3 4,30,31,40,42\n\
             erase 2,50,60\n"
        );
        assert_eq!(text.parse::<TransferList>().unwrap(), list);
    }

    #[test]
    fn reject_invalid() {
        assert_matches!(TransferList::new(2), Err(Error::UnsupportedVersion(2)));
        assert_matches!("stash 1 2,0,1".parse::<Command>(), Err(Error::UnknownCommand(_)));
        assert_matches!("new".parse::<Command>(), Err(Error::MissingArgument("new")));
        assert_matches!(
            "4\n0\n".parse::<TransferList>(),
            Err(Error::MissingHeader("max_stash_entries"))
        );
    }
}
