// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, BufRead};

use thiserror::Error;

use crate::{
    format::rangeset::{self, RangeSet},
    util::DebugString,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Line {line}: Missing block ranges: {text:?}")]
    MissingRanges { line: usize, text: DebugString },
    #[error("Line {line}: Invalid block ranges")]
    InvalidRanges {
        line: usize,
        #[source]
        source: rangeset::Error,
    },
    #[error("Line {line}: Duplicate entry: {path:?}")]
    DuplicatePath { line: usize, path: String },
    #[error("Failed to read block map")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Mapping from file paths to the blocks holding the file's data, in the order
/// they appear in the map file. Each line has the form
/// `<path> <start>-<end> <block> ...` with inclusive ends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMap {
    pub entries: Vec<(String, RangeSet)>,
}

impl BlockMap {
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut entries: Vec<(String, RangeSet)> = vec![];

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_num = index + 1;
            let trimmed = line.trim_end();

            if trimmed.is_empty() {
                continue;
            }

            let Some((path, ranges)) = trimmed.split_once(char::is_whitespace) else {
                return Err(Error::MissingRanges {
                    line: line_num,
                    text: DebugString::new(trimmed),
                });
            };

            let ranges = ranges
                .parse::<RangeSet>()
                .map_err(|source| Error::InvalidRanges {
                    line: line_num,
                    source,
                })?;

            if entries.iter().any(|(p, _)| p == path) {
                return Err(Error::DuplicatePath {
                    line: line_num,
                    path: path.to_owned(),
                });
            }

            entries.push((path.to_owned(), ranges));
        }

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_map() {
        let data = "/system/build.prop 0-1 5\n\n/system/app/Foo.apk 10-19\n";
        let map = BlockMap::from_reader(data.as_bytes()).unwrap();

        assert_eq!(
            map.entries,
            vec![
                (
                    "/system/build.prop".to_owned(),
                    RangeSet::from_ranges([0..2, 5..6])
                ),
                (
                    "/system/app/Foo.apk".to_owned(),
                    RangeSet::from_range(10..20)
                ),
            ]
        );
    }

    #[test]
    fn reject_malformed() {
        assert_matches!(
            BlockMap::from_reader("/system/foo\n".as_bytes()),
            Err(Error::MissingRanges { line: 1, .. })
        );
        assert_matches!(
            BlockMap::from_reader("/a 1\n/b 2-x\n".as_bytes()),
            Err(Error::InvalidRanges { line: 2, .. })
        );
        assert_matches!(
            BlockMap::from_reader("/a 1\n/a 2\n".as_bytes()),
            Err(Error::DuplicatePath { line: 2, .. })
        );
    }
}
