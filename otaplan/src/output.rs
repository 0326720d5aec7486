// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Destinations for package artifacts. Packaging into an archive is left to
//! the caller; these sinks only collect named blobs.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use cap_std::fs::Dir;
use thiserror::Error;

use crate::util;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid artifact name: {0:?}")]
    InvalidName(String),
    #[error("Failed to create artifact: {0:?}")]
    Create(String, #[source] io::Error),
    #[error("Failed to write artifact: {0:?}")]
    Write(String, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait OutputSink {
    /// Open a new artifact for writing, replacing any existing artifact with
    /// the same name. `stored` indicates that the data is already compressed
    /// and should not be compressed again by an archive writer.
    fn create<'a>(&'a mut self, name: &str, stored: bool) -> Result<Box<dyn Write + 'a>>;

    fn write(&mut self, name: &str, data: &[u8], stored: bool) -> Result<()> {
        let mut writer = self.create(name, stored)?;
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::Write(name.to_owned(), e))
    }

    fn write_file(&mut self, name: &str, path: &Path, stored: bool) -> Result<()> {
        let mut file = File::open(path).map_err(|e| Error::Write(name.to_owned(), e))?;
        let mut writer = self.create(name, stored)?;
        io::copy(&mut file, &mut writer)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Write(name.to_owned(), e))
    }
}

fn check_name(name: &str) -> Result<()> {
    if !util::is_safe_name(name) {
        return Err(Error::InvalidName(name.to_owned()));
    }

    Ok(())
}

/// Writes artifacts as files in a directory.
pub struct DirectoryOutput {
    dir: Dir,
}

impl DirectoryOutput {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }
}

impl OutputSink for DirectoryOutput {
    fn create<'a>(&'a mut self, name: &str, _stored: bool) -> Result<Box<dyn Write + 'a>> {
        check_name(name)?;

        let file = self
            .dir
            .create(name)
            .map_err(|e| Error::Create(name.to_owned(), e))?;

        Ok(Box::new(BufWriter::new(file)))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryEntry {
    pub data: Vec<u8>,
    pub stored: bool,
}

/// Keeps artifacts in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryOutput {
    pub entries: BTreeMap<String, MemoryEntry>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|e| e.data.as_slice())
    }
}

impl OutputSink for MemoryOutput {
    fn create<'a>(&'a mut self, name: &str, stored: bool) -> Result<Box<dyn Write + 'a>> {
        check_name(name)?;

        let entry = self.entries.entry(name.to_owned()).or_default();
        entry.data.clear();
        entry.stored = stored;

        Ok(Box::new(&mut entry.data))
    }
}
