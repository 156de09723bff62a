// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Persistent per-origin usage cache.
//!
//! Every (origin, storage type) directory carries a small `.usage` file
//! recording the last known usage of that directory, whether the recorded
//! value can be trusted, and a dirty count. The dirty count is raised while
//! quota is provisionally reserved against the directory and lowered once
//! the reservation is reconciled. A file left with a non-zero dirty count
//! after a clean shutdown means the recorded usage has to be recounted.
//!
//! The file layout is fixed and little endian:
//!
//! | offset | size | field              |
//! |--------|------|--------------------|
//! | 0      | 4    | magic `FSU5`       |
//! | 4      | 1    | is_valid (0 or 1)  |
//! | 5      | 4    | dirty count (u32)  |
//! | 9      | 8    | usage (i64)        |

#[macro_use]
extern crate log;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use remain::sorted;
use serde::Serialize;
use thiserror::Error;

/// Name of the usage cache file inside an origin/type directory.
pub const USAGE_FILE_NAME: &str = ".usage";
/// Size in bytes of a well formed usage cache file.
pub const USAGE_FILE_SIZE: u64 = 17;

const USAGE_FILE_MAGIC: [u8; 4] = *b"FSU5";
// Open handles kept around between operations.
const MAX_HANDLES_IN_CACHE: usize = 64;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to delete usage cache file {1}")]
    Delete(#[source] io::Error, PathBuf),
    #[error("Dirty count of usage cache file {0} is already zero")]
    DirtyUnderflow(PathBuf),
    #[error("Usage cache file {0} has an invalid header")]
    InvalidHeader(PathBuf),
    #[error("Failed to open usage cache file {1}")]
    Open(#[source] io::Error, PathBuf),
    #[error("Failed to read usage cache file")]
    Read(#[source] io::Error),
    #[error("Failed to write usage cache file")]
    Write(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decoded content of a usage cache file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub is_valid: bool,
    pub dirty: u32,
    pub usage: i64,
}

impl UsageRecord {
    /// Whether the recorded usage can no longer be trusted and the
    /// directory has to be walked again to recompute it.
    pub fn needs_recount(&self) -> bool {
        !self.is_valid || self.dirty > 0
    }

    fn read_from<R: Read>(r: &mut R, path: &Path) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(Error::Read)?;
        if magic != USAGE_FILE_MAGIC {
            return Err(Error::InvalidHeader(path.to_path_buf()));
        }

        let is_valid = match r.read_u8().map_err(Error::Read)? {
            0 => false,
            1 => true,
            _ => return Err(Error::InvalidHeader(path.to_path_buf())),
        };
        let dirty = r.read_u32::<LittleEndian>().map_err(Error::Read)?;
        let usage = r.read_i64::<LittleEndian>().map_err(Error::Read)?;

        Ok(UsageRecord {
            is_valid,
            dirty,
            usage,
        })
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&USAGE_FILE_MAGIC).map_err(Error::Write)?;
        w.write_u8(self.is_valid as u8).map_err(Error::Write)?;
        w.write_u32::<LittleEndian>(self.dirty)
            .map_err(Error::Write)?;
        w.write_i64::<LittleEndian>(self.usage)
            .map_err(Error::Write)?;
        Ok(())
    }
}

/// Reads and updates `.usage` files, keeping recently used files open.
#[derive(Debug, Default)]
pub struct UsageCache {
    cache_files: HashMap<PathBuf, File>,
}

impl UsageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded usage.
    pub fn get_usage(&mut self, path: &Path) -> Result<i64> {
        Ok(self.read_record(path)?.usage)
    }

    /// Returns the recorded dirty count.
    pub fn get_dirty(&mut self, path: &Path) -> Result<u32> {
        Ok(self.read_record(path)?.dirty)
    }

    /// Whether the file exists, is well formed, and is marked valid.
    pub fn is_valid(&mut self, path: &Path) -> bool {
        self.read_record(path)
            .map(|record| record.is_valid)
            .unwrap_or(false)
    }

    pub fn read_record(&mut self, path: &Path) -> Result<UsageRecord> {
        let file = self.get_file(path, false)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::Read)?;
        UsageRecord::read_from(file, path)
    }

    pub fn increment_dirty(&mut self, path: &Path) -> Result<()> {
        let mut record = self.read_record(path)?;
        record.dirty = record.dirty.saturating_add(1);
        self.write_record(path, &record)
    }

    pub fn decrement_dirty(&mut self, path: &Path) -> Result<()> {
        let mut record = self.read_record(path)?;
        if record.dirty == 0 {
            return Err(Error::DirtyUnderflow(path.to_path_buf()));
        }
        record.dirty -= 1;
        self.write_record(path, &record)
    }

    /// Marks the recorded usage as untrustworthy.
    pub fn invalidate(&mut self, path: &Path) -> Result<()> {
        let mut record = self.read_record(path)?;
        record.is_valid = false;
        self.write_record(path, &record)
    }

    /// Overwrites the recorded usage and marks it valid. The dirty count of
    /// an existing file is preserved; a missing file is created.
    pub fn update_usage(&mut self, path: &Path, usage: i64) -> Result<()> {
        let dirty = match self.read_record(path) {
            Ok(record) => record.dirty,
            Err(_) => 0,
        };
        self.write_record(
            path,
            &UsageRecord {
                is_valid: true,
                dirty,
                usage,
            },
        )
    }

    /// Adds `delta` to the recorded usage with a single read-modify-write.
    pub fn atomic_update_usage_by_delta(&mut self, path: &Path, delta: i64) -> Result<()> {
        let mut record = self.read_record(path)?;
        record.usage = record.usage.saturating_add(delta);
        self.write_record(path, &record)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn delete(&mut self, path: &Path) -> Result<()> {
        self.cache_files.remove(path);
        fs::remove_file(path).map_err(|e| Error::Delete(e, path.to_path_buf()))
    }

    /// Drops every cached file handle.
    pub fn close_cache_files(&mut self) {
        if !self.cache_files.is_empty() {
            debug!("Closing {} usage cache files", self.cache_files.len());
        }
        self.cache_files.clear();
    }

    fn write_record(&mut self, path: &Path, record: &UsageRecord) -> Result<()> {
        let file = self.get_file(path, true)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::Write)?;
        record.write_to(file)?;
        file.set_len(USAGE_FILE_SIZE).map_err(Error::Write)
    }

    fn get_file(&mut self, path: &Path, create: bool) -> Result<&mut File> {
        if self.cache_files.len() >= MAX_HANDLES_IN_CACHE && !self.cache_files.contains_key(path)
        {
            self.close_cache_files();
        }

        match self.cache_files.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(create)
                    .truncate(false)
                    .open(path)
                    .map_err(|e| Error::Open(e, path.to_path_buf()))?;
                Ok(entry.insert(file))
            }
        }
    }
}
