// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Storage quota reservation engine.
//!
//! Writers pre-reserve quota through a [`QuotaReservation`], write
//! speculatively while charging growth against their cached quota, and the
//! real on-disk growth is committed to the [`QuotaBackend`] once the last
//! handle on a file goes away.
//!
//! Every object here lives on a single sequence (see
//! [`SequencedTaskRunner`]). Nothing is locked; backend completions are
//! posted back onto the same sequence.

#[macro_use]
extern crate log;

mod backend;
mod backend_impl;
mod buffer;
mod manager;
mod open_file_handle;
mod open_file_handle_context;
mod reservation;
mod sequence;
#[cfg(test)]
mod test_util;

use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use remain::sorted;
use serde::Serialize;
use thiserror::Error;

pub use crate::backend::{QuotaBackend, QuotaGrant, QuotaReservationInfo, ReserveQuotaCallback};
pub use crate::backend_impl::{
    origin_identifier, MemoryQuotaLedger, QuotaLedger, UsageAndQuota, UsageCacheQuotaBackend,
};
pub use crate::buffer::QuotaReservationBuffer;
pub use crate::manager::QuotaReservationManager;
pub use crate::open_file_handle::OpenFileHandle;
pub use crate::open_file_handle_context::OpenFileHandleContext;
pub use crate::reservation::QuotaReservation;
pub use crate::sequence::SequencedTaskRunner;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("The client of the reservation has crashed")]
    Aborted,
    #[error("The reservation manager has been torn down")]
    ManagerGone,
    #[error("A reservation refresh is already running")]
    RefreshInProgress,
    #[error("Failed to get usage and quota")]
    UsageAndQuota(#[source] io::Error),
    #[error("Failed to access the usage cache")]
    UsageCache(#[source] usage_cache::Error),
    #[error("Failed to create usage cache directory {1}")]
    UsageCacheDirectory(#[source] io::Error, PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sub-partition of an origin's quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Temporary,
    Persistent,
    Syncable,
}

impl StorageType {
    /// Directory holding this storage type below the origin directory.
    pub fn directory_name(&self) -> &'static str {
        match self {
            StorageType::Temporary => "t",
            StorageType::Persistent => "p",
            StorageType::Syncable => "s",
        }
    }
}

impl Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageType::Temporary => write!(f, "temporary"),
            StorageType::Persistent => write!(f, "persistent"),
            StorageType::Syncable => write!(f, "syncable"),
        }
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(StorageType::Temporary),
            "persistent" => Ok(StorageType::Persistent),
            "syncable" => Ok(StorageType::Syncable),
            _ => Err(format!("unknown storage type '{s}'")),
        }
    }
}

/// Identifies one quota domain. All reservation state is partitioned by it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuotaKey {
    pub origin: String,
    pub storage_type: StorageType,
}

impl QuotaKey {
    pub fn new(origin: &str, storage_type: StorageType) -> Self {
        QuotaKey {
            origin: origin.to_string(),
            storage_type,
        }
    }
}

impl Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.origin, self.storage_type)
    }
}
