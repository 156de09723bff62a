// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use serde::Serialize;
use usage_cache::{UsageCache, USAGE_FILE_NAME};

use crate::backend::{QuotaBackend, QuotaGrant, QuotaReservationInfo, ReserveQuotaCallback};
use crate::sequence::SequencedTaskRunner;
use crate::{Error, QuotaKey, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageAndQuota {
    pub usage: i64,
    pub quota: i64,
}

/// Origin level quota authority: knows how much each quota domain uses and
/// may use, and is told about every change.
pub trait QuotaLedger {
    fn get_usage_and_quota(&self, key: &QuotaKey) -> io::Result<UsageAndQuota>;

    fn notify_storage_modified(&self, key: &QuotaKey, delta: i64);
}

/// Ledger kept in memory, with one quota shared by every key unless
/// overridden.
#[derive(Debug)]
pub struct MemoryQuotaLedger {
    default_quota: i64,
    quotas: RefCell<HashMap<QuotaKey, i64>>,
    usages: RefCell<HashMap<QuotaKey, i64>>,
}

impl MemoryQuotaLedger {
    pub fn new(default_quota: i64) -> Self {
        MemoryQuotaLedger {
            default_quota,
            quotas: RefCell::new(HashMap::new()),
            usages: RefCell::new(HashMap::new()),
        }
    }

    pub fn set_quota(&self, key: &QuotaKey, quota: i64) {
        self.quotas.borrow_mut().insert(key.clone(), quota);
    }

    pub fn set_usage(&self, key: &QuotaKey, usage: i64) {
        self.usages.borrow_mut().insert(key.clone(), usage);
    }

    pub fn usage(&self, key: &QuotaKey) -> i64 {
        self.usages.borrow().get(key).copied().unwrap_or(0)
    }
}

impl QuotaLedger for MemoryQuotaLedger {
    fn get_usage_and_quota(&self, key: &QuotaKey) -> io::Result<UsageAndQuota> {
        Ok(UsageAndQuota {
            usage: self.usage(key),
            quota: self
                .quotas
                .borrow()
                .get(key)
                .copied()
                .unwrap_or(self.default_quota),
        })
    }

    fn notify_storage_modified(&self, key: &QuotaKey, delta: i64) {
        let mut usages = self.usages.borrow_mut();
        let usage = usages.entry(key.clone()).or_insert(0);
        *usage = usage.saturating_add(delta);
    }
}

/// Directory name standing for `origin`: `scheme_host_port`, port `0` when
/// the origin has none.
pub fn origin_identifier(origin: &str) -> String {
    let (scheme, rest) = origin.split_once("://").unwrap_or(("", origin));
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host, port)
        }
        _ => (rest, "0"),
    };

    format!("{scheme}_{host}_{port}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Backend reconciling reservations with a [`QuotaLedger`] and persisting
/// committed usage and dirty counts in per-directory usage cache files.
pub struct UsageCacheQuotaBackend {
    inner: Rc<BackendInner>,
}

struct BackendInner {
    runner: SequencedTaskRunner,
    data_dir: PathBuf,
    ledger: Rc<dyn QuotaLedger>,
    usage_cache: RefCell<UsageCache>,
}

impl UsageCacheQuotaBackend {
    pub fn new(runner: SequencedTaskRunner, data_dir: &Path, ledger: Rc<dyn QuotaLedger>) -> Self {
        UsageCacheQuotaBackend {
            inner: Rc::new(BackendInner {
                runner,
                data_dir: data_dir.to_path_buf(),
                ledger,
                usage_cache: RefCell::new(UsageCache::new()),
            }),
        }
    }

    /// Directory holding the files of `key` below `data_dir`.
    pub fn directory_for(data_dir: &Path, key: &QuotaKey) -> PathBuf {
        data_dir
            .join(origin_identifier(&key.origin))
            .join(key.storage_type.directory_name())
    }

    pub fn usage_cache_path(data_dir: &Path, key: &QuotaKey) -> PathBuf {
        Self::directory_for(data_dir, key).join(USAGE_FILE_NAME)
    }
}

impl BackendInner {
    fn reserve(self: &Rc<Self>, info: QuotaReservationInfo) -> Result<QuotaGrant> {
        if info.delta == 0 {
            return Ok(QuotaGrant::settled(0));
        }

        let mut normalized = info.clone();
        if info.delta > 0 {
            let UsageAndQuota { usage, quota } = self
                .ledger
                .get_usage_and_quota(&info.key)
                .map_err(Error::UsageAndQuota)?;
            let new_usage = usage.saturating_add(info.delta).min(quota);
            normalized.delta = (new_usage - usage).max(0);
            if normalized.delta < info.delta {
                debug!(
                    "Clamped reservation for {} from {} to {} (usage {}, quota {})",
                    info.key, info.delta, normalized.delta, usage, quota
                );
            }
        }

        self.reserve_internal(&normalized);

        let inner = Rc::downgrade(self);
        let key = normalized.key.clone();
        Ok(QuotaGrant::new(normalized.delta, move |delta| {
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.reserve_internal(&QuotaReservationInfo::new(&key, -delta));
            }
        }))
    }

    fn reserve_internal(&self, info: &QuotaReservationInfo) {
        self.ledger.notify_storage_modified(&info.key, info.delta);
    }

    // Makes sure the usage cache of `key` exists and returns its path.
    fn prepare_usage_cache(&self, key: &QuotaKey) -> Result<PathBuf> {
        let directory = UsageCacheQuotaBackend::directory_for(&self.data_dir, key);
        fs::create_dir_all(&directory)
            .map_err(|e| Error::UsageCacheDirectory(e, directory.clone()))?;

        let path = directory.join(USAGE_FILE_NAME);
        let mut usage_cache = self.usage_cache.borrow_mut();
        if !usage_cache.exists(&path) {
            info!("Creating usage cache {}", path.display());
            usage_cache.update_usage(&path, 0).map_err(Error::UsageCache)?;
        }
        Ok(path)
    }
}

impl QuotaBackend for UsageCacheQuotaBackend {
    fn reserve_quota(&self, key: &QuotaKey, delta: i64, callback: ReserveQuotaCallback) {
        let inner = Rc::downgrade(&self.inner);
        let info = QuotaReservationInfo::new(key, delta);
        self.inner.runner.post_task(move || match inner.upgrade() {
            Some(inner) => callback(inner.reserve(info)),
            None => callback(Err(Error::ManagerGone)),
        });
    }

    fn release_reserved_quota(&self, key: &QuotaKey, size: i64) {
        if size == 0 {
            return;
        }
        self.inner
            .reserve_internal(&QuotaReservationInfo::new(key, size.saturating_neg()));
    }

    fn commit_quota_usage(&self, key: &QuotaKey, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.inner
            .reserve_internal(&QuotaReservationInfo::new(key, delta));

        let path = self.inner.prepare_usage_cache(key)?;
        self.inner
            .usage_cache
            .borrow_mut()
            .atomic_update_usage_by_delta(&path, delta)
            .map_err(Error::UsageCache)
    }

    fn increment_dirty_count(&self, key: &QuotaKey) -> Result<()> {
        let path = self.inner.prepare_usage_cache(key)?;
        self.inner
            .usage_cache
            .borrow_mut()
            .increment_dirty(&path)
            .map_err(Error::UsageCache)
    }

    fn decrement_dirty_count(&self, key: &QuotaKey) -> Result<()> {
        let path = self.inner.prepare_usage_cache(key)?;
        self.inner
            .usage_cache
            .borrow_mut()
            .decrement_dirty(&path)
            .map_err(Error::UsageCache)
    }
}
