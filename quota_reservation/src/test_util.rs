// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::{Cell, RefCell};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::backend::{QuotaBackend, QuotaGrant, ReserveQuotaCallback};
use crate::open_file_handle::OpenFileHandle;
use crate::reservation::QuotaReservation;
use crate::sequence::SequencedTaskRunner;
use crate::{Error, QuotaKey, QuotaReservationManager, Result};

pub(crate) const ORIGIN: &str = "http://example.com";

/// Counters observed by tests. `on_memory_usage` follows every reservation
/// and commit, `on_disk_usage` only commits.
#[derive(Default)]
pub(crate) struct FakeBackendState {
    pub on_memory_usage: Cell<i64>,
    pub on_disk_usage: Cell<i64>,
    pub dirty_count: Cell<i64>,
    pub reserve_calls: Cell<usize>,
    pub quota_limit: Cell<Option<i64>>,
    pub fail_reserve: Cell<bool>,
}

pub(crate) struct FakeBackend {
    runner: SequencedTaskRunner,
    state: Rc<FakeBackendState>,
}

impl QuotaBackend for FakeBackend {
    fn reserve_quota(&self, _key: &QuotaKey, delta: i64, callback: ReserveQuotaCallback) {
        self.state.reserve_calls.set(self.state.reserve_calls.get() + 1);

        if self.state.fail_reserve.get() {
            self.runner.post_task(move || {
                callback(Err(Error::UsageAndQuota(io::Error::other(
                    "injected failure",
                ))))
            });
            return;
        }

        let granted = match self.state.quota_limit.get() {
            Some(limit) if delta > 0 => delta
                .min(limit - self.state.on_memory_usage.get())
                .max(0),
            _ => delta,
        };
        self.state
            .on_memory_usage
            .set(self.state.on_memory_usage.get() + granted);

        let state = self.state.clone();
        self.runner.post_task(move || {
            callback(Ok(QuotaGrant::new(granted, move |delta| {
                state
                    .on_memory_usage
                    .set(state.on_memory_usage.get() - delta)
            })))
        });
    }

    fn release_reserved_quota(&self, _key: &QuotaKey, size: i64) {
        self.state
            .on_memory_usage
            .set(self.state.on_memory_usage.get() - size);
    }

    fn commit_quota_usage(&self, _key: &QuotaKey, delta: i64) -> Result<()> {
        self.state
            .on_disk_usage
            .set(self.state.on_disk_usage.get() + delta);
        self.state
            .on_memory_usage
            .set(self.state.on_memory_usage.get() + delta);
        Ok(())
    }

    fn increment_dirty_count(&self, _key: &QuotaKey) -> Result<()> {
        self.state.dirty_count.set(self.state.dirty_count.get() + 1);
        Ok(())
    }

    fn decrement_dirty_count(&self, _key: &QuotaKey) -> Result<()> {
        self.state.dirty_count.set(self.state.dirty_count.get() - 1);
        Ok(())
    }
}

/// Builds a manager over a fake backend whose usage starts at
/// `initial_usage`.
pub(crate) fn setup(
    initial_usage: i64,
) -> (
    SequencedTaskRunner,
    Rc<FakeBackendState>,
    QuotaReservationManager,
) {
    let runner = SequencedTaskRunner::new();
    let state = Rc::new(FakeBackendState::default());
    state.on_memory_usage.set(initial_usage);
    state.on_disk_usage.set(initial_usage);

    let manager = QuotaReservationManager::new(Box::new(FakeBackend {
        runner: runner.clone(),
        state: state.clone(),
    }));
    (runner, state, manager)
}

/// Refreshes `reservation` and runs the sequence until the refresh is done.
pub(crate) fn refresh_reservation(
    runner: &SequencedTaskRunner,
    reservation: &Rc<QuotaReservation>,
    size: i64,
) -> Result<()> {
    let outcome = Rc::new(RefCell::new(None));
    let o = outcome.clone();
    reservation.refresh_reservation(size, move |result| *o.borrow_mut() = Some(result))?;
    runner.run_until_idle();
    let result = outcome.borrow_mut().take();
    result.expect("refresh did not complete")
}

pub(crate) fn set_file_size(path: &Path, size: i64) {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap()
        .set_len(size as u64)
        .unwrap();
}

pub(crate) fn file_size(path: &Path) -> i64 {
    fs::metadata(path).unwrap().len() as i64
}

/// Mimics a plugin writer: it changes the file directly and only tells the
/// handle about it when asked to report.
pub(crate) struct FakeWriter {
    handle: Option<OpenFileHandle>,
    path: PathBuf,
    max_written_offset: i64,
    append_mode_write_amount: i64,
    dirty: bool,
}

impl FakeWriter {
    pub(crate) fn new(handle: OpenFileHandle, path: &Path) -> Self {
        let max_written_offset = handle.estimated_file_size();
        FakeWriter {
            handle: Some(handle),
            path: path.to_path_buf(),
            max_written_offset,
            append_mode_write_amount: 0,
            dirty: false,
        }
    }

    /// Positional write ending at `max_written_offset`. Returns the growth
    /// the writer expects to be charged.
    pub(crate) fn write(&mut self, max_written_offset: i64) -> i64 {
        self.dirty = true;
        let mut consumed = 0;
        if max_written_offset > self.max_written_offset {
            consumed = max_written_offset - self.max_written_offset;
            self.max_written_offset = max_written_offset;
        }
        if file_size(&self.path) < max_written_offset {
            set_file_size(&self.path, max_written_offset);
        }
        consumed
    }

    pub(crate) fn append(&mut self, amount: i64) -> i64 {
        self.dirty = true;
        self.append_mode_write_amount += amount;
        let size = file_size(&self.path);
        set_file_size(&self.path, size + amount);
        amount
    }

    pub(crate) fn truncate(&mut self, length: i64) -> i64 {
        let mut consumed = 0;
        if self.max_written_offset < length {
            consumed = length - self.max_written_offset;
            self.max_written_offset = length;
        }
        set_file_size(&self.path, length);
        consumed
    }

    pub(crate) fn report_usage(&mut self) {
        if !self.dirty {
            return;
        }
        let handle = self.handle.as_ref().unwrap();
        handle.update_max_written_offset(self.max_written_offset);
        handle.add_append_mode_write_amount(self.append_mode_write_amount);
        self.max_written_offset = handle.max_written_offset();
        self.append_mode_write_amount = 0;
        self.dirty = false;
    }

    /// Closes the file the way a crashed client does: unreported writes
    /// stay unreported.
    pub(crate) fn clear_without_usage_report(&mut self) {
        self.handle = None;
    }
}

impl Drop for FakeWriter {
    fn drop(&mut self) {
        if self.handle.is_some() && !std::thread::panicking() {
            assert!(!self.dirty, "writer closed with unreported writes");
        }
    }
}
