// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::Cell;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::buffer::QuotaReservationBuffer;

fn file_size(path: &Path) -> i64 {
    match fs::metadata(path) {
        Ok(metadata) => metadata.len() as i64,
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => {
            warn!("Failed to get size of {}: {}", path.display(), e);
            0
        }
    }
}

/// Growth bookkeeping for one physical file, shared by every open handle on
/// that path within a buffer.
///
/// When the last handle goes away the context compares the file's real size
/// with the size it started from and commits the difference.
pub struct OpenFileHandleContext {
    platform_path: PathBuf,
    buffer: Rc<QuotaReservationBuffer>,
    initial_file_size: i64,
    maximum_written_offset: Cell<i64>,
    append_mode_write_amount: Cell<i64>,
}

impl OpenFileHandleContext {
    pub(crate) fn new(platform_path: &Path, buffer: Rc<QuotaReservationBuffer>) -> Self {
        let initial_file_size = file_size(platform_path);
        OpenFileHandleContext {
            platform_path: platform_path.to_path_buf(),
            buffer,
            initial_file_size,
            maximum_written_offset: Cell::new(initial_file_size),
            append_mode_write_amount: Cell::new(0),
        }
    }

    pub fn platform_path(&self) -> &Path {
        &self.platform_path
    }

    pub fn initial_file_size(&self) -> i64 {
        self.initial_file_size
    }

    /// Raises the high-water mark of positional writes to `offset` and
    /// returns by how much it grew.
    pub fn update_max_written_offset(&self, offset: i64) -> i64 {
        let maximum = self.maximum_written_offset.get();
        if offset <= maximum {
            return 0;
        }
        self.maximum_written_offset.set(offset);
        offset - maximum
    }

    pub fn add_append_mode_write_amount(&self, amount: i64) {
        debug_assert!(amount >= 0, "negative append amount {amount}");
        self.append_mode_write_amount
            .set(self.append_mode_write_amount.get().saturating_add(amount.max(0)));
    }

    pub fn max_written_offset(&self) -> i64 {
        self.maximum_written_offset.get()
    }

    pub fn append_mode_write_amount(&self) -> i64 {
        self.append_mode_write_amount.get()
    }

    /// Upper bound of the file size given every write reported so far.
    pub fn estimated_file_size(&self) -> i64 {
        self.maximum_written_offset
            .get()
            .saturating_add(self.append_mode_write_amount.get())
    }
}

impl Drop for OpenFileHandleContext {
    fn drop(&mut self) {
        let file_size = file_size(&self.platform_path);
        let usage_delta = file_size - self.initial_file_size;

        // A crashed client may have written more than it reported. The real
        // size then wins, so the unreported growth is still charged.
        let reserved_quota_consumption =
            self.estimated_file_size().max(file_size) - self.initial_file_size;

        debug!(
            "Closing {}: usage delta {}, consumed {}",
            self.platform_path.display(),
            usage_delta,
            reserved_quota_consumption
        );
        self.buffer
            .commit_file_growth(reserved_quota_consumption, usage_delta);
        self.buffer.detach_open_file_handle_context(self);
    }
}

impl fmt::Debug for OpenFileHandleContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OpenFileHandleContext")
            .field("platform_path", &self.platform_path)
            .field("initial_file_size", &self.initial_file_size)
            .field("maximum_written_offset", &self.maximum_written_offset.get())
            .field("append_mode_write_amount", &self.append_mode_write_amount.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use crate::{QuotaKey, StorageType};
    use vmm_sys_util::tempdir::TempDir;
    use vmm_sys_util::tempfile::TempFile;

    fn detached_buffer() -> Rc<QuotaReservationBuffer> {
        Rc::new(QuotaReservationBuffer::detached(QuotaKey::new(
            ORIGIN,
            StorageType::Temporary,
        )))
    }

    #[test]
    fn test_initial_size_is_read_from_disk() {
        let file = TempFile::new().unwrap();
        set_file_size(file.as_path(), 9);

        let context = OpenFileHandleContext::new(file.as_path(), detached_buffer());
        assert_eq!(context.initial_file_size(), 9);
        assert_eq!(context.max_written_offset(), 9);
        assert_eq!(context.estimated_file_size(), 9);
    }

    #[test]
    fn test_missing_file_counts_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("missing");

        let context = OpenFileHandleContext::new(&path, detached_buffer());
        assert_eq!(context.initial_file_size(), 0);
        assert_eq!(context.estimated_file_size(), 0);
    }

    #[test]
    fn test_max_written_offset_is_monotonic() {
        let file = TempFile::new().unwrap();
        let context = OpenFileHandleContext::new(file.as_path(), detached_buffer());

        let offsets = [5, 3, 5, 12, 0, 11, 12, 20, 19];
        let mut high_water = 0;
        let mut total_growth = 0;
        for offset in offsets {
            let growth = context.update_max_written_offset(offset);
            assert!(growth >= 0);
            total_growth += growth;
            assert!(context.max_written_offset() >= high_water);
            high_water = context.max_written_offset();
        }
        assert_eq!(high_water, 20);
        assert_eq!(total_growth, 20);
    }

    #[test]
    fn test_estimated_size_adds_appends() {
        let file = TempFile::new().unwrap();
        set_file_size(file.as_path(), 2);
        let context = OpenFileHandleContext::new(file.as_path(), detached_buffer());

        assert_eq!(context.update_max_written_offset(10), 8);
        context.add_append_mode_write_amount(5);
        context.add_append_mode_write_amount(0);
        context.add_append_mode_write_amount(1);
        assert_eq!(context.append_mode_write_amount(), 6);
        assert_eq!(context.estimated_file_size(), 16);
        // Appends do not move the positional high-water mark.
        assert_eq!(context.update_max_written_offset(10), 0);
    }

    #[test]
    fn test_estimated_size_saturates() {
        let file = TempFile::new().unwrap();
        let context = OpenFileHandleContext::new(file.as_path(), detached_buffer());

        assert_eq!(context.update_max_written_offset(i64::MAX), i64::MAX);
        context.add_append_mode_write_amount(i64::MAX);
        context.add_append_mode_write_amount(1);
        assert_eq!(context.append_mode_write_amount(), i64::MAX);
        assert_eq!(context.estimated_file_size(), i64::MAX);
    }

    #[test]
    fn test_unreported_growth_is_charged_on_close() {
        let file = TempFile::new().unwrap();
        let path = file.as_path().to_path_buf();
        set_file_size(&path, 4);
        let (runner, backend, manager) = setup(4);

        let reservation = manager.create_reservation(ORIGIN, StorageType::Temporary);
        refresh_reservation(&runner, &reservation, 30).unwrap();
        let handle = reservation.get_open_file_handle(&path);
        handle.update_max_written_offset(6);

        // 20 bytes land on disk but only 2 were reported.
        set_file_size(&path, 24);
        reservation.on_client_crash();
        assert_eq!(reservation.buffer().reserved_quota(), 30);
        drop(handle);

        assert_eq!(backend.on_disk_usage.get(), 24);
        assert_eq!(reservation.buffer().reserved_quota(), 10);
        assert_eq!(backend.on_memory_usage.get(), 4 + 30);
    }

    #[test]
    fn test_truncated_file_commits_negative_usage() {
        let file = TempFile::new().unwrap();
        let path = file.as_path().to_path_buf();
        set_file_size(&path, 50);
        let (_runner, backend, manager) = setup(50);

        let reservation = manager.create_reservation(ORIGIN, StorageType::Temporary);
        let handle = reservation.get_open_file_handle(&path);
        set_file_size(&path, 20);
        drop(handle);

        assert_eq!(backend.on_disk_usage.get(), 20);
        assert_eq!(backend.on_memory_usage.get(), 20);
        assert_eq!(reservation.buffer().reserved_quota(), 0);
    }
}
