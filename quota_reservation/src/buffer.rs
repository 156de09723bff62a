// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::{Rc, Weak};

use crate::manager::ManagerInner;
use crate::open_file_handle::OpenFileHandle;
use crate::open_file_handle_context::OpenFileHandleContext;
use crate::reservation::QuotaReservation;
use crate::QuotaKey;

/// Soft quota pool for one (origin, storage type).
///
/// The buffer is kept alive by the reservations and open file contexts of
/// its key. `reserved_quota` holds quota the backend granted that is no
/// longer cached by any reservation and not yet committed as real usage:
/// growth consumed by writers and waiting for its file to close, plus quota
/// handed back by finished or crashed clients.
pub struct QuotaReservationBuffer {
    manager: Weak<ManagerInner>,
    key: QuotaKey,
    reserved_quota: Cell<i64>,
    open_files: RefCell<HashMap<PathBuf, Weak<OpenFileHandleContext>>>,
}

impl QuotaReservationBuffer {
    pub(crate) fn new(manager: Weak<ManagerInner>, key: QuotaKey) -> Rc<Self> {
        if let Some(manager) = manager.upgrade() {
            if let Err(e) = manager.increment_dirty_count(&key) {
                warn!("Failed to increment dirty count for {}: {}", key, e);
            }
        }
        debug!("Created reservation buffer for {}", key);

        Rc::new(QuotaReservationBuffer {
            manager,
            key,
            reserved_quota: Cell::new(0),
            open_files: RefCell::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(key: QuotaKey) -> Self {
        QuotaReservationBuffer {
            manager: Weak::new(),
            key,
            reserved_quota: Cell::new(0),
            open_files: RefCell::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &QuotaKey {
        &self.key
    }

    pub fn reserved_quota(&self) -> i64 {
        self.reserved_quota.get()
    }

    /// Number of paths with a live open file context.
    pub fn open_file_count(&self) -> usize {
        self.open_files
            .borrow()
            .values()
            .filter(|context| context.strong_count() > 0)
            .count()
    }

    pub(crate) fn manager(&self) -> Option<Rc<ManagerInner>> {
        self.manager.upgrade()
    }

    pub(crate) fn create_reservation(self: &Rc<Self>) -> Rc<QuotaReservation> {
        Rc::new(QuotaReservation::new(self.clone()))
    }

    /// Hands out a handle on `platform_path`, sharing the context of any
    /// handle already open on the same path.
    pub(crate) fn get_open_file_handle(
        self: &Rc<Self>,
        reservation: &Rc<QuotaReservation>,
        platform_path: &Path,
    ) -> OpenFileHandle {
        let existing = self
            .open_files
            .borrow()
            .get(platform_path)
            .and_then(Weak::upgrade);

        let context = match existing {
            Some(context) => context,
            None => {
                let context = Rc::new(OpenFileHandleContext::new(platform_path, self.clone()));
                self.open_files
                    .borrow_mut()
                    .insert(platform_path.to_path_buf(), Rc::downgrade(&context));
                context
            }
        };

        OpenFileHandle::new(reservation.clone(), context)
    }

    pub(crate) fn put_reservation_to_buffer(&self, size: i64) {
        debug_assert!(size >= 0, "negative reservation {size} put to buffer");
        if size <= 0 {
            return;
        }
        self.reserved_quota
            .set(self.reserved_quota.get().saturating_add(size));
    }

    /// Charges the backend for `size` bytes a reservation consumed beyond
    /// what it was granted. The growth itself already sits in the pool and
    /// is released on commit like any other consumption.
    pub(crate) fn charge_overrun(&self, size: i64) {
        debug_assert!(size >= 0, "negative overrun {size}");
        if size <= 0 {
            return;
        }
        let Some(manager) = self.manager() else {
            return;
        };
        warn!(
            "Charging {} bytes written beyond the reservation for {}",
            size, self.key
        );
        manager.release_reserved_quota(&self.key, size.saturating_neg());
    }

    /// Commits the real usage change of a closed file and retires the quota
    /// its growth consumed from the soft pool.
    pub(crate) fn commit_file_growth(&self, reserved_quota_consumption: i64, usage_delta: i64) {
        let Some(manager) = self.manager() else {
            return;
        };

        if let Err(e) = manager.commit_quota_usage(&self.key, usage_delta) {
            warn!("Failed to commit usage of {} for {}: {}", usage_delta, self.key, e);
        }

        let mut consumption = reserved_quota_consumption;
        if consumption > self.reserved_quota.get() {
            error!(
                "Detected over consumption of the storage quota beyond its reservation for {}: {} > {}",
                self.key,
                consumption,
                self.reserved_quota.get()
            );
            debug_assert!(
                consumption <= self.reserved_quota.get(),
                "reserved quota would go negative"
            );
            consumption = self.reserved_quota.get();
        }
        if consumption <= 0 {
            return;
        }

        self.reserved_quota.set(self.reserved_quota.get() - consumption);
        manager.release_reserved_quota(&self.key, consumption);
    }

    /// Forgets `context`. An entry already taken over by a newer context for
    /// the same path is left alone.
    pub(crate) fn detach_open_file_handle_context(&self, context: &OpenFileHandleContext) {
        let mut open_files = self.open_files.borrow_mut();
        let registered = open_files
            .get(context.platform_path())
            .is_some_and(|entry| ptr::eq(entry.as_ptr(), context));
        if registered {
            open_files.remove(context.platform_path());
        }
    }
}

impl Drop for QuotaReservationBuffer {
    fn drop(&mut self) {
        let Some(manager) = self.manager() else {
            return;
        };

        debug_assert!(self.reserved_quota.get() >= 0);
        if self.reserved_quota.get() > 0 {
            manager.release_reserved_quota(&self.key, self.reserved_quota.get());
        }
        if let Err(e) = manager.decrement_dirty_count(&self.key) {
            warn!("Failed to decrement dirty count for {}: {}", self.key, e);
        }
        manager.release_reservation_buffer(self);
        debug!("Released reservation buffer for {}", self.key);
    }
}

impl fmt::Debug for QuotaReservationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QuotaReservationBuffer")
            .field("key", &self.key)
            .field("reserved_quota", &self.reserved_quota.get())
            .field("open_files", &self.open_file_count())
            .finish()
    }
}
