// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::rc::{Rc, Weak};

use crate::backend::{QuotaBackend, ReserveQuotaCallback};
use crate::buffer::QuotaReservationBuffer;
use crate::reservation::QuotaReservation;
use crate::{QuotaKey, Result, StorageType};

/// Registry of reservation buffers for one storage partition, and sole owner
/// of the quota backend.
///
/// The manager is created along with its storage partition and dropped with
/// it. Buffers only keep a weak reference back, so anything outliving the
/// manager degrades to a no-op instead of reaching a dead backend.
pub struct QuotaReservationManager {
    inner: Rc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    backend: Box<dyn QuotaBackend>,
    buffers: RefCell<HashMap<QuotaKey, Weak<QuotaReservationBuffer>>>,
}

impl QuotaReservationManager {
    pub fn new(backend: Box<dyn QuotaBackend>) -> Self {
        QuotaReservationManager {
            inner: Rc::new(ManagerInner {
                backend,
                buffers: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Creates a reservation for `origin`/`storage_type`. No quota is
    /// requested until the reservation is refreshed.
    pub fn create_reservation(
        &self,
        origin: &str,
        storage_type: StorageType,
    ) -> Rc<QuotaReservation> {
        self.get_reservation_buffer(&QuotaKey::new(origin, storage_type))
            .create_reservation()
    }

    /// Number of buffers still alive.
    pub fn reservation_buffer_count(&self) -> usize {
        self.inner
            .buffers
            .borrow()
            .values()
            .filter(|buffer| buffer.strong_count() > 0)
            .count()
    }

    fn get_reservation_buffer(&self, key: &QuotaKey) -> Rc<QuotaReservationBuffer> {
        let existing = self.inner.buffers.borrow().get(key).and_then(Weak::upgrade);
        if let Some(buffer) = existing {
            return buffer;
        }

        let buffer = QuotaReservationBuffer::new(Rc::downgrade(&self.inner), key.clone());
        self.inner
            .buffers
            .borrow_mut()
            .insert(key.clone(), Rc::downgrade(&buffer));
        buffer
    }
}

impl ManagerInner {
    pub(crate) fn reserve_quota(&self, key: &QuotaKey, delta: i64, callback: ReserveQuotaCallback) {
        self.backend.reserve_quota(key, delta, callback);
    }

    pub(crate) fn release_reserved_quota(&self, key: &QuotaKey, size: i64) {
        self.backend.release_reserved_quota(key, size);
    }

    pub(crate) fn commit_quota_usage(&self, key: &QuotaKey, delta: i64) -> Result<()> {
        self.backend.commit_quota_usage(key, delta)
    }

    pub(crate) fn increment_dirty_count(&self, key: &QuotaKey) -> Result<()> {
        self.backend.increment_dirty_count(key)
    }

    pub(crate) fn decrement_dirty_count(&self, key: &QuotaKey) -> Result<()> {
        self.backend.decrement_dirty_count(key)
    }

    /// Drops the registry entry of `buffer`, unless a newer buffer already
    /// took over its key.
    pub(crate) fn release_reservation_buffer(&self, buffer: &QuotaReservationBuffer) {
        let mut buffers = self.buffers.borrow_mut();
        let registered = buffers
            .get(buffer.key())
            .is_some_and(|entry| ptr::eq(entry.as_ptr(), buffer));
        if registered {
            buffers.remove(buffer.key());
        }
    }
}
