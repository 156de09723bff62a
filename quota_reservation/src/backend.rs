// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use crate::{QuotaKey, Result};

/// Completion of [`QuotaBackend::reserve_quota`].
pub type ReserveQuotaCallback = Box<dyn FnOnce(Result<QuotaGrant>)>;

/// A single signed quota adjustment request against one quota domain.
/// A positive delta asks for more quota, a negative one gives some back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaReservationInfo {
    pub key: QuotaKey,
    pub delta: i64,
}

impl QuotaReservationInfo {
    pub fn new(key: &QuotaKey, delta: i64) -> Self {
        QuotaReservationInfo {
            key: key.clone(),
            delta,
        }
    }

    /// The adjustment undoing this one.
    pub fn inverse(&self) -> Self {
        QuotaReservationInfo {
            key: self.key.clone(),
            delta: -self.delta,
        }
    }
}

/// Quota offered by the backend in answer to a reservation request.
///
/// The backend has already charged `delta` when the offer reaches the
/// requester. The requester keeps it with [`QuotaGrant::accept`]; rejecting
/// the offer, or dropping it without accepting, hands `delta` to the revert
/// action supplied by the backend so the charge is undone.
pub struct QuotaGrant {
    delta: i64,
    revert: Option<Box<dyn FnOnce(i64)>>,
}

impl QuotaGrant {
    pub fn new<F>(delta: i64, revert: F) -> Self
    where
        F: FnOnce(i64) + 'static,
    {
        QuotaGrant {
            delta,
            revert: Some(Box::new(revert)),
        }
    }

    /// An offer with nothing to undo.
    pub fn settled(delta: i64) -> Self {
        QuotaGrant {
            delta,
            revert: None,
        }
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    pub fn accept(mut self) -> i64 {
        self.revert = None;
        self.delta
    }

    pub fn reject(self) {}
}

impl Drop for QuotaGrant {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            debug!("Reverting unaccepted quota grant of {}", self.delta);
            revert(self.delta);
        }
    }
}

impl fmt::Debug for QuotaGrant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QuotaGrant")
            .field("delta", &self.delta)
            .field("pending_revert", &self.revert.is_some())
            .finish()
    }
}

/// Authoritative quota bookkeeping the reservation engine reconciles with.
///
/// Only the [`QuotaReservationManager`](crate::QuotaReservationManager)
/// holds a backend; buffers and reservations reach it through the manager.
pub trait QuotaBackend {
    /// Asks for `delta` more quota (or gives `-delta` back). The callback
    /// runs later on the same sequence. A positive request may be granted
    /// only partially when the quota ceiling is near; running out of quota
    /// is a zero grant, not an error.
    fn reserve_quota(&self, key: &QuotaKey, delta: i64, callback: ReserveQuotaCallback);

    /// Returns `size` bytes of reserved but unused quota. A negative `size`
    /// charges quota that writers consumed beyond their last grant.
    fn release_reserved_quota(&self, key: &QuotaKey, size: i64);

    /// Records a real usage change and persists it.
    fn commit_quota_usage(&self, key: &QuotaKey, delta: i64) -> Result<()>;

    fn increment_dirty_count(&self, key: &QuotaKey) -> Result<()>;

    fn decrement_dirty_count(&self, key: &QuotaKey) -> Result<()>;
}
