// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::Cell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use crate::backend::QuotaGrant;
use crate::buffer::QuotaReservationBuffer;
use crate::open_file_handle::OpenFileHandle;
use crate::{Error, QuotaKey, Result};

/// Quota cache held by one writer.
///
/// Writes are charged against `remaining_quota` without talking to the
/// backend. The writer refreshes the cache when it runs low. Whatever is
/// left when the reservation goes away flows back into its buffer.
pub struct QuotaReservation {
    buffer: Rc<QuotaReservationBuffer>,
    remaining_quota: Cell<i64>,
    client_crashed: Cell<bool>,
    running_refresh_request: Cell<bool>,
}

impl QuotaReservation {
    pub(crate) fn new(buffer: Rc<QuotaReservationBuffer>) -> Self {
        QuotaReservation {
            buffer,
            remaining_quota: Cell::new(0),
            client_crashed: Cell::new(false),
            running_refresh_request: Cell::new(false),
        }
    }

    pub fn key(&self) -> &QuotaKey {
        self.buffer.key()
    }

    pub fn buffer(&self) -> &Rc<QuotaReservationBuffer> {
        &self.buffer
    }

    pub fn remaining_quota(&self) -> i64 {
        self.remaining_quota.get()
    }

    pub fn is_refreshing(&self) -> bool {
        self.running_refresh_request.get()
    }

    pub fn client_crashed(&self) -> bool {
        self.client_crashed.get()
    }

    /// Brings the cached quota to `size` bytes.
    ///
    /// The backend is asked for the difference between `size` and the
    /// current cache. When the offer arrives the granted amount is added to
    /// whatever the cache holds at that point, so the cache never ends above
    /// `size`; it ends below when the backend grants less or when writes
    /// consumed part of the cache meanwhile. `callback` receives the outcome.
    ///
    /// Fails immediately, without calling `callback` and without reaching the
    /// backend, when a refresh is already running, when the client crashed,
    /// or when the manager is gone.
    pub fn refresh_reservation<F>(self: &Rc<Self>, size: i64, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        if self.running_refresh_request.get() {
            return Err(Error::RefreshInProgress);
        }
        if self.client_crashed.get() {
            return Err(Error::Aborted);
        }
        let manager = self.buffer.manager().ok_or(Error::ManagerGone)?;

        let delta = size.saturating_sub(self.remaining_quota.get());
        debug!(
            "Refreshing reservation for {} to {} (delta {})",
            self.key(),
            size,
            delta
        );

        self.running_refresh_request.set(true);
        let reservation = self.clone();
        manager.reserve_quota(
            self.key(),
            delta,
            Box::new(move |result| reservation.did_update_reserved_quota(delta, result, callback)),
        );
        Ok(())
    }

    fn did_update_reserved_quota<F>(&self, requested: i64, result: Result<QuotaGrant>, callback: F)
    where
        F: FnOnce(Result<()>),
    {
        debug_assert!(self.running_refresh_request.get());
        self.running_refresh_request.set(false);

        if self.client_crashed.get() {
            // Dropping the offer unreserves it.
            drop(result);
            callback(Err(Error::Aborted));
            return;
        }

        match result {
            Ok(grant) => {
                let granted = grant.accept();
                if granted < requested {
                    info!(
                        "Quota for {} only partially granted: {} of {}",
                        self.key(),
                        granted,
                        requested
                    );
                }
                self.remaining_quota
                    .set(self.remaining_quota.get().saturating_add(granted));
                callback(Ok(()));
            }
            Err(e) => {
                warn!("Failed to refresh reservation for {}: {}", self.key(), e);
                callback(Err(e));
            }
        }
    }

    /// Opens a handle on `platform_path` whose growth is charged to this
    /// reservation.
    pub fn get_open_file_handle(self: &Rc<Self>, platform_path: &Path) -> OpenFileHandle {
        self.buffer.get_open_file_handle(self, platform_path)
    }

    /// Charges `size` bytes of growth to the cache. The cache may go
    /// negative when the writer outran its last refresh; the next refresh
    /// corrects it.
    pub(crate) fn consume_reservation(&self, size: i64) {
        debug_assert!(size >= 0, "negative consumption {size}");
        if self.client_crashed.get() || size <= 0 {
            return;
        }
        self.remaining_quota
            .set(self.remaining_quota.get().saturating_sub(size));
        self.buffer.put_reservation_to_buffer(size);
    }

    // Hands the cache back to the buffer. An overrun cache already moved the
    // full growth into the buffer, so the uncovered part is charged to the
    // backend instead.
    fn return_remaining_quota(&self) {
        let remaining = self.remaining_quota.replace(0);
        if remaining > 0 {
            self.buffer.put_reservation_to_buffer(remaining);
        } else if remaining < 0 {
            self.buffer.charge_overrun(remaining.saturating_neg());
        }
    }

    /// Marks the client as gone and returns its cache to the buffer. Files
    /// still open keep working; their growth is reconciled against the real
    /// file size when they close.
    pub fn on_client_crash(&self) {
        if self.client_crashed.replace(true) {
            return;
        }
        info!("Client of reservation for {} crashed", self.key());
        self.return_remaining_quota();
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.client_crashed.get() {
            return;
        }
        self.return_remaining_quota();
    }
}

impl fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("key", self.key())
            .field("remaining_quota", &self.remaining_quota.get())
            .field("client_crashed", &self.client_crashed.get())
            .field("running_refresh_request", &self.running_refresh_request.get())
            .finish()
    }
}
