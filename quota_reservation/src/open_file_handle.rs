// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::rc::Rc;

use crate::open_file_handle_context::OpenFileHandleContext;
use crate::reservation::QuotaReservation;

/// Capability for one writer on one open file.
///
/// Growth reported through the handle is charged to its reservation as soon
/// as it is observed. Dropping the handle closes it; the file's usage is
/// committed when the last handle on the same path is gone.
pub struct OpenFileHandle {
    reservation: Rc<QuotaReservation>,
    context: Rc<OpenFileHandleContext>,
}

impl OpenFileHandle {
    pub(crate) fn new(
        reservation: Rc<QuotaReservation>,
        context: Rc<OpenFileHandleContext>,
    ) -> Self {
        OpenFileHandle {
            reservation,
            context,
        }
    }

    /// Reports a positional write ending at `offset`. Returns the growth
    /// charged to the reservation.
    pub fn update_max_written_offset(&self, offset: i64) -> i64 {
        let growth = self.context.update_max_written_offset(offset);
        if growth > 0 {
            self.reservation.consume_reservation(growth);
        }
        growth
    }

    /// Reports `amount` bytes written in append mode.
    pub fn add_append_mode_write_amount(&self, amount: i64) {
        if amount <= 0 {
            return;
        }
        self.context.add_append_mode_write_amount(amount);
        self.reservation.consume_reservation(amount);
    }

    pub fn estimated_file_size(&self) -> i64 {
        self.context.estimated_file_size()
    }

    pub fn max_written_offset(&self) -> i64 {
        self.context.max_written_offset()
    }

    pub fn reservation(&self) -> &Rc<QuotaReservation> {
        &self.reservation
    }

    pub fn context(&self) -> &Rc<OpenFileHandleContext> {
        &self.context
    }
}

impl fmt::Debug for OpenFileHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OpenFileHandle")
            .field("context", &self.context)
            .finish()
    }
}
