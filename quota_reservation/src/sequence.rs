// Copyright © 2026 The Fileapi Quota Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

/// Single threaded FIFO of deferred work.
///
/// Everything belonging to one storage partition runs on one of these, so
/// state shared between the manager, its buffers, reservations and open
/// file contexts is never touched concurrently. Clones share the queue.
#[derive(Clone, Default)]
pub struct SequencedTaskRunner {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl SequencedTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task` behind everything already posted.
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Runs queued tasks, including the ones posted while running, until the
    /// queue is empty. Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the task runs: tasks post more tasks.
            let task = self.queue.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl fmt::Debug for SequencedTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SequencedTaskRunner")
            .field("pending", &self.pending())
            .finish()
    }
}
