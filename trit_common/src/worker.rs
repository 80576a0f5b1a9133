// trit_common is the main trit library implementing the transfer core shared logic.
// Copyright (C) 2025  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::queue::BoundedQueue;
use crate::TransferError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

/// How long a worker waits on a queue before re-checking the abort flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A `WorkerContext` is shared by all workers of one session. It carries the
/// cooperative abort flag and captures the first error any worker reports.
#[derive(Debug, Default)]
pub struct WorkerContext {
    abort: AtomicBool,
    first_error: Mutex<Option<TransferError>>,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports whether the session is aborting. Workers poll this at every
    /// loop head and exit promptly once it is set.
    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Records a worker failure: raises the abort flag first so the other
    /// workers start winding down, then stores `error` unless an earlier
    /// failure is already recorded.
    pub fn handle_error(&self, error: TransferError) {
        self.abort.store(true, Ordering::SeqCst);

        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        } else {
            warn!("suppressing secondary worker error: {}", error);
        }
    }

    /// Propagates the first recorded error, if any. Called by the session
    /// driver after all workers have joined.
    pub fn raise_if_error(&self) -> Result<(), TransferError> {
        match self.first_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Runs `work` on behalf of a session worker, routing any failure into the
/// shared context.
pub fn run_worker(ctx: &WorkerContext, work: impl FnOnce() -> Result<(), TransferError>) {
    if let Err(e) = work() {
        ctx.handle_error(e);
    }
}

/// Moves `value` into `queue`, polling the abort flag whenever the queue
/// stays full. Returns false (dropping `value`) if the session aborted first.
pub(crate) fn push_abortable<T>(queue: &BoundedQueue<T>, ctx: &WorkerContext, value: T) -> bool {
    let mut value = value;
    loop {
        if ctx.should_abort() {
            return false;
        }

        match queue.push_timeout(value, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(v) => value = v,
        }
    }
}

/// Pops the next element from `queue` for a consuming stage.
///
/// Exit predicate: `None` is returned only once the producer has set `done`
/// AND the queue is drained, or once the session aborts. The order matters;
/// checking `done` without a final drain would lose the tail of the stream.
pub(crate) fn pop_abortable<T>(
    queue: &BoundedQueue<T>,
    done: &AtomicBool,
    ctx: &WorkerContext,
) -> Option<T> {
    loop {
        if ctx.should_abort() {
            return None;
        }

        if let Some(value) = queue.try_pop() {
            return Some(value);
        }

        if done.load(Ordering::SeqCst) && queue.is_empty() {
            return None;
        }

        if let Some(value) = queue.pop_timeout(POLL_INTERVAL) {
            return Some(value);
        }
    }
}
