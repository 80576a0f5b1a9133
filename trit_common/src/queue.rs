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

use crate::TransferError;

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A `BoundedQueue` is a fixed-capacity FIFO connecting two pipeline stages.
///
/// Elements are moved in and out, never copied. `push` and `pop` block on
/// internal condition variables; the `*_timeout` variants give up after a
/// deadline so that workers can interleave waiting with abort checks.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    /// Fails if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, TransferError> {
        if capacity == 0 {
            return Err(TransferError::Precondition(
                "queue capacity must be greater than zero",
            ));
        }

        Ok(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    /// Moves `value` into the queue, blocking while the queue is full.
    pub fn push(&self, value: T) {
        let mut queue = self.inner.lock().unwrap();
        while queue.len() >= self.capacity {
            queue = self.not_full.wait(queue).unwrap();
        }

        queue.push_back(value);
        drop(queue);

        self.not_empty.notify_one();
    }

    /// Like [`BoundedQueue::push`], but waits at most `timeout` for space.
    /// Hands `value` back to the caller if the queue stayed full.
    pub fn push_timeout(&self, value: T, timeout: Duration) -> Result<(), T> {
        let (mut queue, result) = self
            .not_full
            .wait_timeout_while(self.inner.lock().unwrap(), timeout, |queue| {
                queue.len() >= self.capacity
            })
            .unwrap();

        if result.timed_out() && queue.len() >= self.capacity {
            return Err(value);
        }

        queue.push_back(value);
        drop(queue);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes and returns the front element, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut queue = self.inner.lock().unwrap();
        while queue.is_empty() {
            queue = self.not_empty.wait(queue).unwrap();
        }

        let value = queue.pop_front().unwrap();
        drop(queue);

        self.not_full.notify_one();
        value
    }

    /// Removes and returns the front element without blocking,
    /// or `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.inner.lock().unwrap().pop_front()?;
        self.not_full.notify_one();
        Some(value)
    }

    /// Like [`BoundedQueue::pop`], but waits at most `timeout` for an element.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let (mut queue, _) = self
            .not_empty
            .wait_timeout_while(self.inner.lock().unwrap(), timeout, |queue| queue.is_empty())
            .unwrap();

        let value = queue.pop_front()?;
        drop(queue);

        self.not_full.notify_one();
        Some(value)
    }

    /// Reports the number of elements currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Reports whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Reports whether the queue holds `capacity` elements.
    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().len() >= self.capacity
    }

    /// Returns the fixed capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
