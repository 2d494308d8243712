// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded drop-newest ring queue.
//!
//! The queue owns every record it stores. Once `max` records are buffered, new arrivals are
//! rejected and counted instead of evicting anything already stored. Extraction is always
//! oldest-first, and every extraction reports how many arrivals were rejected since the previous
//! one as a rate adjustment: `(returned + dropped) / returned`.
//!
//! # Storage
//!
//! The backing array starts small ([`MIN_QUEUE_LEN`] slots) and doubles whenever it fills up
//! below `max`. After an extraction leaves it less than a quarter occupied it shrinks back to
//! twice the remaining occupancy, so a single burst does not pin memory forever.

use crate::constants::MIN_QUEUE_LEN;
use crate::errors::QueueFull;

/// Result of one [`FlowQueue::dequeue`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    /// Extracted records, oldest first.
    pub records: Vec<T>,
    /// Arrivals rejected since the previous non-empty dequeue.
    pub dropped: u64,
    /// `(records + dropped) / records`; exactly 1.0 when nothing was dropped, 0.0 when empty.
    pub rate_adjustment: f64,
}

impl<T> Batch<T> {
    fn empty() -> Self {
        Batch {
            records: Vec::new(),
            dropped: 0,
            rate_adjustment: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub struct FlowQueue<T> {
    buf: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
    max: usize,
    dropped: u64,
    full: QueueFull,
}

impl<T> FlowQueue<T> {
    pub fn new(max: usize) -> Self {
        let len = MIN_QUEUE_LEN.min(max.max(1));
        let mut buf = Vec::with_capacity(len);
        buf.resize_with(len, || None);
        FlowQueue {
            buf,
            head: 0,
            tail: 0,
            count: 0,
            max,
            dropped: 0,
            full: QueueFull { max },
        }
    }

    /// Appends `record` at the tail.
    ///
    /// A full queue discards `record`, bumps the dropped counter and returns [`QueueFull`].
    pub fn enqueue(&mut self, record: T) -> Result<(), QueueFull> {
        if self.count >= self.max {
            self.dropped += 1;
            return Err(self.full);
        }

        if self.count == self.buf.len() {
            self.resize(self.buf.len() * 2);
        }

        self.buf[self.tail] = Some(record);
        self.tail = (self.tail + 1) % self.buf.len();
        self.count += 1;
        Ok(())
    }

    /// Extracts up to `n` of the oldest records, or up to `overflow_n` when the queue is
    /// saturated, and resets the dropped counter.
    pub fn dequeue(&mut self, n: usize, overflow_n: usize) -> Batch<T> {
        let requested = if self.count >= self.max { overflow_n } else { n };
        let get = requested.min(self.count);
        if get == 0 {
            return Batch::empty();
        }

        let len = self.buf.len();
        let first = get.min(len - self.head);
        let mut records = Vec::with_capacity(get);
        // The span may wrap past the end of the array: tail of the array first, then its front.
        records.extend(
            self.buf[self.head..self.head + first]
                .iter_mut()
                .filter_map(Option::take),
        );
        records.extend(self.buf[..get - first].iter_mut().filter_map(Option::take));

        self.head = (self.head + get) % len;
        self.count -= get;

        let dropped = std::mem::take(&mut self.dropped);
        let rate_adjustment = (get as u64 + dropped) as f64 / get as f64;

        if len > MIN_QUEUE_LEN && self.count * 4 < len {
            self.resize((self.count * 2).max(MIN_QUEUE_LEN));
        }

        Batch {
            records,
            dropped,
            rate_adjustment,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Arrivals rejected since the last non-empty dequeue.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    // Re-lays the live records out at the front of an array of `len` slots. `len >= count`.
    fn resize(&mut self, len: usize) {
        self.buf.rotate_left(self.head);
        self.buf.resize_with(len, || None);
        self.buf.shrink_to_fit();
        self.head = 0;
        self.tail = self.count % len;
    }

    #[cfg(test)]
    fn backing_len(&self) -> usize {
        self.buf.len()
    }
}
