/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Bounded single-producer single-consumer rings connecting the dispatch
//! path to sink mixers. Push never blocks: when full, the oldest element
//! is dropped and counted, trading history for liveness.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct AudioRing<T> {
    queue: ArrayQueue<T>,
    dropped: AtomicU64,
    high_water: AtomicU64,
}

impl<T> AudioRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
        }
    }

    /// Pushes an element, evicting the oldest one when full.
    pub fn push(&self, item: T) {
        if self.queue.force_push(item).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.update_high_water();
    }

    /// Pushes under a dynamic cap smaller than the ring capacity,
    /// trimming oldest queued elements first. Returns how many were
    /// trimmed.
    pub fn push_capped(&self, item: T, cap: usize) -> u64 {
        let cap = cap.clamp(1, self.queue.capacity());
        let mut trimmed = 0;
        while self.queue.len() >= cap {
            if self.queue.pop().is_none() {
                break;
            }
            trimmed += 1;
        }
        if trimmed > 0 {
            self.dropped.fetch_add(trimmed, Ordering::Relaxed);
        }
        if self.queue.force_push(item).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.update_high_water();
        trimmed
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }

    fn update_high_water(&self) {
        let len = self.queue.len() as u64;
        self.high_water.fetch_max(len, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let ring = AudioRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(2, ring.dropped());
        assert_eq!(Some(2), ring.pop());
        assert_eq!(Some(3), ring.pop());
        assert_eq!(Some(4), ring.pop());
        assert_eq!(None, ring.pop());
        assert_eq!(3, ring.high_water());
    }

    #[test]
    fn dynamic_cap_trims_before_push() {
        let ring = AudioRing::new(8);
        for i in 0..4 {
            ring.push(i);
        }
        let trimmed = ring.push_capped(99, 2);
        assert_eq!(3, trimmed);
        assert_eq!(2, ring.len());
        assert_eq!(Some(3), ring.pop());
        assert_eq!(Some(99), ring.pop());
    }
}
