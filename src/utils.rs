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

use std::time::{Duration, Instant};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{info, warn};

/// Running min/avg/max over a sliding window, for telemetry accumulators.
pub struct RollingStat {
    window: Box<[f64]>,
    cursor: usize,
    filled: usize,
    last: f64,
}

impl RollingStat {
    pub fn new(window_len: usize) -> Self {
        Self {
            window: vec![0.0; window_len.max(1)].into(),
            cursor: 0,
            filled: 0,
            last: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.last = value;
        self.window[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.window.len();
        if self.filled < self.window.len() {
            self.filled += 1;
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn avg(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.window[..self.filled].iter().sum::<f64>() / self.filled as f64
    }

    pub fn min(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.window[..self.filled]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.window[..self.filled]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Suppresses repeated warnings on hot per-packet failure paths.
pub struct WarnRateLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl WarnRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of suppressed events since the last permitted
    /// warning, or `None` if this one should be suppressed too.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                let suppressed = self.suppressed;
                self.suppressed = 0;
                Some(suppressed)
            }
        }
    }
}

pub fn set_realtime_priority() {
    let pid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rolling_stat_tracks_window() {
        let mut stat = RollingStat::new(3);
        stat.update(1.0);
        stat.update(-2.0);
        stat.update(4.0);
        assert_eq!(4.0, stat.last());
        assert_eq!(1.0, stat.avg());
        assert_eq!(-2.0, stat.min());
        assert_eq!(4.0, stat.max());
    }

    #[test]
    fn warn_rate_limiter_suppresses_within_interval() {
        let mut limiter = WarnRateLimiter::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert_eq!(Some(0), limiter.check(t0));
        assert_eq!(None, limiter.check(t0 + Duration::from_millis(10)));
        assert_eq!(None, limiter.check(t0 + Duration::from_millis(20)));
        assert_eq!(Some(2), limiter.check(t0 + Duration::from_millis(1_100)));
    }
}
