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

//! Per-stream clock model.
//!
//! Each remote source runs on its own free-running media clock. This module
//! tracks the affine mapping between a stream's RTP timebase and the local
//! monotonic clock with a two-state Kalman filter (offset + drift), so the
//! dispatch scheduler can project stable playout deadlines across seconds of
//! packet history instead of chasing per-packet arrival jitter.

use crate::formats::{FramesPerSecond, Ppm, Seconds};
use std::time::{Duration, Instant};

/// Trust in the linear clock model between measurements.
const PROCESS_NOISE: f64 = 1e-5;
/// Trust in a single (rtp, arrival) measurement.
const MEASUREMENT_NOISE: f64 = 1e-2;
const INITIAL_OFFSET_UNCERTAINTY: f64 = 1.0;
const INITIAL_DRIFT_UNCERTAINTY: f64 = 1e-4;

/// Kalman filter mapping `local_time ≈ rtp / sample_rate + offset + drift·Δt`.
pub struct StreamClock {
    sample_rate: f64,
    /// State vector: seconds of offset, dimensionless drift ratio.
    offset: Seconds,
    drift: f64,
    /// 2×2 covariance.
    p: [[f64; 2]; 2],
    initialized: bool,
    reference: Option<Instant>,
    last_update: Option<Instant>,
    last_rtp: u32,
    unwrapped_rtp: u64,
    last_innovation: Seconds,
    last_measured_offset: Seconds,
}

impl StreamClock {
    pub fn new(sample_rate: FramesPerSecond) -> Self {
        Self {
            sample_rate: sample_rate as f64,
            offset: 0.0,
            drift: 0.0,
            p: [
                [INITIAL_OFFSET_UNCERTAINTY, 0.0],
                [0.0, INITIAL_DRIFT_UNCERTAINTY],
            ],
            initialized: false,
            reference: None,
            last_update: None,
            last_rtp: 0,
            unwrapped_rtp: 0,
            last_innovation: 0.0,
            last_measured_offset: 0.0,
        }
    }

    /// Feeds one (RTP timestamp, arrival instant) observation into the filter.
    pub fn update(&mut self, rtp_ts: u32, arrival: Instant) {
        let Some(reference) = self.reference else {
            self.reference = Some(arrival);
            self.last_update = Some(arrival);
            self.last_rtp = rtp_ts;
            self.unwrapped_rtp = 0;
            self.offset = 0.0;
            self.drift = 0.0;
            self.last_measured_offset = 0.0;
            self.last_innovation = 0.0;
            self.initialized = true;
            return;
        };

        // Unsigned-wrap-aware unwrap into a 64-bit frame counter.
        let delta = rtp_ts.wrapping_sub(self.last_rtp) as u64;
        self.unwrapped_rtp = self.unwrapped_rtp.wrapping_add(delta);
        self.last_rtp = rtp_ts;

        let dt = self
            .last_update
            .map(|t| arrival.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.last_update = Some(arrival);

        // Predict.
        let offset_pred = self.offset + self.drift * dt;
        let mut p = self.p;
        // P = F P Fᵀ + Q with F = [[1, dt], [0, 1]].
        let p00 = p[0][0] + dt * (p[1][0] + p[0][1]) + dt * dt * p[1][1] + PROCESS_NOISE * dt.max(1e-6);
        let p01 = p[0][1] + dt * p[1][1];
        let p10 = p[1][0] + dt * p[1][1];
        let p11 = p[1][1] + PROCESS_NOISE * dt.max(1e-6);
        p = [[p00, p01], [p10, p11]];

        // Measure: arrival relative to reference, minus media time elapsed.
        let measured =
            arrival.saturating_duration_since(reference).as_secs_f64() - self.media_seconds();
        self.last_measured_offset = measured;

        let innovation = measured - offset_pred;
        self.last_innovation = innovation;

        let s = p[0][0] + MEASUREMENT_NOISE;
        let k0 = p[0][0] / s;
        let k1 = p[1][0] / s;

        self.offset = offset_pred + k0 * innovation;
        self.drift += k1 * innovation;

        // P = (I - K H) P with H = [1, 0].
        self.p = [
            [(1.0 - k0) * p[0][0], (1.0 - k0) * p[0][1]],
            [p[1][0] - k1 * p[0][0], p[1][1] - k1 * p[0][1]],
        ];
    }

    /// Projects a target RTP timestamp through the current model.
    ///
    /// Returns `None` until the first observation has been made.
    pub fn expected_arrival(&self, rtp_ts: u32) -> Option<Instant> {
        let reference = self.reference?;
        // Extrapolate the unwrapped counter from the last observed value;
        // the signed cast keeps targets slightly behind the head usable.
        let delta = rtp_ts.wrapping_sub(self.last_rtp) as i32 as i64;
        let target_frames = self.unwrapped_rtp as i64 + delta;
        let target_seconds = target_frames as f64 / self.sample_rate;
        Some(instant_offset(reference, target_seconds + self.offset))
    }

    pub fn reset(&mut self) {
        self.p = [
            [INITIAL_OFFSET_UNCERTAINTY, 0.0],
            [0.0, INITIAL_DRIFT_UNCERTAINTY],
        ];
        self.offset = 0.0;
        self.drift = 0.0;
        self.initialized = false;
        self.reference = None;
        self.last_update = None;
        self.last_rtp = 0;
        self.unwrapped_rtp = 0;
        self.last_innovation = 0.0;
        self.last_measured_offset = 0.0;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn offset_seconds(&self) -> Seconds {
        self.offset
    }

    pub fn drift_ppm(&self) -> Ppm {
        self.drift * 1e6
    }

    pub fn last_innovation_seconds(&self) -> Seconds {
        self.last_innovation
    }

    pub fn last_measured_offset_seconds(&self) -> Seconds {
        self.last_measured_offset
    }

    pub fn last_update_time(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn unwrapped_rtp(&self) -> u64 {
        self.unwrapped_rtp
    }

    fn media_seconds(&self) -> Seconds {
        self.unwrapped_rtp as f64 / self.sample_rate
    }
}

fn instant_offset(base: Instant, seconds: Seconds) -> Instant {
    if seconds >= 0.0 {
        base + Duration::from_secs_f64(seconds)
    } else {
        base.checked_sub(Duration::from_secs_f64(-seconds))
            .unwrap_or(base)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed_steady(clock: &mut StreamClock, base: Instant, packets: usize, period_us: u64) {
        for i in 0..packets {
            let ts = (i as u32).wrapping_mul(480);
            let arrival = base + Duration::from_micros(i as u64 * period_us);
            clock.update(ts, arrival);
        }
    }

    #[test]
    fn converges_on_drift_free_stream() {
        let mut clock = StreamClock::new(48_000);
        let base = Instant::now();
        feed_steady(&mut clock, base, 500, 10_000);

        assert!(clock.is_initialized());
        assert!(
            clock.drift_ppm().abs() < 20.0,
            "drift should settle near zero, got {} ppm",
            clock.drift_ppm()
        );
        // Offset settles to a constant; expected arrival of the next packet
        // lands within a millisecond of its true arrival.
        let next_ts = 500u32 * 480;
        let true_arrival = base + Duration::from_micros(500 * 10_000);
        let predicted = clock.expected_arrival(next_ts).expect("clock initialized");
        let err = if predicted > true_arrival {
            predicted - true_arrival
        } else {
            true_arrival - predicted
        };
        assert!(err < Duration::from_millis(1), "prediction error {err:?}");
    }

    #[test]
    fn detects_positive_drift() {
        // Remote clock slow: 480 frames take 10.05 ms of wall time,
        // i.e. the stream drifts by ~5000 ppm.
        let mut clock = StreamClock::new(48_000);
        let base = Instant::now();
        feed_steady(&mut clock, base, 1_000, 10_050);

        assert!(
            clock.drift_ppm() > 2_000.0,
            "expected large positive drift, got {} ppm",
            clock.drift_ppm()
        );
    }

    #[test]
    fn unwraps_across_u32_boundary() {
        let mut clock = StreamClock::new(48_000);
        let base = Instant::now();
        let start = u32::MAX - 960;
        let mut prev_unwrapped = 0;
        for i in 0..10u32 {
            let ts = start.wrapping_add(i * 480);
            clock.update(ts, base + Duration::from_millis(i as u64 * 10));
            assert!(clock.unwrapped_rtp() >= prev_unwrapped);
            prev_unwrapped = clock.unwrapped_rtp();
        }
        assert_eq!(9 * 480, clock.unwrapped_rtp());
        // Wrap did not disturb the model.
        assert!(clock.last_innovation_seconds().abs() < 0.01);
    }

    #[test]
    fn reset_deinitializes() {
        let mut clock = StreamClock::new(48_000);
        clock.update(0, Instant::now());
        assert!(clock.is_initialized());
        clock.reset();
        assert!(!clock.is_initialized());
        assert_eq!(None, clock.expected_arrival(480).map(|_| ()));
    }
}
