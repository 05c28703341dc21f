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

use crate::{
    config::TimingConfig,
    formats::{AudioFormat, MilliSeconds},
    time::StreamClock,
    utils::RollingStat,
};
use dashmap::DashMap;
use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

const TELEMETRY_WINDOW: usize = 256;

/// Outcome of comparing a packet's RTP delta against the stream history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketContinuity {
    Continuous,
    /// RTP jumped and the wallclock gap cannot explain it.
    SessionReset,
}

/// Everything the scheduler knows about one source stream.
///
/// Owned by the timeshift manager, accessed under the stream's own lock
/// from the per-stream lock map, never under the global data mutex alone.
pub struct StreamTimingState {
    pub clock: StreamClock,
    pub format: AudioFormat,
    pub last_rtp_timestamp: u32,
    pub last_wallclock: Instant,
    /// RFC-3550 style smoothed interarrival jitter.
    pub jitter_ms: MilliSeconds,
    pub playback_rate: f64,
    pub target_buffer_level_ms: MilliSeconds,
    pub current_buffer_level_ms: MilliSeconds,
    pub last_played_rtp: Option<u32>,
    /// PI controller integrator, in ppm.
    pub integrator_ppm: f64,
    /// Last slew-limited controller output, in ppm.
    pub controller_ppm: f64,
    pub last_controller_update: Option<Instant>,
    pub total_packets: u64,
    pub late_packets: u64,
    pub discarded_packets: u64,
    pub underrun_count: u64,
    pub reanchor_count: u64,
    pub arrival_error_ms: RollingStat,
    pub playout_deviation_ms: RollingStat,
    pub head_lag_ms: RollingStat,
}

impl StreamTimingState {
    pub fn new(format: AudioFormat, tuning: &TimingConfig, now: Instant) -> Self {
        Self {
            clock: StreamClock::new(format.sample_rate),
            format,
            last_rtp_timestamp: 0,
            last_wallclock: now,
            jitter_ms: 0.0,
            playback_rate: 1.0,
            target_buffer_level_ms: tuning.target_buffer_level_ms,
            current_buffer_level_ms: 0.0,
            last_played_rtp: None,
            integrator_ppm: 0.0,
            controller_ppm: 0.0,
            last_controller_update: None,
            total_packets: 0,
            late_packets: 0,
            discarded_packets: 0,
            underrun_count: 0,
            reanchor_count: 0,
            arrival_error_ms: RollingStat::new(TELEMETRY_WINDOW),
            playout_deviation_ms: RollingStat::new(TELEMETRY_WINDOW),
            head_lag_ms: RollingStat::new(TELEMETRY_WINDOW),
        }
    }

    /// Recreated state after a session reset; only the reanchor counter
    /// survives.
    pub fn reanchored(&self, tuning: &TimingConfig, now: Instant) -> Self {
        let mut state = Self::new(self.format, tuning, now);
        state.reanchor_count = self.reanchor_count + 1;
        state
    }

    /// Classifies a packet's RTP delta as plausible continuation or as a
    /// session reset. A large jump is tolerated when the wallclock gap
    /// since the previous packet accounts for it (long idle, not a
    /// restart).
    pub fn classify(&self, rtp_ts: u32, now: Instant, tuning: &TimingConfig) -> PacketContinuity {
        if !self.clock.is_initialized() {
            return PacketContinuity::Continuous;
        }

        let sample_rate = self.format.sample_rate as f64;
        let delta = rtp_ts.wrapping_sub(self.last_rtp_timestamp) as i32 as i64;
        let reset_threshold_frames = sample_rate * tuning.rtp_session_reset_threshold_seconds;
        if (delta.unsigned_abs() as f64) <= reset_threshold_frames {
            return PacketContinuity::Continuous;
        }

        let wallclock_gap = now.saturating_duration_since(self.last_wallclock);
        if !wallclock_gap.is_zero() {
            let expected_frames = wallclock_gap.as_secs_f64() * sample_rate;
            let slack_frames = sample_rate * tuning.rtp_continuity_slack_seconds;
            if (delta as f64 - expected_frames).abs() <= slack_frames {
                return PacketContinuity::Continuous;
            }
        }

        PacketContinuity::SessionReset
    }

    /// Feeds one packet arrival into the clock model and jitter estimate.
    pub fn observe(&mut self, rtp_ts: u32, arrival: Instant, tuning: &TimingConfig) {
        if self.clock.is_initialized()
            && let Some(expected) = self.clock.expected_arrival(rtp_ts)
        {
            let error_ms = signed_millis(arrival, expected);
            self.arrival_error_ms.update(error_ms);
            self.jitter_ms += (error_ms.abs() - self.jitter_ms) / tuning.jitter_smoothing_factor;
        }
        self.clock.update(rtp_ts, arrival);
        self.last_rtp_timestamp = rtp_ts;
        self.last_wallclock = arrival;
        self.total_packets += 1;
    }
}

pub fn signed_millis(a: Instant, b: Instant) -> f64 {
    if a >= b {
        a.duration_since(b).as_secs_f64() * 1_000.0
    } else {
        -(b.duration_since(a).as_secs_f64() * 1_000.0)
    }
}

/// Per-source lock map: a sharded map of individually lockable timing
/// states, so producers never contend on the global data mutex for
/// timing work.
pub struct StreamStateMap {
    streams: DashMap<String, Arc<Mutex<StreamTimingState>>>,
}

impl StreamStateMap {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// The only creator of timing states.
    pub fn get_or_create(
        &self,
        source_tag: &str,
        format: AudioFormat,
        tuning: &TimingConfig,
        now: Instant,
    ) -> Arc<Mutex<StreamTimingState>> {
        let entry = self
            .streams
            .entry(source_tag.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(StreamTimingState::new(format, tuning, now))));
        Arc::clone(entry.value())
    }

    pub fn get(&self, source_tag: &str) -> Option<Arc<Mutex<StreamTimingState>>> {
        self.streams.get(source_tag).map(|it| Arc::clone(it.value()))
    }

    pub fn remove(&self, source_tag: &str) -> bool {
        self.streams.remove(source_tag).is_some()
    }

    pub fn tags(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for StreamStateMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn fmt() -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        }
    }

    fn state_with_history(now: Instant) -> StreamTimingState {
        let tuning = TimingConfig::default();
        let mut state = StreamTimingState::new(fmt(), &tuning, now);
        for i in 0..100u32 {
            state.observe(i * 480, now + Duration::from_millis(i as u64 * 10), &tuning);
        }
        state
    }

    #[test]
    fn small_delta_is_continuous() {
        let now = Instant::now();
        let state = state_with_history(now);
        let next = now + Duration::from_secs(1);
        assert_eq!(
            PacketContinuity::Continuous,
            state.classify(100 * 480, next, &TimingConfig::default())
        );
    }

    #[test]
    fn rtp_jump_with_zero_gap_is_reset() {
        let now = Instant::now();
        let state = state_with_history(now);
        // Quarter second of frames skipped with no wallclock progress.
        let jump = state.last_rtp_timestamp + 12_000;
        assert_eq!(
            PacketContinuity::SessionReset,
            state.classify(jump, state.last_wallclock, &TimingConfig::default())
        );
    }

    #[test]
    fn rtp_jump_matching_wallclock_gap_is_idle() {
        let now = Instant::now();
        let state = state_with_history(now);
        // Source was idle for two seconds and its counter kept running.
        let gap = Duration::from_secs(2);
        let jump = state.last_rtp_timestamp.wrapping_add(2 * 48_000 + 480);
        assert_eq!(
            PacketContinuity::Continuous,
            state.classify(jump, state.last_wallclock + gap, &TimingConfig::default())
        );
    }

    #[test]
    fn wrap_boundary_is_not_a_reset() {
        let tuning = TimingConfig::default();
        let now = Instant::now();
        let mut state = StreamTimingState::new(fmt(), &tuning, now);
        state.observe(u32::MAX - 239, now, &tuning);
        // 480 frames later the counter has wrapped to 240.
        assert_eq!(
            PacketContinuity::Continuous,
            state.classify(240, now + Duration::from_millis(10), &tuning)
        );
    }

    #[test]
    fn jitter_estimate_tracks_arrival_noise() {
        let tuning = TimingConfig::default();
        let now = Instant::now();
        let mut state = StreamTimingState::new(fmt(), &tuning, now);
        // Alternating ±2 ms arrival error around the nominal 10 ms cadence.
        for i in 0..200u32 {
            let nominal = now + Duration::from_millis(i as u64 * 10);
            let arrival = if i % 2 == 0 {
                nominal + Duration::from_millis(2)
            } else {
                nominal
            };
            state.observe(i * 480, arrival, &tuning);
        }
        assert!(
            state.jitter_ms > 0.5 && state.jitter_ms < 5.0,
            "jitter estimate out of range: {}",
            state.jitter_ms
        );
    }
}
