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

//! Playback-rate control.
//!
//! A PI controller keeps each stream's buffer fill near its desired
//! latency by nudging the resampling rate a few hundred ppm at a time;
//! the Kalman clock's drift estimate is fed forward so steady clock skew
//! is compensated without accumulating integrator windup.

use crate::{config::TimingConfig, formats::MilliSeconds, timeshift::state::StreamTimingState};
use std::time::Instant;

pub struct RateUpdate {
    pub rate: f64,
    /// The controller can no longer speed consumption up; late packets
    /// beyond the catch-up budget must be dropped instead.
    pub saturated: bool,
}

/// One controller step. `state.current_buffer_level_ms` must already
/// reflect this dispatch; updates the integrator, slew state and the
/// smoothed playback rate in place.
pub fn update_playback_rate(
    state: &mut StreamTimingState,
    tuning: &TimingConfig,
    desired_latency_ms: MilliSeconds,
    now: Instant,
) -> RateUpdate {
    let buffer_error_ms = desired_latency_ms - state.current_buffer_level_ms;

    let dt = state
        .last_controller_update
        .map(|t| now.saturating_duration_since(t).as_secs_f64())
        .unwrap_or_else(|| tuning.loop_max_sleep().as_secs_f64());
    state.last_controller_update = Some(now);

    let p = tuning.playback_ratio_kp * buffer_error_ms;

    state.integrator_ppm += tuning.playback_ratio_ki * buffer_error_ms * dt;
    state.integrator_ppm = state.integrator_ppm.clamp(
        -tuning.playback_ratio_integral_limit_ppm,
        tuning.playback_ratio_integral_limit_ppm,
    );

    let max_slew = tuning.playback_ratio_slew_ppm_per_sec * dt;
    let controller_ppm = (p + state.integrator_ppm)
        .clamp(state.controller_ppm - max_slew, state.controller_ppm + max_slew)
        .clamp(
            -tuning.playback_ratio_max_deviation_ppm,
            tuning.playback_ratio_max_deviation_ppm,
        );
    state.controller_ppm = controller_ppm;

    let combined_ppm = (state.clock.drift_ppm() + controller_ppm).clamp(
        -tuning.playback_ratio_max_deviation_ppm,
        tuning.playback_ratio_max_deviation_ppm,
    );

    let target_rate = 1.0 + combined_ppm * 1e-6;
    let alpha = tuning.playback_ratio_smoothing;
    let smoothed = ((1.0 - alpha) * state.playback_rate + alpha * target_rate)
        .clamp(tuning.min_playback_rate, tuning.max_playback_rate);
    state.playback_rate = smoothed;

    // Catching up means consuming input faster, i.e. pushing the rate
    // toward its lower bound.
    let epsilon = 1e-9;
    let saturated = smoothed <= tuning.min_playback_rate + epsilon
        || combined_ppm <= -tuning.playback_ratio_max_deviation_ppm + epsilon;

    RateUpdate {
        rate: smoothed,
        saturated,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::TimingConfig, formats::AudioFormat, timeshift::state::StreamTimingState};
    use std::time::Duration;

    fn state() -> StreamTimingState {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        StreamTimingState::new(format, &TimingConfig::default(), Instant::now())
    }

    #[test]
    fn balanced_buffer_keeps_rate_near_unity() {
        let tuning = TimingConfig::default();
        let mut state = state();
        let now = Instant::now();
        for i in 0..200 {
            state.current_buffer_level_ms = tuning.target_buffer_level_ms;
            let update = update_playback_rate(
                &mut state,
                &tuning,
                tuning.target_buffer_level_ms,
                now + Duration::from_millis(i * 10),
            );
            assert!(!update.saturated);
        }
        assert!(
            (state.playback_rate - 1.0).abs() < 20e-6,
            "rate should stay within 20 ppm of unity, got {}",
            state.playback_rate
        );
    }

    #[test]
    fn starved_buffer_raises_rate() {
        let tuning = TimingConfig::default();
        let mut state = state();
        let now = Instant::now();
        for i in 0..100 {
            state.current_buffer_level_ms = 0.0;
            update_playback_rate(
                &mut state,
                &tuning,
                tuning.target_buffer_level_ms,
                now + Duration::from_millis(i * 10),
            );
        }
        assert!(
            state.playback_rate > 1.0,
            "starved buffer should slow consumption (rate > 1), got {}",
            state.playback_rate
        );
    }

    #[test]
    fn overfull_buffer_saturates_at_deviation_limit() {
        let tuning = TimingConfig::default();
        let mut state = state();
        let now = Instant::now();
        let mut saturated = false;
        for i in 0..2_000 {
            state.current_buffer_level_ms = 10_000.0;
            let update = update_playback_rate(
                &mut state,
                &tuning,
                tuning.target_buffer_level_ms,
                now + Duration::from_millis(i * 10),
            );
            saturated = update.saturated;
        }
        assert!(saturated, "deeply overfull buffer must saturate the controller");
        assert!(state.playback_rate < 1.0);
    }

    #[test]
    fn rate_always_within_configured_bounds() {
        let tuning = TimingConfig::default();
        let mut state = state();
        let now = Instant::now();
        for i in 0..500 {
            state.current_buffer_level_ms = if i % 2 == 0 { 0.0 } else { 100_000.0 };
            let update = update_playback_rate(
                &mut state,
                &tuning,
                tuning.target_buffer_level_ms,
                now + Duration::from_millis(i * 10),
            );
            assert!(update.rate >= tuning.min_playback_rate);
            assert!(update.rate <= tuning.max_playback_rate);
        }
    }

    #[test]
    fn integrator_is_clamped() {
        let tuning = TimingConfig::default();
        let mut state = state();
        let now = Instant::now();
        for i in 0..10_000 {
            state.current_buffer_level_ms = 0.0;
            update_playback_rate(
                &mut state,
                &tuning,
                tuning.target_buffer_level_ms,
                now + Duration::from_millis(i * 10),
            );
        }
        assert!(state.integrator_ppm <= tuning.playback_ratio_integral_limit_ppm);
    }
}
