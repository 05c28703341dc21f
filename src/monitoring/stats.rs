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

use crate::formats::{MilliSeconds, Ppm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the whole engine; taking it never blocks the
/// dispatch loop for long.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub global: GlobalStats,
    pub streams: Vec<StreamStats>,
    pub processors: Vec<ProcessorStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_packets_added: u64,
    pub buffer_size: usize,
    pub inbound_queue_size: usize,
    pub inbound_queue_high_water: u64,
    pub inbound_queue_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub source_tag: String,
    pub total_packets: u64,
    pub jitter_ms: MilliSeconds,
    pub clock_offset_ms: MilliSeconds,
    pub clock_drift_ppm: Ppm,
    pub arrival_error: DeviationStats,
    pub playout_deviation: DeviationStats,
    pub head_playout_lag_ms: MilliSeconds,
    pub late_packets: u64,
    pub discarded_packets: u64,
    pub underrun_count: u64,
    pub current_buffer_level_ms: MilliSeconds,
    pub target_buffer_level_ms: MilliSeconds,
    pub playback_rate: f64,
    pub reanchor_count: u64,
}

/// last/avg/min/max over the telemetry window, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviationStats {
    pub last: MilliSeconds,
    pub avg: MilliSeconds,
    pub min: MilliSeconds,
    pub max: MilliSeconds,
}

impl DeviationStats {
    pub fn from_rolling(stat: &crate::utils::RollingStat) -> Self {
        Self {
            last: stat.last(),
            avg: stat.avg(),
            min: stat.min(),
            max: stat.max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    pub instance_id: String,
    pub filter: String,
    pub bound_source_tag: Option<String>,
    /// Buffered packets between the read cursor and the buffer tail that
    /// this target would dispatch.
    pub pending_packets: usize,
    pub pending_ms: MilliSeconds,
    /// Live sink rings currently attached to this target.
    pub sink_count: usize,
    pub queue_depth: usize,
    pub queue_high_water: u64,
    pub dispatched_packets: u64,
    pub dropped_packets: u64,
    pub lagging_events: u64,
    pub idle_resets: u64,
}
