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

use crate::formats::AudioFormat;
use std::{sync::Arc, time::Instant};

/// One decoded network packet, tagged with its origin.
///
/// The audio payload is shared so that fan-out to multiple processor
/// targets does not copy PCM data.
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    /// Composite of logical source name and remote endpoint,
    /// e.g. `"living-room#192.0.2.1:1234"`.
    pub source_tag: String,
    pub audio_data: Arc<[u8]>,
    pub format: AudioFormat,
    /// 32-bit RTP timestamp (or an equivalent sample counter); wraps.
    pub rtp_timestamp: Option<u32>,
    /// Local monotonic instant at socket read.
    pub received_time: Instant,
    pub ssrcs: Vec<u32>,
    /// Marks silence/flush boundaries propagated through the pipeline.
    pub is_sentinel: bool,
    /// Set by the dispatch scheduler; 1.0 until dispatched.
    pub playback_rate: f64,
}

impl TaggedAudioPacket {
    pub fn duration_millis(&self) -> f64 {
        self.format
            .frames_to_millis(self.format.frames_in(self.audio_data.len()))
    }
}

/// One fixed-size block of processed audio, ready for mixing.
#[derive(Debug, Clone)]
pub struct ProcessedAudioChunk {
    /// Interleaved 32-bit samples at the processor's output geometry.
    pub audio_data: Vec<i32>,
    pub ssrcs: Vec<u32>,
    pub produced_time: Instant,
    /// Arrival instant of the originating input, shifted by the
    /// accumulated playback-rate dilation.
    pub origin_time: Instant,
    pub playback_rate: f64,
    pub is_sentinel: bool,
}
