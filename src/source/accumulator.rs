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

use std::{collections::VecDeque, time::Instant};

/// Bookkeeping for one appended packet so popped chunks can be
/// attributed back to their originating arrival.
#[derive(Debug, Clone)]
pub struct FragmentMeta {
    pub bytes: usize,
    pub consumed: usize,
    pub received_time: Instant,
    pub rtp_timestamp: Option<u32>,
    pub ssrcs: Vec<u32>,
    pub is_sentinel: bool,
}

/// Timing metadata attributed to a popped chunk, taken from the first
/// fragment that contributed bytes to it.
#[derive(Debug, Clone)]
pub struct ChunkAttribution {
    pub received_time: Instant,
    /// The fragment's RTP timestamp advanced by the frames already
    /// consumed from it.
    pub rtp_timestamp: Option<u32>,
    pub ssrcs: Vec<u32>,
    pub is_sentinel: bool,
}

/// Byte accumulator turning variable-sized network payloads into
/// fixed-size, frame-aligned input chunks.
pub struct InputAccumulator {
    buffer: VecDeque<u8>,
    fragments: VecDeque<FragmentMeta>,
}

impl InputAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            fragments: VecDeque::new(),
        }
    }

    pub fn push(&mut self, payload: &[u8], meta: FragmentMeta) {
        self.buffer.extend(payload);
        self.fragments.push_back(meta);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.fragments.clear();
    }

    /// Pops `bytes` from the front together with the attribution of the
    /// first contributing fragment. Fully drained fragments are consumed;
    /// a partially drained one stays at the head with its consumed offset
    /// (and thus its attributed RTP timestamp) advanced.
    pub fn pop_chunk(
        &mut self,
        bytes: usize,
        bytes_per_frame: usize,
    ) -> Option<(Vec<u8>, ChunkAttribution)> {
        if self.buffer.len() < bytes || bytes == 0 {
            return None;
        }

        let attribution = self.fragments.front().map(|fragment| ChunkAttribution {
            received_time: fragment.received_time,
            rtp_timestamp: fragment.rtp_timestamp.map(|ts| {
                ts.wrapping_add((fragment.consumed / bytes_per_frame.max(1)) as u32)
            }),
            ssrcs: fragment.ssrcs.clone(),
            is_sentinel: fragment.is_sentinel,
        })?;

        let chunk: Vec<u8> = self.buffer.drain(..bytes).collect();

        let mut remaining = bytes;
        while remaining > 0 {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            let available = front.bytes - front.consumed;
            if available <= remaining {
                remaining -= available;
                self.fragments.pop_front();
            } else {
                front.consumed += remaining;
                remaining = 0;
            }
        }

        Some((chunk, attribution))
    }
}

impl Default for InputAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta(bytes: usize, rtp: u32, sentinel: bool) -> FragmentMeta {
        FragmentMeta {
            bytes,
            consumed: 0,
            received_time: Instant::now(),
            rtp_timestamp: Some(rtp),
            ssrcs: vec![7],
            is_sentinel: sentinel,
        }
    }

    #[test]
    fn pop_attributes_first_contributing_fragment() {
        let mut acc = InputAccumulator::new();
        acc.push(&[1u8; 8], meta(8, 100, false));
        acc.push(&[2u8; 8], meta(8, 102, true));

        let (chunk, attribution) = acc.pop_chunk(12, 4).expect("enough bytes");
        assert_eq!(12, chunk.len());
        assert_eq!(Some(100), attribution.rtp_timestamp);
        assert!(!attribution.is_sentinel);

        // Second fragment is now partially consumed; its attributed RTP
        // timestamp advances by one 4-byte frame.
        let (_, attribution) = acc.pop_chunk(4, 4).expect("enough bytes");
        assert_eq!(Some(103), attribution.rtp_timestamp);
        assert!(attribution.is_sentinel);
        assert!(acc.is_empty());
    }

    #[test]
    fn pop_requires_enough_bytes() {
        let mut acc = InputAccumulator::new();
        acc.push(&[0u8; 4], meta(4, 0, false));
        assert!(acc.pop_chunk(8, 4).is_none());
        assert_eq!(4, acc.len());
    }

    #[test]
    fn reset_clears_everything() {
        let mut acc = InputAccumulator::new();
        acc.push(&[0u8; 16], meta(16, 0, false));
        acc.reset();
        assert!(acc.is_empty());
        assert!(acc.pop_chunk(1, 1).is_none());
    }
}
