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

//! Scream wire format: a 5-byte header in front of interleaved
//! little-endian PCM. Byte 0 encodes the sample rate (bit 7 selects the
//! 44.1 kHz base, bits 0–6 the multiplier), byte 1 the bit depth, byte 2
//! the channel count, bytes 3–4 the channel-layout mask. The format has
//! no timestamps, so the decoder keeps a per-sender frame counter as the
//! RTP-timestamp equivalent.

use crate::{
    error::{PcmRouteError, PcmRouteResult},
    formats::AudioFormat,
    packet::TaggedAudioPacket,
};
use std::{collections::HashMap, net::SocketAddr, time::Instant};

pub const SCREAM_HEADER_LEN: usize = 5;

pub struct ScreamDecoder {
    source_name: String,
    frame_counters: HashMap<SocketAddr, u32>,
}

impl ScreamDecoder {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            frame_counters: HashMap::new(),
        }
    }

    pub fn decode(
        &mut self,
        data: &[u8],
        sender: SocketAddr,
        received_time: Instant,
    ) -> PcmRouteResult<TaggedAudioPacket> {
        if data.len() <= SCREAM_HEADER_LEN {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "datagram of {} bytes is too short for a Scream header",
                data.len()
            )));
        }

        let rate_code = data[0];
        let base = if rate_code & 0x80 != 0 { 44_100 } else { 48_000 };
        let multiplier = (rate_code & 0x7F) as usize;
        if multiplier == 0 {
            return Err(PcmRouteError::UnsupportedFormat(
                "sample rate multiplier of zero".to_owned(),
            ));
        }

        let format = AudioFormat {
            sample_rate: base * multiplier,
            channels: data[2] as usize,
            bit_depth: data[1] as usize,
        }
        .validated()?;

        let payload = &data[SCREAM_HEADER_LEN..];
        if payload.len() % format.bytes_per_frame() != 0 {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "payload of {} bytes is not aligned to {}-byte frames",
                payload.len(),
                format.bytes_per_frame()
            )));
        }
        let frames = format.frames_in(payload.len());

        let counter = self.frame_counters.entry(sender).or_insert(0);
        let rtp_timestamp = *counter;
        *counter = counter.wrapping_add(frames as u32);

        Ok(TaggedAudioPacket {
            source_tag: format!("{}#{sender}", self.source_name),
            audio_data: payload.to_vec().into(),
            format,
            rtp_timestamp: Some(rtp_timestamp),
            received_time,
            ssrcs: Vec::new(),
            is_sentinel: false,
            playback_rate: 1.0,
        })
    }
}
