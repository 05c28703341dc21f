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

//! RTP ingress. Frame geometry comes from the listener configuration
//! (standard L16/L24 payloads carry no format of their own); the
//! big-endian payload is normalized to little-endian PCM so everything
//! downstream speaks one byte order.

use crate::{
    error::{PcmRouteError, PcmRouteResult, WrappedRtpError},
    formats::AudioFormat,
    packet::TaggedAudioPacket,
};
use rtp_rs::RtpReader;
use std::{net::SocketAddr, time::Instant};

pub struct RtpDecoder {
    source_name: String,
    format: AudioFormat,
}

impl RtpDecoder {
    pub fn new(source_name: impl Into<String>, format: AudioFormat) -> PcmRouteResult<Self> {
        let format = format.validated()?;
        if !matches!(format.bit_depth, 16 | 24) {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "RTP linear PCM must be 16 or 24 bit, got {}",
                format.bit_depth
            )));
        }
        Ok(Self {
            source_name: source_name.into(),
            format,
        })
    }

    pub fn decode(
        &self,
        data: &[u8],
        sender: SocketAddr,
        received_time: Instant,
    ) -> PcmRouteResult<TaggedAudioPacket> {
        let rtp = RtpReader::new(data).map_err(WrappedRtpError)?;
        let payload = rtp.payload();

        let bytes_per_frame = self.format.bytes_per_frame();
        if payload.is_empty() || payload.len() % bytes_per_frame != 0 {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "RTP payload of {} bytes is not aligned to {bytes_per_frame}-byte frames",
                payload.len()
            )));
        }

        Ok(TaggedAudioPacket {
            source_tag: format!("{}#{sender}", self.source_name),
            audio_data: byteswap_to_le(payload, self.format.bytes_per_sample()).into(),
            format: self.format,
            rtp_timestamp: Some(rtp.timestamp()),
            received_time,
            ssrcs: vec![rtp.ssrc()],
            is_sentinel: false,
            playback_rate: 1.0,
        })
    }
}

/// Reverses the byte order of every sample in the payload.
fn byteswap_to_le(payload: &[u8], bytes_per_sample: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for sample in payload.chunks_exact(bytes_per_sample) {
        out.extend(sample.iter().rev());
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use rtp_rs::{RtpPacketBuilder, Seq};

    fn sender() -> SocketAddr {
        "192.0.2.7:5004".parse().expect("valid address")
    }

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        }
    }

    fn rtp_datagram(timestamp: u32, payload: &[u8]) -> Vec<u8> {
        RtpPacketBuilder::new()
            .payload_type(127)
            .ssrc(0xDEAD_BEEF)
            .sequence(Seq::from(7))
            .timestamp(timestamp)
            .payload(payload)
            .build()
            .expect("valid RTP packet")
    }

    #[test]
    fn decodes_and_swaps_to_little_endian() {
        let decoder = RtpDecoder::new("studio", format()).expect("valid format");
        // One stereo frame: L = 0x0102, R = 0x0304 in network byte order.
        let datagram = rtp_datagram(9_600, &[0x01, 0x02, 0x03, 0x04]);
        let packet = decoder
            .decode(&datagram, sender(), Instant::now())
            .expect("valid packet");
        assert_eq!(Some(9_600), packet.rtp_timestamp);
        assert_eq!(vec![0xDEAD_BEEF], packet.ssrcs);
        assert_eq!(&[0x02, 0x01, 0x04, 0x03], packet.audio_data.as_ref());
        assert_eq!("studio#192.0.2.7:5004", packet.source_tag);
    }

    #[test]
    fn rejects_misaligned_payload() {
        let decoder = RtpDecoder::new("studio", format()).expect("valid format");
        let datagram = rtp_datagram(0, &[0x01, 0x02, 0x03]);
        assert!(decoder.decode(&datagram, sender(), Instant::now()).is_err());
    }

    #[test]
    fn rejects_malformed_rtp() {
        let decoder = RtpDecoder::new("studio", format()).expect("valid format");
        assert!(decoder.decode(&[0u8; 4], sender(), Instant::now()).is_err());
    }

    #[test]
    fn rejects_unsupported_bit_depth() {
        let mut format = format();
        format.bit_depth = 32;
        assert!(RtpDecoder::new("studio", format).is_err());
    }
}
