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

use crate::error::PcmRouteError;
use serde::{Deserialize, Serialize};

pub type Seconds = f64;
pub type MilliSeconds = f64;
pub type FramesPerSecond = usize;
pub type Ppm = f64;

pub const MIN_CHANNELS: usize = 1;
pub const MAX_CHANNELS: usize = 8;

/// Geometry of an interleaved integer PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: FramesPerSecond,
    pub channels: usize,
    pub bit_depth: usize,
}

impl AudioFormat {
    pub fn validated(self) -> Result<Self, PcmRouteError> {
        if self.sample_rate == 0 {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&self.channels) {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "channel count out of range: {}",
                self.channels
            )));
        }
        if !matches!(self.bit_depth, 8 | 16 | 24 | 32) {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "unsupported bit depth: {}",
                self.bit_depth
            )));
        }
        Ok(self)
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bit_depth / 8
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels * self.bytes_per_sample()
    }

    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_frame()
    }

    pub fn frames_to_millis(&self, frames: usize) -> MilliSeconds {
        frames as f64 * 1_000.0 / self.sample_rate as f64
    }

    pub fn millis_to_frames(&self, millis: MilliSeconds) -> usize {
        f64::ceil(millis * self.sample_rate as f64 / 1_000.0) as usize
    }
}

/// Reads one interleaved little-endian PCM sample into a sign-extended
/// `i32`, scaled to full 32-bit range so downstream DSP is
/// depth-agnostic. Big-endian wire formats are normalized by their
/// decoders before reaching a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleReader {
    U8,
    S16Le,
    S24Le,
    S32Le,
}

impl SampleReader {
    pub fn for_scream(bit_depth: usize) -> Result<Self, PcmRouteError> {
        match bit_depth {
            8 => Ok(SampleReader::U8),
            16 => Ok(SampleReader::S16Le),
            24 => Ok(SampleReader::S24Le),
            32 => Ok(SampleReader::S32Le),
            other => Err(PcmRouteError::UnsupportedFormat(format!(
                "unsupported bit depth: {other}"
            ))),
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleReader::U8 => 1,
            SampleReader::S16Le => 2,
            SampleReader::S24Le => 3,
            SampleReader::S32Le => 4,
        }
    }

    pub fn read_sample(&self, bytes: &[u8]) -> i32 {
        match self {
            SampleReader::U8 => (bytes[0] as i32 - 128) << 24,
            SampleReader::S16Le => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
            SampleReader::S24Le => sign_extend_24(bytes[2], bytes[1], bytes[0]) << 8,
            SampleReader::S32Le => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

fn sign_extend_24(hi: u8, mid: u8, lo: u8) -> i32 {
    let mut value = ((hi as i32) << 16) | ((mid as i32) << 8) | (lo as i32);
    if value & 0x800000 != 0 {
        value |= !0xFFFFFF;
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_math_works() {
        let fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        assert_eq!(4, fmt.bytes_per_frame());
        assert_eq!(480, fmt.frames_in(1920));
        assert_eq!(10.0, fmt.frames_to_millis(480));
        assert_eq!(480, fmt.millis_to_frames(10.0));
    }

    #[test]
    fn rejects_out_of_range_formats() {
        let fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 9,
            bit_depth: 16,
        };
        assert!(fmt.validated().is_err());
        let fmt = AudioFormat {
            sample_rate: 0,
            channels: 2,
            bit_depth: 16,
        };
        assert!(fmt.validated().is_err());
        let fmt = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bit_depth: 20,
        };
        assert!(fmt.validated().is_err());
    }

    #[test]
    fn sample_readers_sign_extend() {
        assert_eq!(i32::MIN, SampleReader::S16Le.read_sample(&[0x00, 0x80]));
        assert_eq!(-65_536, SampleReader::S16Le.read_sample(&[0xFF, 0xFF]));
        assert_eq!(-256, SampleReader::S24Le.read_sample(&[0xFF, 0xFF, 0xFF]));
        assert_eq!(0x0302_0100, SampleReader::S24Le.read_sample(&[0x01, 0x02, 0x03]));
        assert_eq!(0, SampleReader::U8.read_sample(&[128]));
    }
}
