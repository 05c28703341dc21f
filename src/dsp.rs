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

//! The DSP seam between the input processor and the actual kernel.
//!
//! [`SourceInputProcessor`](crate::source::SourceInputProcessor) only talks
//! to the narrow [`DspProcessor`] trait; [`PcmDspChain`] is the built-in
//! implementation covering bit-depth normalization, speaker-layout channel
//! remapping, volume, a fixed-band peaking EQ and a linear resampler driven
//! by the playback ratio.

use crate::{
    error::{PcmRouteError, PcmRouteResult},
    formats::{AudioFormat, SampleReader},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const EQ_BANDS: usize = 8;
pub const EQ_BAND_FREQUENCIES: [f64; EQ_BANDS] = [
    63.0, 125.0, 250.0, 500.0, 1_000.0, 2_000.0, 4_000.0, 8_000.0,
];
const EQ_BAND_Q: f64 = 1.0;

/// Mixing matrix applied when input and output channel counts differ.
/// Rows are output channels, columns input channels.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerLayout {
    pub matrix: Vec<Vec<f32>>,
}

impl SpeakerLayout {
    /// Identity where possible; mono is fanned out, surplus inputs are
    /// folded into the last output channel.
    pub fn default_for(input_channels: usize, output_channels: usize) -> Self {
        let mut matrix = vec![vec![0.0f32; input_channels]; output_channels];
        if input_channels == 1 {
            for row in matrix.iter_mut() {
                row[0] = 1.0;
            }
        } else {
            for (out_ch, row) in matrix.iter_mut().enumerate() {
                if out_ch < input_channels {
                    row[out_ch] = 1.0;
                }
            }
            if output_channels < input_channels {
                let fold = 1.0 / (input_channels - output_channels + 1) as f32;
                let last = output_channels - 1;
                for in_ch in output_channels - 1..input_channels {
                    matrix[last][in_ch] = fold;
                }
            }
        }
        Self { matrix }
    }
}

/// Map from input channel count to the layout used for it.
pub type SpeakerLayoutMap = HashMap<usize, SpeakerLayout>;

/// What the input processor needs from the DSP kernel. Implementations
/// are owned by a single processor and accessed under its config lock.
pub trait DspProcessor: Send {
    /// Processes one frame-aligned input chunk, appending interleaved
    /// 32-bit samples at the output geometry. Returns the number of
    /// samples written.
    fn process_chunk(&mut self, input: &[u8], output: &mut Vec<i32>) -> PcmRouteResult<usize>;
    fn set_playback_ratio(&mut self, ratio: f64);
    fn set_volume(&mut self, volume: f32);
    fn set_eq_gains(&mut self, gains: &[f32]) -> PcmRouteResult<()>;
    fn set_eq_normalization(&mut self, enabled: bool);
    fn set_volume_normalization(&mut self, enabled: bool);
    fn set_speaker_layout(&mut self, layout: SpeakerLayout);
}

/// Peaking biquad, direct form II transposed, one state pair per channel.
#[derive(Clone)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: Vec<f64>,
    z2: Vec<f64>,
}

impl Biquad {
    fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64, channels: usize) -> Self {
        let a = 10f64.powf(gain_db / 40.0);
        let omega = 2.0 * std::f64::consts::PI * freq / sample_rate;
        let alpha = omega.sin() / (2.0 * q);
        let cos_omega = omega.cos();

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: vec![0.0; channels],
            z2: vec![0.0; channels],
        }
    }

    #[inline]
    fn process(&mut self, input: f64, channel: usize) -> f64 {
        let output = self.b0 * input + self.z1[channel];
        self.z1[channel] = self.b1 * input - self.a1 * output + self.z2[channel];
        self.z2[channel] = self.b2 * input - self.a2 * output;
        output
    }
}

pub struct PcmDspChain {
    input: AudioFormat,
    output: AudioFormat,
    reader: SampleReader,
    layout: SpeakerLayout,
    volume: f32,
    eq_gains_db: [f32; EQ_BANDS],
    eq: Vec<Biquad>,
    eq_active: bool,
    eq_normalization: bool,
    volume_normalization: bool,
    /// Decaying peak estimate for volume normalization, in full-scale units.
    peak_estimate: f64,
    ratio: f64,
    /// Fractional read position into `staging`, in input frames.
    pos: f64,
    /// Remapped input frames awaiting resampling (interleaved, output
    /// channel count).
    staging: Vec<i32>,
}

impl PcmDspChain {
    pub fn new(
        input: AudioFormat,
        output: AudioFormat,
        reader: SampleReader,
    ) -> PcmRouteResult<Self> {
        let input = input.validated()?;
        let output = output.validated()?;
        if reader.bytes_per_sample() != input.bytes_per_sample() {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "sample reader width {} does not match bit depth {}",
                reader.bytes_per_sample() * 8,
                input.bit_depth
            )));
        }
        Ok(Self {
            layout: SpeakerLayout::default_for(input.channels, output.channels),
            input,
            output,
            reader,
            volume: 1.0,
            eq_gains_db: [0.0; EQ_BANDS],
            eq: Vec::new(),
            eq_active: false,
            eq_normalization: false,
            volume_normalization: false,
            peak_estimate: 0.0,
            ratio: 1.0,
            pos: 0.0,
            staging: Vec::new(),
        })
    }

    fn rebuild_eq(&mut self) {
        self.eq_active = self.eq_gains_db.iter().any(|g| g.abs() > 0.01);
        if !self.eq_active {
            self.eq.clear();
            return;
        }
        let norm = if self.eq_normalization {
            let max_gain = self
                .eq_gains_db
                .iter()
                .copied()
                .fold(0.0f32, f32::max);
            -max_gain as f64
        } else {
            0.0
        };
        self.eq = EQ_BAND_FREQUENCIES
            .iter()
            .zip(self.eq_gains_db.iter())
            .map(|(freq, gain)| {
                Biquad::peaking(
                    *freq,
                    EQ_BAND_Q,
                    *gain as f64 + norm,
                    self.output.sample_rate as f64,
                    self.output.channels,
                )
            })
            .collect();
    }

    /// Decodes, remaps and gains one input chunk into `staging`.
    fn stage_input(&mut self, input: &[u8]) {
        let in_channels = self.input.channels;
        let out_channels = self.output.channels;
        let bytes_per_sample = self.input.bytes_per_sample();
        let frames = input.len() / self.input.bytes_per_frame();

        let mut decoded = vec![0i32; in_channels];
        for frame in 0..frames {
            let frame_base = frame * self.input.bytes_per_frame();
            for (ch, value) in decoded.iter_mut().enumerate() {
                let start = frame_base + ch * bytes_per_sample;
                *value = self
                    .reader
                    .read_sample(&input[start..start + bytes_per_sample]);
            }
            for out_ch in 0..out_channels {
                let row = &self.layout.matrix[out_ch];
                let mut acc = 0f64;
                for (in_ch, sample) in decoded.iter().enumerate() {
                    let weight = row.get(in_ch).copied().unwrap_or(0.0);
                    acc += *sample as f64 * weight as f64;
                }
                acc *= self.volume as f64;
                if self.eq_active {
                    for band in self.eq.iter_mut() {
                        acc = band.process(acc, out_ch);
                    }
                }
                if self.volume_normalization {
                    acc = self.normalize(acc);
                }
                self.staging
                    .push(acc.clamp(i32::MIN as f64, i32::MAX as f64) as i32);
            }
        }
    }

    /// Attenuates toward full scale based on a decaying peak estimate.
    /// Only ever reduces gain.
    fn normalize(&mut self, sample: f64) -> f64 {
        const DECAY: f64 = 0.9999;
        const HEADROOM: f64 = 0.95;
        self.peak_estimate = (self.peak_estimate * DECAY).max(sample.abs());
        let limit = HEADROOM * i32::MAX as f64;
        if self.peak_estimate > limit {
            sample * (limit / self.peak_estimate)
        } else {
            sample
        }
    }

    /// Linearly interpolates output frames out of `staging`, advancing by
    /// one input frame per `effective_ratio` output frames.
    fn resample(&mut self, output: &mut Vec<i32>) -> usize {
        let channels = self.output.channels;
        let rate_ratio = self.output.sample_rate as f64 / self.input.sample_rate as f64;
        let effective_ratio = rate_ratio * self.ratio;
        let staged_frames = self.staging.len() / channels;

        if (effective_ratio - 1.0).abs() < 1e-9 {
            let written = self.staging.len();
            output.append(&mut self.staging);
            self.pos = 0.0;
            return written;
        }

        let step = 1.0 / effective_ratio;
        let mut written = 0;
        while self.pos + 1.0 < staged_frames as f64 {
            let base = self.pos.floor() as usize;
            let frac = self.pos - base as f64;
            for ch in 0..channels {
                let a = self.staging[base * channels + ch] as f64;
                let b = self.staging[(base + 1) * channels + ch] as f64;
                let sample = a + frac * (b - a);
                output.push(sample.clamp(i32::MIN as f64, i32::MAX as f64) as i32);
            }
            written += channels;
            self.pos += step;
        }

        // Keep the unconsumed tail (plus one frame of interpolation
        // context) for the next chunk.
        let consumed = self.pos.floor() as usize;
        if consumed > 0 {
            self.staging.drain(..consumed * channels);
            self.pos -= consumed as f64;
        }
        written
    }
}

impl DspProcessor for PcmDspChain {
    fn process_chunk(&mut self, input: &[u8], output: &mut Vec<i32>) -> PcmRouteResult<usize> {
        if input.len() % self.input.bytes_per_frame() != 0 {
            return Err(PcmRouteError::UnsupportedFormat(format!(
                "payload of {} bytes is not aligned to {}-byte frames",
                input.len(),
                self.input.bytes_per_frame()
            )));
        }
        self.stage_input(input);
        Ok(self.resample(output))
    }

    fn set_playback_ratio(&mut self, ratio: f64) {
        self.ratio = ratio;
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.max(0.0);
    }

    fn set_eq_gains(&mut self, gains: &[f32]) -> PcmRouteResult<()> {
        if gains.len() != EQ_BANDS {
            return Err(PcmRouteError::InvalidConfig(format!(
                "expected {EQ_BANDS} EQ bands, got {}",
                gains.len()
            )));
        }
        self.eq_gains_db.copy_from_slice(gains);
        self.rebuild_eq();
        Ok(())
    }

    fn set_eq_normalization(&mut self, enabled: bool) {
        self.eq_normalization = enabled;
        self.rebuild_eq();
    }

    fn set_volume_normalization(&mut self, enabled: bool) {
        self.volume_normalization = enabled;
        if !enabled {
            self.peak_estimate = 0.0;
        }
    }

    fn set_speaker_layout(&mut self, layout: SpeakerLayout) {
        if layout.matrix.len() == self.output.channels
            && layout
                .matrix
                .iter()
                .all(|row| row.len() == self.input.channels)
        {
            self.layout = layout;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fmt(sample_rate: usize, channels: usize, bit_depth: usize) -> AudioFormat {
        AudioFormat {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    fn stereo_16_chain() -> PcmDspChain {
        PcmDspChain::new(
            fmt(48_000, 2, 16),
            fmt(48_000, 2, 32),
            SampleReader::S16Le,
        )
        .expect("valid formats")
    }

    #[test]
    fn identity_chain_preserves_frame_count() {
        let mut chain = stereo_16_chain();
        let input: Vec<u8> = (0..480u16 * 2)
            .flat_map(|i| (i as i16).to_le_bytes())
            .collect();
        let mut output = Vec::new();
        let written = chain
            .process_chunk(&input, &mut output)
            .expect("aligned input");
        assert_eq!(480 * 2, written);
        // 16-bit samples land in the upper half of the 32-bit range.
        assert_eq!(1 << 16, output[1]);
    }

    #[test]
    fn half_rate_ratio_halves_output() {
        let mut chain = stereo_16_chain();
        chain.set_playback_ratio(0.5);
        let input = vec![0u8; 480 * 4];
        let mut output = Vec::new();
        let written = chain
            .process_chunk(&input, &mut output)
            .expect("aligned input");
        let frames = written / 2;
        assert!(
            (238..=240).contains(&frames),
            "expected about 240 frames, got {frames}"
        );
    }

    #[test]
    fn mono_input_fans_out_to_stereo() {
        let mut chain = PcmDspChain::new(
            fmt(48_000, 1, 16),
            fmt(48_000, 2, 32),
            SampleReader::S16Le,
        )
        .expect("valid formats");
        let input: Vec<u8> = 1000i16.to_le_bytes().repeat(16);
        let mut output = Vec::new();
        chain.process_chunk(&input, &mut output).expect("aligned");
        assert_eq!(32, output.len());
        assert_eq!(output[0], output[1]);
    }

    #[test]
    fn rejects_misaligned_payload() {
        let mut chain = stereo_16_chain();
        let mut output = Vec::new();
        assert!(chain.process_chunk(&[0u8; 3], &mut output).is_err());
    }

    #[test]
    fn rejects_wrong_eq_band_count() {
        let mut chain = stereo_16_chain();
        assert!(chain.set_eq_gains(&[0.0; 3]).is_err());
        assert!(chain.set_eq_gains(&[0.0; EQ_BANDS]).is_ok());
    }

    #[test]
    fn volume_scales_samples() {
        let mut chain = stereo_16_chain();
        chain.set_volume(0.5);
        let input: Vec<u8> = 16_000i16.to_le_bytes().repeat(8);
        let mut output = Vec::new();
        chain.process_chunk(&input, &mut output).expect("aligned");
        assert_eq!(8_000 << 16, output[0]);
    }
}
