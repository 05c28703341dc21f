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

//! Per-source pull side of the pipeline.
//!
//! A [`SourceInputProcessor`] accumulates variable-sized inbound packets
//! into frame-aligned windows, pushes them through the DSP chain (whose
//! resampling ratio is `output_rate / input_rate × playback_rate`) and
//! emits fixed-size processed chunks with dilation-corrected origin
//! timestamps. Ingest is driven synchronously by whichever thread pulls
//! from the processor's ring; the processor owns no thread itself.

pub mod accumulator;

use crate::{
    dsp::{DspProcessor, EQ_BANDS, PcmDspChain, SpeakerLayout, SpeakerLayoutMap},
    error::PcmRouteResult,
    formats::{AudioFormat, SampleReader},
    packet::{ProcessedAudioChunk, TaggedAudioPacket},
    source::accumulator::{FragmentMeta, InputAccumulator},
    utils::WarnRateLimiter,
};
use std::{
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

const WARN_INTERVAL: Duration = Duration::from_secs(5);
/// Rate changes below one ppm are not worth disturbing the resampler.
const PLAYBACK_RATE_EPSILON: f64 = 1e-6;
const MIN_RESAMPLE_RATIO: f64 = 0.1;
const MAX_RESAMPLE_RATIO: f64 = 10.0;
/// Extra input frames requested per chunk to cover resampler state.
const RESAMPLER_HEADROOM_FRAMES: usize = 8;

/// User-facing processing settings, reapplied on every reconfigure.
#[derive(Debug, Clone)]
struct DspSettings {
    volume: f32,
    eq_gains_db: [f32; EQ_BANDS],
    eq_normalization: bool,
    volume_normalization: bool,
    speaker_layout: SpeakerLayoutMap,
    delay_ms: i64,
    timeshift_sec: f64,
}

impl Default for DspSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            eq_gains_db: [0.0; EQ_BANDS],
            eq_normalization: false,
            volume_normalization: false,
            speaker_layout: SpeakerLayoutMap::new(),
            delay_ms: 0,
            timeshift_sec: 0.0,
        }
    }
}

struct Pipeline {
    settings: DspSettings,
    input_format: Option<AudioFormat>,
    input_bytes_per_frame: usize,
    target_chunk_bytes: usize,
    accumulator: InputAccumulator,
    dsp: Option<Box<dyn DspProcessor>>,
    process_buffer: Vec<i32>,
    process_buffer_peak: usize,
    pending_sentinel_samples: usize,
    /// SSRCs attributed to the most recent contributing fragment.
    pending_ssrcs: Vec<u32>,
    cumulative_dilation_ms: f64,
    playback_rate: f64,
    last_origin_time: Option<Instant>,
    reconfigurations: u64,
    discarded_packets: u64,
    warn_limiter: WarnRateLimiter,
}

pub struct SourceInputProcessor {
    instance_id: String,
    output_format: AudioFormat,
    /// Output chunk size in frames at the output rate.
    chunk_frames: usize,
    pipeline: Mutex<Pipeline>,
    stopped: AtomicBool,
}

impl SourceInputProcessor {
    pub fn new(
        instance_id: impl Into<String>,
        output_format: AudioFormat,
        chunk_frames: usize,
    ) -> PcmRouteResult<Self> {
        let output_format = output_format.validated()?;
        Ok(Self {
            instance_id: instance_id.into(),
            output_format,
            chunk_frames: chunk_frames.max(1),
            pipeline: Mutex::new(Pipeline {
                settings: DspSettings::default(),
                input_format: None,
                input_bytes_per_frame: 0,
                target_chunk_bytes: 0,
                accumulator: InputAccumulator::new(),
                dsp: None,
                process_buffer: Vec::new(),
                process_buffer_peak: 0,
                pending_sentinel_samples: 0,
                pending_ssrcs: Vec::new(),
                cumulative_dilation_ms: 0.0,
                playback_rate: 1.0,
                last_origin_time: None,
                reconfigurations: 0,
                discarded_packets: 0,
                warn_limiter: WarnRateLimiter::new(WARN_INTERVAL),
            }),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Converts one inbound packet into zero or more processed chunks
    /// appended to `out_chunks`.
    pub fn ingest_packet(
        &self,
        packet: &TaggedAudioPacket,
        out_chunks: &mut Vec<ProcessedAudioChunk>,
    ) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let mut pipeline = self.lock_pipeline();
        let p = &mut *pipeline;

        if packet.audio_data.is_empty() {
            warn_limited(p, "ignoring packet with empty payload");
            return;
        }

        if !self.ensure_configured(p, packet.format) {
            p.discarded_packets += 1;
            return;
        }

        if packet.audio_data.len() % p.input_bytes_per_frame != 0 {
            warn_limited(p, "payload not aligned to input frames, resetting accumulator");
            p.accumulator.reset();
            p.discarded_packets += 1;
            return;
        }

        self.apply_playback_rate(p, packet.playback_rate);

        p.accumulator.push(
            &packet.audio_data,
            FragmentMeta {
                bytes: packet.audio_data.len(),
                consumed: 0,
                received_time: packet.received_time,
                rtp_timestamp: packet.rtp_timestamp,
                ssrcs: packet.ssrcs.clone(),
                is_sentinel: packet.is_sentinel,
            },
        );

        self.process_accumulated(p);
        self.drain_chunks(p, out_chunks);
    }

    /// Rebuilds the DSP chain when the input geometry changes. Returns
    /// whether a usable chain exists.
    fn ensure_configured(&self, p: &mut Pipeline, format: AudioFormat) -> bool {
        let needs_reconfigure = p.input_format != Some(format) || p.dsp.is_none();
        if !needs_reconfigure {
            return true;
        }

        let reader = match SampleReader::for_scream(format.bit_depth) {
            Ok(reader) => reader,
            Err(e) => {
                warn_limited(p, &format!("unsupported input format: {e}"));
                p.dsp = None;
                return false;
            }
        };

        let mut chain = match PcmDspChain::new(format, self.output_format, reader) {
            Ok(chain) => chain,
            Err(e) => {
                warn_limited(p, &format!("could not construct DSP chain: {e}"));
                p.dsp = None;
                return false;
            }
        };

        let settings = &p.settings;
        chain.set_volume(settings.volume);
        if chain.set_eq_gains(&settings.eq_gains_db).is_err() {
            warn!("EQ band count mismatch while reconfiguring, keeping flat EQ");
        }
        chain.set_eq_normalization(settings.eq_normalization);
        chain.set_volume_normalization(settings.volume_normalization);
        let layout = settings
            .speaker_layout
            .get(&format.channels)
            .cloned()
            .unwrap_or_else(|| {
                SpeakerLayout::default_for(format.channels, self.output_format.channels)
            });
        chain.set_speaker_layout(layout);

        debug!(
            "Processor '{}' reconfigured for {}ch {} Hz {}-bit input",
            self.instance_id, format.channels, format.sample_rate, format.bit_depth
        );

        p.input_format = Some(format);
        p.input_bytes_per_frame = format.bytes_per_frame();
        p.accumulator.reset();
        p.pending_sentinel_samples = 0;
        p.pending_ssrcs.clear();
        p.dsp = Some(Box::new(chain));
        p.reconfigurations += 1;
        self.update_chunk_sizing(p);
        true
    }

    /// Clamps and applies the scheduler-chosen playback rate; changes
    /// below one ppm never reach the resampler.
    fn apply_playback_rate(&self, p: &mut Pipeline, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            warn_limited(p, &format!("ignoring invalid playback rate {rate}"));
            return;
        }
        let clamped = rate.clamp(0.5, 2.0);
        if (clamped - p.playback_rate).abs() <= PLAYBACK_RATE_EPSILON {
            return;
        }
        p.playback_rate = clamped;
        self.update_chunk_sizing(p);
        if let Some(dsp) = p.dsp.as_mut() {
            dsp.set_playback_ratio(clamped);
        }
    }

    /// Variable input sizing: how many input bytes one output chunk
    /// needs at the current resampling ratio.
    fn update_chunk_sizing(&self, p: &mut Pipeline) {
        let Some(input) = p.input_format else {
            return;
        };
        let ratio = (self.output_format.sample_rate as f64 / input.sample_rate as f64
            * p.playback_rate)
            .clamp(MIN_RESAMPLE_RATIO, MAX_RESAMPLE_RATIO);
        let required_input_frames =
            (self.chunk_frames as f64 / ratio).ceil() as usize + RESAMPLER_HEADROOM_FRAMES;
        p.target_chunk_bytes = required_input_frames * p.input_bytes_per_frame;
    }

    fn process_accumulated(&self, p: &mut Pipeline) {
        while p.target_chunk_bytes > 0 && p.accumulator.len() >= p.target_chunk_bytes {
            let Some((chunk, attribution)) = p
                .accumulator
                .pop_chunk(p.target_chunk_bytes, p.input_bytes_per_frame)
            else {
                break;
            };

            let Some(dsp) = p.dsp.as_mut() else {
                return;
            };

            // An allocation failure here clears the processed buffer
            // instead of tearing the stream down.
            let estimated = self.chunk_frames * self.output_format.channels * 2;
            if p.process_buffer.try_reserve(estimated).is_err() {
                warn!("Processed-sample buffer allocation failed, clearing");
                p.process_buffer.clear();
                continue;
            }

            match dsp.process_chunk(&chunk, &mut p.process_buffer) {
                Ok(written) => {
                    if attribution.is_sentinel {
                        p.pending_sentinel_samples += written;
                    }
                    p.last_origin_time = Some(attribution.received_time);
                    p.pending_ssrcs = attribution.ssrcs;
                    p.process_buffer_peak = p.process_buffer_peak.max(p.process_buffer.len());
                }
                Err(e) => {
                    warn_limited(p, &format!("DSP processing failed: {e}"));
                    p.accumulator.reset();
                    p.discarded_packets += 1;
                    return;
                }
            }
        }
    }

    /// Slices full output chunks off the processed buffer, applying the
    /// cumulative origin-time dilation.
    fn drain_chunks(&self, p: &mut Pipeline, out_chunks: &mut Vec<ProcessedAudioChunk>) {
        let required_samples = self.chunk_frames * self.output_format.channels;
        while p.process_buffer.len() >= required_samples {
            let audio_data: Vec<i32> = p.process_buffer.drain(..required_samples).collect();

            let chunk_ms =
                self.chunk_frames as f64 / self.output_format.sample_rate as f64 * 1_000.0;
            p.cumulative_dilation_ms += chunk_ms * (1.0 - 1.0 / p.playback_rate);

            let origin_base = p.last_origin_time.unwrap_or_else(Instant::now);
            let origin_time = shift_instant(origin_base, p.cumulative_dilation_ms);

            let is_sentinel = p.pending_sentinel_samples > 0;
            p.pending_sentinel_samples = p.pending_sentinel_samples.saturating_sub(required_samples);

            out_chunks.push(ProcessedAudioChunk {
                audio_data,
                ssrcs: p.pending_ssrcs.clone(),
                produced_time: Instant::now(),
                origin_time,
                playback_rate: p.playback_rate,
                is_sentinel,
            });
        }
    }

    // Control surface. Setters take the processor config mutex and
    // forward to the DSP chain if one is constructed.

    pub fn set_volume(&self, volume: f32) {
        let mut p = self.lock_pipeline();
        p.settings.volume = volume;
        if let Some(dsp) = p.dsp.as_mut() {
            dsp.set_volume(volume);
        }
    }

    pub fn set_eq_gains(&self, gains: &[f32]) -> PcmRouteResult<()> {
        let mut p = self.lock_pipeline();
        if gains.len() != EQ_BANDS {
            return Err(crate::error::PcmRouteError::InvalidConfig(format!(
                "expected {EQ_BANDS} EQ bands, got {}",
                gains.len()
            )));
        }
        p.settings.eq_gains_db.copy_from_slice(gains);
        if let Some(dsp) = p.dsp.as_mut() {
            dsp.set_eq_gains(gains)?;
        }
        Ok(())
    }

    pub fn set_eq_normalization(&self, enabled: bool) {
        let mut p = self.lock_pipeline();
        p.settings.eq_normalization = enabled;
        if let Some(dsp) = p.dsp.as_mut() {
            dsp.set_eq_normalization(enabled);
        }
    }

    pub fn set_volume_normalization(&self, enabled: bool) {
        let mut p = self.lock_pipeline();
        p.settings.volume_normalization = enabled;
        if let Some(dsp) = p.dsp.as_mut() {
            dsp.set_volume_normalization(enabled);
        }
    }

    pub fn set_delay_ms(&self, delay_ms: i64) {
        self.lock_pipeline().settings.delay_ms = delay_ms;
    }

    pub fn set_timeshift_sec(&self, timeshift_sec: f64) {
        self.lock_pipeline().settings.timeshift_sec = timeshift_sec;
    }

    pub fn set_speaker_layout(&self, input_channels: usize, layout: SpeakerLayout) {
        let mut p = self.lock_pipeline();
        p.settings.speaker_layout.insert(input_channels, layout.clone());
        if p.input_format.map(|f| f.channels) == Some(input_channels)
            && let Some(dsp) = p.dsp.as_mut()
        {
            dsp.set_speaker_layout(layout);
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.lock_pipeline().playback_rate
    }

    pub fn reconfigurations(&self) -> u64 {
        self.lock_pipeline().reconfigurations
    }

    pub fn delay_ms(&self) -> i64 {
        self.lock_pipeline().settings.delay_ms
    }

    pub fn timeshift_sec(&self) -> f64 {
        self.lock_pipeline().settings.timeshift_sec
    }

    /// Peak occupancy of the processed-sample buffer, in samples.
    pub fn process_buffer_peak(&self) -> usize {
        self.lock_pipeline().process_buffer_peak
    }

    pub fn discarded_packets(&self) -> u64 {
        self.lock_pipeline().discarded_packets
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, Pipeline> {
        match self.pipeline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn warn_limited(p: &mut Pipeline, message: &str) {
    if let Some(suppressed) = p.warn_limiter.check(Instant::now()) {
        if suppressed > 0 {
            warn!("{message} ({suppressed} similar warnings suppressed)");
        } else {
            warn!("{message}");
        }
    }
}

fn shift_instant(base: Instant, millis: f64) -> Instant {
    if millis >= 0.0 {
        base + Duration::from_secs_f64(millis / 1_000.0)
    } else {
        base.checked_sub(Duration::from_secs_f64(-millis / 1_000.0))
            .unwrap_or(base)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    const CHUNK_FRAMES: usize = 128;

    fn output_format() -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 32,
        }
    }

    fn processor() -> SourceInputProcessor {
        SourceInputProcessor::new("sip-test", output_format(), CHUNK_FRAMES)
            .expect("valid output format")
    }

    fn packet(frames: usize, rtp: u32, rate: f64, sentinel: bool) -> TaggedAudioPacket {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        let audio_data: Arc<[u8]> = vec![0u8; frames * format.bytes_per_frame()].into();
        TaggedAudioPacket {
            source_tag: "test#127.0.0.1:1".to_owned(),
            audio_data,
            format,
            rtp_timestamp: Some(rtp),
            received_time: Instant::now(),
            ssrcs: vec![1],
            is_sentinel: sentinel,
            playback_rate: rate,
        }
    }

    #[test]
    fn aligned_ingest_emits_full_chunks() {
        let sip = processor();
        let mut chunks = Vec::new();
        // 10 packets of 480 frames at unity rate: 4800 input frames where
        // each chunk needs 128 + 8. All complete chunks must come out.
        for i in 0..10 {
            sip.ingest_packet(&packet(480, i * 480, 1.0, false), &mut chunks);
        }
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert_eq!(CHUNK_FRAMES * 2, chunk.audio_data.len());
            assert_eq!(1.0, chunk.playback_rate);
        }
        // 4800 frames accumulate in windows of 136; at least 30 chunks of
        // 128 frames fit through.
        assert!(chunks.len() >= 30, "got {} chunks", chunks.len());
    }

    #[test]
    fn format_switch_reconfigures_once_and_keeps_running() {
        let sip = processor();
        let mut chunks = Vec::new();
        for i in 0..4 {
            sip.ingest_packet(&packet(480, i * 480, 1.0, false), &mut chunks);
        }
        assert_eq!(1, sip.reconfigurations());

        // Same stream switches to 24-bit 44.1 kHz mid-flight.
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bit_depth: 24,
        };
        let audio_data: Arc<[u8]> = vec![0u8; 441 * format.bytes_per_frame()].into();
        let switched = TaggedAudioPacket {
            format,
            audio_data,
            ..packet(0, 2_000, 1.0, false)
        };
        let before = chunks.len();
        for _ in 0..8 {
            sip.ingest_packet(&switched, &mut chunks);
        }
        assert_eq!(2, sip.reconfigurations());
        assert!(chunks.len() > before, "post-switch audio must still flow");
        assert_eq!(CHUNK_FRAMES * 2, chunks[chunks.len() - 1].audio_data.len());
    }

    #[test]
    fn playback_rate_epsilon_gates_propagation() {
        let sip = processor();
        let mut chunks = Vec::new();
        sip.ingest_packet(&packet(16, 0, 1.0, false), &mut chunks);
        assert_eq!(1.0, sip.playback_rate());

        // One ppm above unity stays put, two ppm propagates.
        sip.ingest_packet(&packet(16, 16, 1.0 + 1e-6, false), &mut chunks);
        assert_eq!(1.0, sip.playback_rate());
        sip.ingest_packet(&packet(16, 32, 1.0 + 2e-6, false), &mut chunks);
        assert!((sip.playback_rate() - (1.0 + 2e-6)).abs() < 1e-12);
    }

    #[test]
    fn invalid_playback_rates_are_rejected() {
        let sip = processor();
        let mut chunks = Vec::new();
        sip.ingest_packet(&packet(16, 0, f64::NAN, false), &mut chunks);
        assert_eq!(1.0, sip.playback_rate());
        sip.ingest_packet(&packet(16, 16, -1.0, false), &mut chunks);
        assert_eq!(1.0, sip.playback_rate());
        // Out-of-range rates clamp to the [0.5, 2.0] envelope.
        sip.ingest_packet(&packet(16, 32, 5.0, false), &mut chunks);
        assert_eq!(2.0, sip.playback_rate());
    }

    #[test]
    fn attributed_ssrcs_reach_output_chunks() {
        let sip = processor();
        let mut chunks = Vec::new();
        for i in 0..4 {
            let mut tagged = packet(480, i * 480, 1.0, false);
            tagged.ssrcs = vec![0xABCD_0001];
            sip.ingest_packet(&tagged, &mut chunks);
        }
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.ssrcs == vec![0xABCD_0001]));
    }

    #[test]
    fn sentinel_flag_propagates_to_chunks() {
        let sip = processor();
        let mut chunks = Vec::new();
        for i in 0..4 {
            sip.ingest_packet(&packet(480, i * 480, 1.0, true), &mut chunks);
        }
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.is_sentinel));
    }

    #[test]
    fn misaligned_payload_resets_accumulator() {
        let sip = processor();
        let mut chunks = Vec::new();
        sip.ingest_packet(&packet(32, 0, 1.0, false), &mut chunks);
        let mut bad = packet(32, 32, 1.0, false);
        bad.audio_data = vec![0u8; 33].into();
        sip.ingest_packet(&bad, &mut chunks);
        assert_eq!(1, sip.discarded_packets());
        assert!(chunks.is_empty());
    }

    #[test]
    fn empty_payload_is_ignored() {
        let sip = processor();
        let mut chunks = Vec::new();
        let mut empty = packet(0, 0, 1.0, false);
        empty.audio_data = Vec::new().into();
        sip.ingest_packet(&empty, &mut chunks);
        assert!(chunks.is_empty());
        assert_eq!(0, sip.discarded_packets());
    }

    #[test]
    fn stopped_processor_ignores_ingest() {
        let sip = processor();
        sip.stop();
        let mut chunks = Vec::new();
        sip.ingest_packet(&packet(480, 0, 1.0, false), &mut chunks);
        assert!(chunks.is_empty());
    }

    #[test]
    fn half_rate_needs_twice_the_input() {
        let sip = processor();
        let mut chunks = Vec::new();
        // At rate 0.5 one 128-frame output chunk needs 264 input frames;
        // a single 160-frame packet is not enough, two are.
        sip.ingest_packet(&packet(160, 0, 0.5, false), &mut chunks);
        assert!(chunks.is_empty());
        sip.ingest_packet(&packet(160, 160, 0.5, false), &mut chunks);
        assert!(!chunks.is_empty());
    }
}
