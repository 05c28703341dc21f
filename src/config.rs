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
    error::{PcmRouteError, PcmRouteResult},
    formats::{AudioFormat, MilliSeconds, Seconds},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "PCMROUTE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "pcmroute".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
        }
    }
}

/// One network listener producing tagged packets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Logical source name; the sender address is appended to form the
    /// source tag.
    pub name: String,
    pub protocol: WireProtocol,
    pub bind_address: IpAddr,
    pub port: u16,
    /// Multicast group to join, if any.
    #[serde(default)]
    pub multicast_group: Option<IpAddr>,
    /// Frame geometry for RTP streams (Scream carries its own header).
    #[serde(default)]
    pub rtp_format: Option<AudioFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WireProtocol {
    Scream,
    Rtp,
}

/// Static registration of a processor target.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorConfig {
    pub instance_id: String,
    /// Exact source tag, or a prefix ending in `*`.
    pub filter_tag: String,
    #[serde(default)]
    pub delay_ms: i64,
    #[serde(default)]
    pub timeshift_sec: f64,
}

/// Output geometry shared by all processors; chunks are always 32-bit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub sample_rate: usize,
    pub channels: usize,
    /// Frames per processed output chunk.
    pub chunk_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            chunk_frames: 240,
        }
    }
}

impl OutputConfig {
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: 32,
        }
    }
}

/// Tuning knobs for the timing and dispatch engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingConfig {
    /// Baseline adaptive playout latency.
    pub target_buffer_level_ms: MilliSeconds,
    /// Upper clamp on desired latency, if set.
    pub max_adaptive_delay_ms: Option<MilliSeconds>,
    /// Drop threshold when the rate controller is saturated.
    pub max_catchup_lag_ms: MilliSeconds,
    /// Lateness counted as "late" in statistics.
    pub late_packet_threshold_ms: MilliSeconds,
    /// RTP-delta magnitude that makes a session reset suspect.
    pub rtp_session_reset_threshold_seconds: Seconds,
    /// Wallclock-justified tolerance that suppresses a suspected reset.
    pub rtp_continuity_slack_seconds: Seconds,
    pub min_playback_rate: f64,
    pub max_playback_rate: f64,
    /// Hard ceiling no configuration may exceed.
    pub absolute_max_playback_rate: f64,
    pub playback_ratio_kp: f64,
    pub playback_ratio_ki: f64,
    pub playback_ratio_slew_ppm_per_sec: f64,
    pub playback_ratio_max_deviation_ppm: f64,
    pub playback_ratio_integral_limit_ppm: f64,
    /// Exponential smoothing applied to the target rate (0 < α ≤ 1).
    pub playback_ratio_smoothing: f64,
    pub cleanup_interval_ms: u64,
    pub loop_max_sleep_ms: u64,
    /// Upper cap on per-processor ring fill.
    pub max_processor_queue_packets: usize,
    /// RFC-3550 jitter recurrence denominator.
    pub jitter_smoothing_factor: f64,
    /// Maximum age of packets in the global timeshift buffer.
    #[serde(with = "serde_millis")]
    pub max_buffer_duration: Duration,
    /// Capacity of the optional inbound decoupling queue.
    pub inbound_queue_packets: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            target_buffer_level_ms: 50.0,
            max_adaptive_delay_ms: None,
            max_catchup_lag_ms: 300.0,
            late_packet_threshold_ms: 20.0,
            rtp_session_reset_threshold_seconds: 0.2,
            rtp_continuity_slack_seconds: 0.25,
            min_playback_rate: 0.5,
            max_playback_rate: 2.0,
            absolute_max_playback_rate: 4.0,
            playback_ratio_kp: 25.0,
            playback_ratio_ki: 5.0,
            playback_ratio_slew_ppm_per_sec: 500.0,
            playback_ratio_max_deviation_ppm: 5_000.0,
            playback_ratio_integral_limit_ppm: 2_000.0,
            playback_ratio_smoothing: 0.1,
            cleanup_interval_ms: 1_000,
            loop_max_sleep_ms: 20,
            max_processor_queue_packets: 64,
            jitter_smoothing_factor: 16.0,
            max_buffer_duration: Duration::from_secs(30),
            inbound_queue_packets: 512,
        }
    }
}

impl TimingConfig {
    pub fn validated(self) -> PcmRouteResult<Self> {
        if self.min_playback_rate <= 0.0 || self.min_playback_rate > self.max_playback_rate {
            return Err(PcmRouteError::InvalidConfig(format!(
                "playback rate bounds out of order: [{}, {}]",
                self.min_playback_rate, self.max_playback_rate
            )));
        }
        if self.max_playback_rate > self.absolute_max_playback_rate {
            return Err(PcmRouteError::InvalidConfig(format!(
                "maxPlaybackRate {} exceeds absoluteMaxPlaybackRate {}",
                self.max_playback_rate, self.absolute_max_playback_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.playback_ratio_smoothing)
            || self.playback_ratio_smoothing == 0.0
        {
            return Err(PcmRouteError::InvalidConfig(format!(
                "playbackRatioSmoothing must be in (0, 1], got {}",
                self.playback_ratio_smoothing
            )));
        }
        if self.jitter_smoothing_factor < 1.0 {
            return Err(PcmRouteError::InvalidConfig(format!(
                "jitterSmoothingFactor must be >= 1, got {}",
                self.jitter_smoothing_factor
            )));
        }
        Ok(self)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn loop_max_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_max_sleep_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Interval between stats log lines; 0 disables.
    #[serde(default = "default_stats_interval", with = "serde_millis")]
    pub stats_interval: Duration,
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: Default::default(),
            listeners: vec![ListenerConfig {
                name: "default".to_owned(),
                protocol: WireProtocol::Scream,
                bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 4010,
                multicast_group: None,
                rtp_format: None,
            }],
            processors: Vec::new(),
            output: OutputConfig::default(),
            timing: TimingConfig::default(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Config {
    #[instrument]
    pub async fn load() -> PcmRouteResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref()).await?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> PcmRouteResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/pcmroute/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_timing_config_is_valid() {
        assert!(TimingConfig::default().validated().is_ok());
    }

    #[test]
    fn rejects_inverted_rate_bounds() {
        let timing = TimingConfig {
            min_playback_rate: 2.0,
            max_playback_rate: 0.5,
            ..Default::default()
        };
        assert!(timing.validated().is_err());
    }

    #[test]
    fn config_roundtrips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).expect("serialization failed");
        let parsed: Config = serde_yaml::from_str(&yaml).expect("deserialization failed");
        assert_eq!(config.app.name, parsed.app.name);
        assert_eq!(
            config.timing.target_buffer_level_ms,
            parsed.timing.target_buffer_level_ms
        );
    }
}
