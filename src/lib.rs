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

//! Routing engine for live PCM audio streams.
//!
//! Many unsynchronized network sources feed one bounded timeshift buffer;
//! per-stream Kalman clock models and a PI playback-rate controller turn
//! jittery, skewed arrivals into smooth, rate-corrected dispatch toward
//! per-source processors and their sink rings.

pub mod config;
pub mod dsp;
pub mod error;
pub mod formats;
pub mod monitoring;
pub mod net;
pub mod packet;
pub mod ring;
pub mod socket;
pub mod source;
pub mod telemetry;
pub mod time;
pub mod timeshift;
pub mod utils;

pub use config::{Config, TimingConfig};
pub use error::{PcmRouteError, PcmRouteResult};
pub use packet::{ProcessedAudioChunk, TaggedAudioPacket};
pub use source::SourceInputProcessor;
pub use time::StreamClock;
pub use timeshift::{IngestQueue, TimeshiftManager};
