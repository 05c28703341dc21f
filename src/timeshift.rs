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

//! The global timeshift buffer and its dispatch scheduler.
//!
//! Producers append timestamped packets; a single scheduler thread walks
//! the registered processor targets, projects each pending packet through
//! its stream's clock model and releases it at the adaptively computed
//! playout deadline. Late packets are caught up or dropped, sessions that
//! restart their RTP counter are reanchored, and everything is bounded:
//! the buffer by wall-clock age, the sink rings by capacity.
//!
//! Lock hierarchy: global data mutex → registry target map → per-stream
//! lock. The per-stream lock map itself is sharded and never held across
//! other acquisitions.

pub mod rate;
pub mod registry;
pub mod state;

use crate::{
    config::TimingConfig,
    error::{PcmRouteError, PcmRouteResult},
    formats::{AudioFormat, MilliSeconds},
    monitoring::stats::{
        DeviationStats, GlobalStats, ProcessorStats, StatsSnapshot, StreamStats,
    },
    packet::TaggedAudioPacket,
    timeshift::{
        rate::update_playback_rate,
        registry::{ProcessorRegistry, RegistryCallback, RegistryEvent, SinkRing},
        state::{PacketContinuity, StreamStateMap, StreamTimingState, signed_millis},
    },
    utils::{WarnRateLimiter, set_realtime_priority},
};
use chrono::Utc;
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

const WARN_INTERVAL: Duration = Duration::from_secs(5);
/// EWMA weight for the per-iteration processing budget.
const PROCESSING_BUDGET_ALPHA: f64 = 0.2;

struct BufferState {
    packets: VecDeque<TaggedAudioPacket>,
    /// Bumped by every mutator; wakes and revalidates the scheduler.
    version: u64,
    last_cleanup: Instant,
}

struct Shared {
    tuning: TimingConfig,
    data: Mutex<BufferState>,
    wakeup: Condvar,
    streams: StreamStateMap,
    registry: ProcessorRegistry,
    stop: AtomicBool,
    total_packets_added: AtomicU64,
    ingest_warn: Mutex<WarnRateLimiter>,
    inbound: Mutex<Option<Arc<InboundCounters>>>,
}

impl Shared {
    fn lock_data(&self) -> MutexGuard<'_, BufferState> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bump_and_notify(&self, data: &mut BufferState) {
        data.version += 1;
        self.wakeup.notify_all();
    }
}

/// Metadata returned along a recent-buffer PCM export.
pub struct RecentBuffer {
    pub audio_data: Vec<u8>,
    pub format: AudioFormat,
    pub packets: usize,
    pub span: Duration,
}

pub struct TimeshiftManager {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl TimeshiftManager {
    /// Validates the tuning and starts the scheduler thread.
    pub fn start(tuning: TimingConfig) -> PcmRouteResult<Self> {
        let tuning = tuning.validated()?;
        let shared = Arc::new(Shared {
            tuning,
            data: Mutex::new(BufferState {
                packets: VecDeque::new(),
                version: 0,
                last_cleanup: Instant::now(),
            }),
            wakeup: Condvar::new(),
            streams: StreamStateMap::new(),
            registry: ProcessorRegistry::new(),
            stop: AtomicBool::new(false),
            total_packets_added: AtomicU64::new(0),
            ingest_warn: Mutex::new(WarnRateLimiter::new(WARN_INTERVAL)),
            inbound: Mutex::new(None),
        });

        let scheduler_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("timeshift-scheduler".to_owned())
            .spawn(move || run_scheduler(scheduler_shared))
            .map_err(|e| PcmRouteError::SchedulerStart(e.to_string()))?;

        Ok(Self {
            shared,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    /// Appends a packet to the global buffer and updates the stream's
    /// timing state. Packets without RTP timestamp or with a non-positive
    /// sample rate are dropped with a rate-limited warning.
    pub fn add_packet(&self, mut packet: TaggedAudioPacket) {
        let Some(rtp_ts) = packet.rtp_timestamp else {
            self.warn_rate_limited("dropping packet without RTP timestamp");
            return;
        };
        if packet.format.sample_rate == 0 {
            self.warn_rate_limited("dropping packet with non-positive sample rate");
            return;
        }

        let shared = &self.shared;
        let mut data = shared.lock_data();

        // Receive order defines buffer order; producer races are clamped
        // so received_time stays non-decreasing.
        if let Some(back) = data.packets.back()
            && packet.received_time < back.received_time
        {
            packet.received_time = back.received_time;
        }

        let arrival = packet.received_time;
        let stream =
            shared
                .streams
                .get_or_create(&packet.source_tag, packet.format, &shared.tuning, arrival);
        let reset = {
            let mut state = lock_stream(&stream);
            match state.classify(rtp_ts, arrival, &shared.tuning) {
                PacketContinuity::SessionReset => {
                    *state = state.reanchored(&shared.tuning, arrival);
                    state.observe(rtp_ts, arrival, &shared.tuning);
                    true
                }
                PacketContinuity::Continuous => {
                    state.observe(rtp_ts, arrival, &shared.tuning);
                    false
                }
            }
        };

        if reset {
            warn!(
                "RTP discontinuity on stream '{}', reanchoring at buffer tail",
                packet.source_tag
            );
            shared
                .registry
                .rewind_targets_for_tag(&packet.source_tag, data.packets.len());
        }

        data.packets.push_back(packet);
        shared.total_packets_added.fetch_add(1, Ordering::Relaxed);
        shared.bump_and_notify(&mut data);
    }

    #[instrument(skip(self))]
    pub fn register_processor(
        &self,
        instance_id: &str,
        filter: &str,
        delay_ms: i64,
        timeshift_sec: f64,
    ) {
        let mut data = self.shared.lock_data();
        self.shared.registry.register_processor(
            instance_id,
            filter,
            delay_ms,
            timeshift_sec,
            data.packets.len(),
            |i| data.packets.get(i).map(|p| p.received_time),
        );
        self.shared.bump_and_notify(&mut data);
    }

    #[instrument(skip(self))]
    pub fn unregister_processor(&self, instance_id: &str, filter: &str) {
        self.shared.registry.unregister_processor(instance_id, filter);
        let mut data = self.shared.lock_data();
        self.shared.bump_and_notify(&mut data);
    }

    pub fn update_processor_delay(&self, instance_id: &str, delay_ms: i64) -> bool {
        let updated = self.shared.registry.update_delay(instance_id, delay_ms);
        if updated {
            let mut data = self.shared.lock_data();
            self.shared.bump_and_notify(&mut data);
        }
        updated
    }

    /// Recomputes the read cursor with the same seek rule as
    /// registration.
    pub fn update_processor_timeshift(&self, instance_id: &str, timeshift_sec: f64) -> bool {
        let mut data = self.shared.lock_data();
        let updated = self.shared.registry.update_timeshift(
            instance_id,
            timeshift_sec,
            data.packets.len(),
            |i| data.packets.get(i).map(|p| p.received_time),
        );
        if updated {
            self.shared.bump_and_notify(&mut data);
        }
        updated
    }

    pub fn attach_sink_ring(
        &self,
        instance_id: &str,
        filter: &str,
        sink_id: &str,
        ring: &Arc<SinkRing>,
    ) -> bool {
        let attached = self
            .shared
            .registry
            .attach_sink_ring(instance_id, filter, sink_id, ring);
        if attached {
            let mut data = self.shared.lock_data();
            self.shared.bump_and_notify(&mut data);
        }
        attached
    }

    pub fn detach_sink_ring(&self, instance_id: &str, filter: &str, sink_id: &str) -> bool {
        let detached = self
            .shared
            .registry
            .detach_sink_ring(instance_id, filter, sink_id);
        if detached {
            let mut data = self.shared.lock_data();
            self.shared.bump_and_notify(&mut data);
        }
        detached
    }

    /// Erases the stream's timing state and rewinds every target fed by
    /// it to the current buffer tail. Applying it twice is a no-op.
    #[instrument(skip(self))]
    pub fn reset_stream_state(&self, source_tag: &str) {
        let removed = self.shared.streams.remove(source_tag);
        let mut data = self.shared.lock_data();
        self.shared
            .registry
            .rewind_targets_for_tag(source_tag, data.packets.len());
        self.shared.bump_and_notify(&mut data);
        if removed {
            info!("Timing state for stream '{source_tag}' reset");
        }
    }

    /// Concatenated PCM snapshot of the stream's trailing window, newest
    /// packet's format attached.
    pub fn export_recent_buffer(
        &self,
        source_tag: &str,
        lookback: Duration,
    ) -> Option<RecentBuffer> {
        let data = self.shared.lock_data();
        let now = Instant::now();
        let mut matching: Vec<&TaggedAudioPacket> = data
            .packets
            .iter()
            .rev()
            .take_while(|p| now.saturating_duration_since(p.received_time) <= lookback)
            .filter(|p| p.source_tag == source_tag)
            .collect();
        matching.reverse();

        let newest = matching.last()?;
        let format = newest.format;
        let span = newest
            .received_time
            .saturating_duration_since(matching[0].received_time);
        let mut audio_data =
            Vec::with_capacity(matching.iter().map(|p| p.audio_data.len()).sum());
        for packet in &matching {
            audio_data.extend_from_slice(&packet.audio_data);
        }
        Some(RecentBuffer {
            audio_data,
            format,
            packets: matching.len(),
            span,
        })
    }

    /// Snapshot of global, per-stream and per-processor statistics.
    pub fn get_stats(&self) -> StatsSnapshot {
        let shared = &self.shared;
        let (buffer_size, processors) = {
            let data = shared.lock_data();
            let mut targets = shared.registry.lock();
            let mut processors = Vec::new();
            for by_instance in targets.values_mut() {
                for info in by_instance.values_mut() {
                    let mut pending_packets = 0;
                    let mut pending_ms = 0.0;
                    for packet in data.packets.iter().skip(info.next_packet_read_index) {
                        if info.covers_tag(&packet.source_tag) {
                            pending_packets += 1;
                            pending_ms += packet.duration_millis();
                        }
                    }
                    // live_sink_rings prunes expired references, so the
                    // count afterwards is the live one.
                    let (queue_depth, queue_high_water) = info
                        .live_sink_rings()
                        .iter()
                        .map(|ring| (ring.len(), ring.high_water()))
                        .fold((0, 0), |acc, it| (acc.0.max(it.0), acc.1.max(it.1)));
                    processors.push(ProcessorStats {
                        instance_id: info.instance_id.clone(),
                        filter: info.filter.clone(),
                        bound_source_tag: info.bound_source_tag.clone(),
                        pending_packets,
                        pending_ms,
                        sink_count: info.sink_count(),
                        queue_depth,
                        queue_high_water,
                        dispatched_packets: info.dispatched_packets,
                        dropped_packets: info.dropped_packets,
                        lagging_events: info.lagging_events,
                        idle_resets: info.idle_resets,
                    });
                }
            }
            (data.packets.len(), processors)
        };

        let mut streams = Vec::new();
        for tag in shared.streams.tags() {
            let Some(stream) = shared.streams.get(&tag) else {
                continue;
            };
            let state = lock_stream(&stream);
            streams.push(StreamStats {
                source_tag: tag,
                total_packets: state.total_packets,
                jitter_ms: state.jitter_ms,
                clock_offset_ms: state.clock.offset_seconds() * 1_000.0,
                clock_drift_ppm: state.clock.drift_ppm(),
                arrival_error: DeviationStats::from_rolling(&state.arrival_error_ms),
                playout_deviation: DeviationStats::from_rolling(&state.playout_deviation_ms),
                head_playout_lag_ms: state.head_lag_ms.last(),
                late_packets: state.late_packets,
                discarded_packets: state.discarded_packets,
                underrun_count: state.underrun_count,
                current_buffer_level_ms: state.current_buffer_level_ms,
                target_buffer_level_ms: state.target_buffer_level_ms,
                playback_rate: state.playback_rate,
                reanchor_count: state.reanchor_count,
            });
        }

        let inbound = match shared.inbound.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let global = match inbound {
            Some(counters) => GlobalStats {
                total_packets_added: shared.total_packets_added.load(Ordering::Relaxed),
                buffer_size,
                inbound_queue_size: counters.size.load(Ordering::Relaxed),
                inbound_queue_high_water: counters.high_water.load(Ordering::Relaxed),
                inbound_queue_dropped: counters.dropped.load(Ordering::Relaxed),
            },
            None => GlobalStats {
                total_packets_added: shared.total_packets_added.load(Ordering::Relaxed),
                buffer_size,
                ..Default::default()
            },
        };

        StatsSnapshot {
            taken_at: Utc::now(),
            global,
            streams,
            processors,
        }
    }

    /// Replaces the default (log-only) registry event callback. The
    /// callback may fire while engine locks are held and must not call
    /// back into the engine.
    pub fn set_registry_callback(&self, callback: RegistryCallback) {
        self.shared.registry.set_callback(callback);
    }

    pub fn tuning(&self) -> &TimingConfig {
        &self.shared.tuning
    }

    /// Signals the scheduler, waits for it to drain one more iteration
    /// and exit. Idempotent.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wakeup.notify_all();
        let handle = match self.scheduler.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("Scheduler thread panicked during shutdown");
        }
    }

    fn warn_rate_limited(&self, message: &str) {
        let mut limiter = match self.shared.ingest_warn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(suppressed) = limiter.check(Instant::now()) {
            if suppressed > 0 {
                warn!("{message} ({suppressed} similar warnings suppressed)");
            } else {
                warn!("{message}");
            }
        }
    }
}

impl Drop for TimeshiftManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_stream(stream: &Arc<Mutex<StreamTimingState>>) -> MutexGuard<'_, StreamTimingState> {
    match stream.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Smoothed estimate of the scheduler's own per-iteration latency, used
/// to wake slightly before the next playout deadline.
struct ProcessingBudget {
    smoothed_us: f64,
    initialized: bool,
}

impl ProcessingBudget {
    fn new() -> Self {
        Self {
            smoothed_us: 0.0,
            initialized: false,
        }
    }

    fn update(&mut self, elapsed: Duration) {
        let us = elapsed.as_secs_f64() * 1e6;
        if self.initialized {
            self.smoothed_us =
                (1.0 - PROCESSING_BUDGET_ALPHA) * self.smoothed_us + PROCESSING_BUDGET_ALPHA * us;
        } else {
            self.smoothed_us = us;
            self.initialized = true;
        }
    }

    fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_us.max(0.0) / 1e6)
    }
}

fn run_scheduler(shared: Arc<Shared>) {
    set_realtime_priority();
    info!("Timeshift scheduler started.");

    let mut budget = ProcessingBudget::new();
    while !shared.stop.load(Ordering::Acquire) {
        let iteration_start = Instant::now();

        let events = dispatch_due(&shared, iteration_start);
        for event in &events {
            shared.registry.emit(event);
        }

        maybe_cleanup(&shared, Instant::now());

        let deadline = next_wakeup(&shared, Instant::now(), &budget);
        budget.update(iteration_start.elapsed());
        wait_until(&shared, deadline);
    }

    info!("Timeshift scheduler stopped.");
}

/// Walks every target and releases all packets whose playout deadline
/// has passed. Returns wildcard binding events to be emitted outside the
/// locks.
fn dispatch_due(shared: &Shared, now: Instant) -> Vec<RegistryEvent> {
    let tuning = &shared.tuning;
    let mut events = Vec::new();

    for (filter, instance_id) in shared.registry.target_keys() {
        loop {
            let mut data = shared.lock_data();
            let mut targets = shared.registry.lock();
            let Some(info) = targets
                .get_mut(&filter)
                .and_then(|by_instance| by_instance.get_mut(&instance_id))
            else {
                break;
            };

            let index = info.next_packet_read_index;
            if index >= data.packets.len() {
                break;
            }

            let candidate_tag = data.packets[index].source_tag.clone();
            let (matched, event) = info.match_and_bind(&candidate_tag);
            if let Some(event) = event {
                events.push(event);
            }
            if !matched {
                info.next_packet_read_index += 1;
                continue;
            }

            let Some(stream) = shared.streams.get(&candidate_tag) else {
                info.next_packet_read_index += 1;
                continue;
            };
            let mut state = lock_stream(&stream);
            if !state.clock.is_initialized() {
                info.next_packet_read_index += 1;
                continue;
            }

            let candidate = &data.packets[index];
            let Some(rtp_ts) = candidate.rtp_timestamp else {
                info.next_packet_read_index += 1;
                continue;
            };
            let Some(expected_arrival) = state.clock.expected_arrival(rtp_ts) else {
                info.next_packet_read_index += 1;
                continue;
            };

            let desired_latency_ms =
                desired_latency(info.current_delay_ms, info.current_timeshift_backshift_sec, &state, tuning);
            let latency = Duration::from_secs_f64(desired_latency_ms / 1_000.0);
            let ideal_playout = expected_arrival + latency;

            if ideal_playout > now {
                // Head packet not due yet; this target is waiting.
                break;
            }

            let lateness_ms = signed_millis(now, ideal_playout);
            state.playout_deviation_ms.update(lateness_ms);
            state.head_lag_ms.update(lateness_ms.max(0.0));
            if lateness_ms > tuning.late_packet_threshold_ms {
                state.late_packets += 1;
            }

            // Buffer level is how far ahead of real time the newest
            // received packet of this stream would play out.
            let newest_rtp = state.last_rtp_timestamp;
            let level_ms = state
                .clock
                .expected_arrival(newest_rtp)
                .map(|arrival| signed_millis(arrival + latency, now).max(0.0))
                .unwrap_or(0.0);
            state.current_buffer_level_ms = level_ms;
            if level_ms <= 0.0 && lateness_ms > 0.0 {
                state.underrun_count += 1;
            }

            let update = update_playback_rate(&mut state, tuning, desired_latency_ms, now);

            if lateness_ms > tuning.max_catchup_lag_ms && update.saturated {
                state.discarded_packets += 1;
                info.dropped_packets += 1;
                info.next_packet_read_index += 1;
                debug!(
                    "Dropped packet of stream '{candidate_tag}' {lateness_ms:.1} ms past deadline with saturated rate controller"
                );
                continue;
            }

            state.last_played_rtp = Some(rtp_ts);
            let mut packet = candidate.clone();
            packet.playback_rate = update.rate;

            let chunk_ms = packet.duration_millis().max(1e-3);
            let cap = ((desired_latency_ms / chunk_ms).ceil() as usize)
                .clamp(1, tuning.max_processor_queue_packets);

            let rings = info.live_sink_rings();
            info.dispatched_packets += 1;
            info.next_packet_read_index += 1;

            drop(state);
            drop(targets);
            drop(data);

            for ring in rings {
                ring.push_capped(packet.clone(), cap);
            }
        }
    }

    events
}

fn desired_latency(
    delay_ms: i64,
    timeshift_sec: f64,
    state: &StreamTimingState,
    tuning: &TimingConfig,
) -> MilliSeconds {
    let mut desired =
        (delay_ms as f64).max(state.target_buffer_level_ms) + timeshift_sec * 1_000.0;
    if let Some(cap) = tuning.max_adaptive_delay_ms {
        desired = desired.min(cap);
    }
    desired.max(0.0)
}

/// Prunes packets older than the configured buffer age and fixes up the
/// read cursors of every target.
fn maybe_cleanup(shared: &Shared, now: Instant) {
    let tuning = &shared.tuning;
    let mut data = shared.lock_data();
    if now.saturating_duration_since(data.last_cleanup) < tuning.cleanup_interval() {
        return;
    }
    data.last_cleanup = now;

    let Some(horizon) = now.checked_sub(tuning.max_buffer_duration) else {
        return;
    };

    let mut pruned_tags = Vec::new();
    while let Some(front) = data.packets.front() {
        if front.received_time < horizon {
            pruned_tags.push(front.source_tag.clone());
            data.packets.pop_front();
        } else {
            break;
        }
    }
    let pruned = pruned_tags.len();
    if pruned == 0 {
        return;
    }

    let mut targets = shared.registry.lock();
    for by_instance in targets.values_mut() {
        for info in by_instance.values_mut() {
            if info.next_packet_read_index < pruned {
                // The cursor was inside the pruned block. If any pruned
                // packet belonged to this target it was lagging behind
                // real time; otherwise it was simply idle.
                if pruned_tags.iter().any(|tag| info.covers_tag(tag)) {
                    info.lagging_events += 1;
                    warn!(
                        "Processor '{}' lagged behind the timeshift buffer, catching up",
                        info.instance_id
                    );
                } else {
                    info.idle_resets += 1;
                }
                info.next_packet_read_index = 0;
            } else {
                info.next_packet_read_index -= pruned;
            }
        }
    }
    drop(targets);

    debug!("Pruned {pruned} packets from the timeshift buffer");
    data.version += 1;
}

/// Earliest upcoming playout deadline across all waiting targets, pulled
/// forward by the smoothed processing budget and clamped to the loop and
/// cleanup cadences.
fn next_wakeup(shared: &Shared, now: Instant, budget: &ProcessingBudget) -> Instant {
    let tuning = &shared.tuning;
    let data = shared.lock_data();
    let targets = shared.registry.lock();

    let mut earliest: Option<Instant> = None;
    for by_instance in targets.values() {
        for info in by_instance.values() {
            let Some(candidate) = data.packets.get(info.next_packet_read_index) else {
                continue;
            };
            if !info.covers_tag(&candidate.source_tag) {
                continue;
            }
            let Some(rtp_ts) = candidate.rtp_timestamp else {
                continue;
            };
            let Some(stream) = shared.streams.get(&candidate.source_tag) else {
                continue;
            };
            let state = lock_stream(&stream);
            let Some(expected_arrival) = state.clock.expected_arrival(rtp_ts) else {
                continue;
            };
            // The steady target level, not the controller's short-term
            // view, so rate dips don't cause busy-waking.
            let desired_ms = desired_latency(
                info.current_delay_ms,
                info.current_timeshift_backshift_sec,
                &state,
                tuning,
            );
            let ideal = expected_arrival + Duration::from_secs_f64(desired_ms / 1_000.0);
            earliest = Some(earliest.map_or(ideal, |it| it.min(ideal)));
        }
    }

    let cleanup_due = data.last_cleanup + tuning.cleanup_interval();
    drop(targets);
    drop(data);

    let mut deadline = earliest.unwrap_or_else(|| now + tuning.loop_max_sleep());
    if let Some(earlier) = deadline.checked_sub(budget.duration()) {
        deadline = earlier;
    }

    let mut upper = now + tuning.loop_max_sleep();
    if cleanup_due < upper {
        upper = cleanup_due;
    }
    if upper < now {
        upper = now;
    }
    if deadline < now {
        deadline = now;
    } else if deadline > upper {
        deadline = upper;
    }
    deadline
}

/// Sleeps on the scheduler condition until the deadline passes, a
/// mutator bumps the buffer version or shutdown is requested.
fn wait_until(shared: &Shared, deadline: Instant) {
    let mut data = shared.lock_data();
    let version = data.version;
    loop {
        if shared.stop.load(Ordering::Acquire) || data.version != version {
            return;
        }
        let now = Instant::now();
        let Some(remaining) = deadline.checked_duration_since(now) else {
            return;
        };
        if remaining.is_zero() {
            return;
        }
        data = match shared.wakeup.wait_timeout(data, remaining) {
            Ok((guard, timeout)) => {
                if timeout.timed_out() {
                    return;
                }
                guard
            }
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

/// Counters shared between the inbound queue and `get_stats`.
struct InboundCounters {
    size: AtomicUsize,
    high_water: AtomicU64,
    dropped: AtomicU64,
}

/// Optional decoupling queue between network decoders and `add_packet`,
/// drained by its own thread. Overflow drops the incoming packet and
/// counts it; the decoder is never blocked.
pub struct IngestQueue {
    tx: Mutex<Option<Sender<TaggedAudioPacket>>>,
    counters: Arc<InboundCounters>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl IngestQueue {
    pub fn start(manager: Arc<TimeshiftManager>) -> PcmRouteResult<Self> {
        let capacity = manager.tuning().inbound_queue_packets.max(1);
        let (tx, rx): (Sender<TaggedAudioPacket>, Receiver<TaggedAudioPacket>) =
            bounded(capacity);
        let counters = Arc::new(InboundCounters {
            size: AtomicUsize::new(0),
            high_water: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        if let Ok(mut inbound) = manager.shared.inbound.lock() {
            *inbound = Some(counters.clone());
        }

        let drain_counters = counters.clone();
        let drain = thread::Builder::new()
            .name("timeshift-ingest".to_owned())
            .spawn(move || {
                for packet in rx {
                    drain_counters.size.fetch_sub(1, Ordering::Relaxed);
                    manager.add_packet(packet);
                }
                debug!("Ingest queue drained and closed.");
            })
            .map_err(|e| PcmRouteError::SchedulerStart(e.to_string()))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            counters,
            drain: Mutex::new(Some(drain)),
        })
    }

    pub fn push(&self, packet: TaggedAudioPacket) {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(packet) {
            Ok(()) => {
                let size = self.counters.size.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters
                    .high_water
                    .fetch_max(size as u64, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Closes the queue and waits for the drain thread to finish.
    pub fn stop(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);
        let drain = match self.drain.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(drain) = drain
            && drain.join().is_err()
        {
            warn!("Ingest drain thread panicked during shutdown");
        }
    }
}

impl Drop for IngestQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_tuning() -> TimingConfig {
        TimingConfig {
            target_buffer_level_ms: 200.0,
            max_catchup_lag_ms: 10_000.0,
            loop_max_sleep_ms: 5,
            ..Default::default()
        }
    }

    fn packet(tag: &str, rtp: u32, received_time: Instant) -> TaggedAudioPacket {
        let format = crate::formats::AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
        };
        TaggedAudioPacket {
            source_tag: tag.to_owned(),
            audio_data: vec![0u8; 480 * format.bytes_per_frame()].into(),
            format,
            rtp_timestamp: Some(rtp),
            received_time,
            ssrcs: Vec::new(),
            is_sentinel: false,
            playback_rate: 1.0,
        }
    }

    fn settle() {
        thread::sleep(Duration::from_millis(200));
    }

    #[test]
    fn dispatches_due_packets_with_bounded_rates() {
        let manager = TimeshiftManager::start(test_tuning()).expect("scheduler starts");
        manager.register_processor("p1", "src#1", 0, 0.0);
        let ring = Arc::new(SinkRing::new(64));
        assert!(manager.attach_sink_ring("p1", "src#1", "sink", &ring));

        // A second of audio whose playout deadlines have all passed.
        let base = Instant::now() - Duration::from_secs(1);
        for i in 0..20u32 {
            manager.add_packet(packet(
                "src#1",
                i * 480,
                base + Duration::from_millis(i as u64 * 10),
            ));
        }
        settle();

        assert_eq!(20, ring.len(), "all due packets must be dispatched");
        while let Some(dispatched) = ring.pop() {
            assert!(dispatched.playback_rate >= 0.5);
            assert!(dispatched.playback_rate <= 2.0);
        }

        let stats = manager.get_stats();
        assert_eq!(20, stats.global.total_packets_added);
        assert_eq!(20, stats.processors[0].dispatched_packets);
        assert_eq!(0, stats.processors[0].pending_packets);
        assert_eq!(0, stats.streams[0].discarded_packets);
        manager.stop();
    }

    #[test]
    fn session_reset_reanchors_and_rewinds() {
        let mut tuning = test_tuning();
        tuning.target_buffer_level_ms = 500.0;
        let manager = TimeshiftManager::start(tuning).expect("scheduler starts");
        manager.register_processor("p1", "src#1", 0, 0.0);

        // A fresh stream that has not reached its playout deadline yet.
        let base = Instant::now() - Duration::from_millis(100);
        let mut last_arrival = base;
        for i in 0..100u32 {
            last_arrival = base + Duration::from_millis(i as u64);
            manager.add_packet(packet("src#1", i * 480, last_arrival));
        }

        // The counter restarts without any wallclock gap.
        manager.add_packet(packet("src#1", 100 * 480 + 50_000, last_arrival));
        settle();

        let stats = manager.get_stats();
        assert_eq!(1, stats.streams[0].reanchor_count);
        assert_eq!(
            1, stats.processors[0].pending_packets,
            "read cursor must restart at the post-reset tail"
        );
        manager.stop();
    }

    #[test]
    fn wildcard_binds_first_tag_and_excludes_siblings() {
        let manager = TimeshiftManager::start(test_tuning()).expect("scheduler starts");
        let bindings = Arc::new(AtomicUsize::new(0));
        let seen = bindings.clone();
        manager.set_registry_callback(Arc::new(move |event| {
            if matches!(event, RegistryEvent::WildcardBound { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        manager.register_processor("p1", "speaker-*", 0, 0.0);
        let ring = Arc::new(SinkRing::new(64));
        assert!(manager.attach_sink_ring("p1", "speaker-*", "sink", &ring));

        let base = Instant::now() - Duration::from_secs(1);
        for i in 0..5u32 {
            manager.add_packet(packet(
                "speaker-kitchen#10.0.0.1:4010",
                i * 480,
                base + Duration::from_millis(i as u64 * 10),
            ));
        }
        for i in 0..5u32 {
            manager.add_packet(packet(
                "speaker-bath#10.0.0.2:4010",
                i * 480,
                base + Duration::from_millis(100 + i as u64 * 10),
            ));
        }
        settle();

        assert_eq!(1, bindings.load(Ordering::SeqCst));
        assert_eq!(5, ring.len(), "only the bound tag may be dispatched");
        while let Some(dispatched) = ring.pop() {
            assert_eq!("speaker-kitchen#10.0.0.1:4010", dispatched.source_tag);
        }
        let stats = manager.get_stats();
        assert_eq!(
            Some("speaker-kitchen#10.0.0.1:4010".to_owned()),
            stats.processors[0].bound_source_tag
        );
        manager.stop();
    }

    #[test]
    fn full_sink_ring_drops_oldest_without_blocking() {
        let manager = TimeshiftManager::start(test_tuning()).expect("scheduler starts");
        manager.register_processor("p1", "src#1", 0, 0.0);
        let ring = Arc::new(SinkRing::new(4));
        assert!(manager.attach_sink_ring("p1", "src#1", "sink", &ring));

        let base = Instant::now() - Duration::from_secs(2);
        for i in 0..40u32 {
            manager.add_packet(packet(
                "src#1",
                i * 480,
                base + Duration::from_millis(i as u64 * 10),
            ));
        }
        settle();

        assert!(ring.len() <= 4);
        assert!(ring.dropped() > 0, "overflow must be counted, not blocked");
        let stats = manager.get_stats();
        assert_eq!(40, stats.processors[0].dispatched_packets);
        assert!(stats.processors[0].queue_depth <= 4);
        assert_eq!(1, stats.processors[0].sink_count);

        // Dropping the consumer side expires the weak reference; the
        // next snapshot prunes it.
        drop(ring);
        let stats = manager.get_stats();
        assert_eq!(0, stats.processors[0].sink_count);
        manager.stop();
    }

    #[test]
    fn timeshift_seeks_into_the_buffered_past() {
        let mut tuning = test_tuning();
        tuning.target_buffer_level_ms = 10_000.0;
        let manager = TimeshiftManager::start(tuning).expect("scheduler starts");

        // Five seconds of history, one packet per 100 ms.
        let now = Instant::now();
        for i in 0..50u32 {
            manager.add_packet(packet(
                "src#1",
                i * 4_800,
                now - Duration::from_secs(5) + Duration::from_millis(i as u64 * 100),
            ));
        }

        manager.register_processor("p1", "src#1", 0, 0.0);
        let stats = manager.get_stats();
        assert_eq!(
            0, stats.processors[0].pending_packets,
            "registration without timeshift starts at the tail"
        );

        assert!(manager.update_processor_timeshift("p1", 2.0));
        let stats = manager.get_stats();
        let pending = stats.processors[0].pending_packets;
        assert!(
            (15..=25).contains(&pending),
            "a 2 s backshift should admit about 20 packets, got {pending}"
        );

        // Round trip: clearing the timeshift returns to the tail.
        assert!(manager.update_processor_timeshift("p1", 0.0));
        let stats = manager.get_stats();
        assert_eq!(0, stats.processors[0].pending_packets);
        manager.stop();
    }

    #[test]
    fn reset_stream_state_is_idempotent() {
        let manager = TimeshiftManager::start(test_tuning()).expect("scheduler starts");
        let now = Instant::now();
        manager.add_packet(packet("src#1", 0, now));
        assert_eq!(1, manager.get_stats().streams.len());

        manager.reset_stream_state("src#1");
        assert_eq!(0, manager.get_stats().streams.len());
        manager.reset_stream_state("src#1");
        assert_eq!(0, manager.get_stats().streams.len());
        manager.stop();
    }

    #[test]
    fn exports_recent_buffer_for_one_stream() {
        let mut tuning = test_tuning();
        tuning.target_buffer_level_ms = 10_000.0;
        let manager = TimeshiftManager::start(tuning).expect("scheduler starts");
        let now = Instant::now();
        for i in 0..10u32 {
            manager.add_packet(packet("src#1", i * 480, now + Duration::from_millis(i as u64)));
            manager.add_packet(packet(
                "other#2",
                i * 480,
                now + Duration::from_millis(i as u64),
            ));
        }

        let export = manager
            .export_recent_buffer("src#1", Duration::from_secs(10))
            .expect("stream has recent packets");
        assert_eq!(10, export.packets);
        assert_eq!(10 * 480 * 4, export.audio_data.len());
        assert_eq!(48_000, export.format.sample_rate);

        assert!(
            manager
                .export_recent_buffer("absent#0", Duration::from_secs(10))
                .is_none()
        );
        manager.stop();
    }

    #[test]
    fn packets_without_rtp_timestamp_are_ignored() {
        let manager = TimeshiftManager::start(test_tuning()).expect("scheduler starts");
        let mut bad = packet("src#1", 0, Instant::now());
        bad.rtp_timestamp = None;
        manager.add_packet(bad);
        let stats = manager.get_stats();
        assert_eq!(0, stats.global.total_packets_added);
        assert!(stats.streams.is_empty());
        manager.stop();
    }

    #[test]
    fn ingest_queue_decouples_producers() {
        let manager = Arc::new(TimeshiftManager::start(test_tuning()).expect("scheduler starts"));
        let ingest = IngestQueue::start(manager.clone()).expect("ingest queue starts");
        let base = Instant::now() - Duration::from_secs(1);
        for i in 0..10u32 {
            ingest.push(packet(
                "src#1",
                i * 480,
                base + Duration::from_millis(i as u64 * 10),
            ));
        }
        settle();
        assert_eq!(10, manager.get_stats().global.total_packets_added);
        ingest.stop();
        manager.stop();
    }
}
