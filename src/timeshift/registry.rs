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

//! Processor target registry.
//!
//! Maps source-tag filters to registered processor instances and their
//! downstream sink rings, and owns the read-index arithmetic for delay
//! and timeshift changes so the global buffer never leaks out of the
//! manager.

use crate::{packet::TaggedAudioPacket, ring::AudioRing};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};
use tracing::{info, warn};

pub type SinkRing = AudioRing<TaggedAudioPacket>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        instance_id: String,
        filter: String,
    },
    Unregistered {
        instance_id: String,
        filter: String,
    },
    /// A wildcard filter locked onto its first concrete tag.
    WildcardBound {
        instance_id: String,
        filter: String,
        concrete_tag: String,
    },
}

pub type RegistryCallback = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// One `(filter, instance)` dispatch target.
pub struct ProcessorTargetInfo {
    pub instance_id: String,
    pub filter: String,
    pub is_wildcard: bool,
    pub wildcard_prefix: String,
    /// Populated on the first wildcard match; afterwards only packets
    /// carrying exactly this tag are dispatched.
    pub bound_source_tag: Option<String>,
    pub matched_concrete_tags: HashSet<String>,
    pub current_delay_ms: i64,
    pub current_timeshift_backshift_sec: f64,
    /// Cursor into the global timeshift buffer.
    pub next_packet_read_index: usize,
    sink_rings: HashMap<String, Weak<SinkRing>>,
    pub dispatched_packets: u64,
    pub dropped_packets: u64,
    pub lagging_events: u64,
    pub idle_resets: u64,
}

impl ProcessorTargetInfo {
    fn new(instance_id: String, filter: String, delay_ms: i64, timeshift_sec: f64) -> Self {
        let is_wildcard = filter.ends_with('*');
        let wildcard_prefix = if is_wildcard {
            filter[..filter.len() - 1].to_owned()
        } else {
            String::new()
        };
        Self {
            instance_id,
            filter,
            is_wildcard,
            wildcard_prefix,
            bound_source_tag: None,
            matched_concrete_tags: HashSet::new(),
            current_delay_ms: delay_ms,
            current_timeshift_backshift_sec: timeshift_sec,
            next_packet_read_index: 0,
            sink_rings: HashMap::new(),
            dispatched_packets: 0,
            dropped_packets: 0,
            lagging_events: 0,
            idle_resets: 0,
        }
    }

    /// Whether a packet with this tag is dispatched to the target. A
    /// wildcard binds to the first matching concrete tag and rejects all
    /// others from then on.
    pub fn match_and_bind(&mut self, source_tag: &str) -> (bool, Option<RegistryEvent>) {
        if !self.is_wildcard {
            return (self.filter == source_tag, None);
        }
        match &self.bound_source_tag {
            Some(bound) => (bound == source_tag, None),
            None => {
                if source_tag.starts_with(&self.wildcard_prefix) {
                    self.bound_source_tag = Some(source_tag.to_owned());
                    self.matched_concrete_tags.insert(source_tag.to_owned());
                    let event = RegistryEvent::WildcardBound {
                        instance_id: self.instance_id.clone(),
                        filter: self.filter.clone(),
                        concrete_tag: source_tag.to_owned(),
                    };
                    (true, Some(event))
                } else {
                    (false, None)
                }
            }
        }
    }

    /// Whether this target is (or would be) fed by the given tag; used by
    /// reset and cleanup bookkeeping, does not bind.
    pub fn covers_tag(&self, source_tag: &str) -> bool {
        if self.is_wildcard {
            match &self.bound_source_tag {
                Some(bound) => bound == source_tag,
                None => source_tag.starts_with(&self.wildcard_prefix),
            }
        } else {
            self.filter == source_tag
        }
    }

    pub fn attach_sink_ring(&mut self, sink_id: String, ring: &Arc<SinkRing>) {
        self.sink_rings.insert(sink_id, Arc::downgrade(ring));
    }

    pub fn detach_sink_ring(&mut self, sink_id: &str) {
        self.sink_rings.remove(sink_id);
    }

    /// Live sink rings; expired weak references are dropped on the way.
    pub fn live_sink_rings(&mut self) -> Vec<Arc<SinkRing>> {
        let mut live = Vec::with_capacity(self.sink_rings.len());
        self.sink_rings.retain(|_, weak| match weak.upgrade() {
            Some(ring) => {
                live.push(ring);
                true
            }
            None => false,
        });
        live
    }

    pub fn sink_count(&self) -> usize {
        self.sink_rings.len()
    }
}

type TargetMap = HashMap<String, HashMap<String, ProcessorTargetInfo>>;

pub struct ProcessorRegistry {
    targets: Mutex<TargetMap>,
    callback: Mutex<Option<RegistryCallback>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: RegistryCallback) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = Some(callback);
        }
    }

    /// Fires the registered state-change callback. Must not be called
    /// while the target map is locked.
    pub fn emit(&self, event: &RegistryEvent) {
        let callback = match self.callback.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TargetMap> {
        match self.targets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds a target. With a positive timeshift the read cursor is sought
    /// backwards through the buffer via `probe`, otherwise it starts at
    /// the buffer tail.
    pub fn register_processor(
        &self,
        instance_id: &str,
        filter: &str,
        delay_ms: i64,
        timeshift_sec: f64,
        buffer_len: usize,
        probe: impl Fn(usize) -> Option<Instant>,
    ) {
        let mut info = ProcessorTargetInfo::new(
            instance_id.to_owned(),
            filter.to_owned(),
            delay_ms,
            timeshift_sec,
        );
        info.next_packet_read_index =
            seek_read_index(buffer_len, delay_ms, timeshift_sec, Instant::now(), probe);

        {
            let mut targets = self.lock();
            let by_instance = targets.entry(filter.to_owned()).or_default();
            if by_instance.insert(instance_id.to_owned(), info).is_some() {
                warn!("Processor '{instance_id}' re-registered for filter '{filter}'");
            }
        }
        info!("Registered processor '{instance_id}' for filter '{filter}'");
        self.emit(&RegistryEvent::Registered {
            instance_id: instance_id.to_owned(),
            filter: filter.to_owned(),
        });
    }

    pub fn unregister_processor(&self, instance_id: &str, filter: &str) {
        let removed = {
            let mut targets = self.lock();
            let removed = targets
                .get_mut(filter)
                .map(|by_instance| by_instance.remove(instance_id).is_some())
                .unwrap_or(false);
            if targets.get(filter).is_some_and(HashMap::is_empty) {
                targets.remove(filter);
            }
            removed
        };
        if removed {
            info!("Unregistered processor '{instance_id}' from filter '{filter}'");
            self.emit(&RegistryEvent::Unregistered {
                instance_id: instance_id.to_owned(),
                filter: filter.to_owned(),
            });
        }
    }

    pub fn update_delay(&self, instance_id: &str, delay_ms: i64) -> bool {
        let mut updated = false;
        let mut targets = self.lock();
        for by_instance in targets.values_mut() {
            if let Some(info) = by_instance.get_mut(instance_id) {
                info.current_delay_ms = delay_ms;
                updated = true;
            }
        }
        updated
    }

    /// Applies a new timeshift and recomputes the read cursor with the
    /// same seek rule as registration.
    pub fn update_timeshift(
        &self,
        instance_id: &str,
        timeshift_sec: f64,
        buffer_len: usize,
        probe: impl Fn(usize) -> Option<Instant>,
    ) -> bool {
        let now = Instant::now();
        let mut updated = false;
        let mut targets = self.lock();
        for by_instance in targets.values_mut() {
            if let Some(info) = by_instance.get_mut(instance_id) {
                info.current_timeshift_backshift_sec = timeshift_sec;
                info.next_packet_read_index = seek_read_index(
                    buffer_len,
                    info.current_delay_ms,
                    timeshift_sec,
                    now,
                    &probe,
                );
                updated = true;
            }
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
        let mut targets = self.lock();
        if let Some(info) = targets
            .get_mut(filter)
            .and_then(|by_instance| by_instance.get_mut(instance_id))
        {
            info.attach_sink_ring(sink_id.to_owned(), ring);
            true
        } else {
            false
        }
    }

    pub fn detach_sink_ring(&self, instance_id: &str, filter: &str, sink_id: &str) -> bool {
        let mut targets = self.lock();
        if let Some(info) = targets
            .get_mut(filter)
            .and_then(|by_instance| by_instance.get_mut(instance_id))
        {
            info.detach_sink_ring(sink_id);
            true
        } else {
            false
        }
    }

    /// Rewinds every target fed by `source_tag` to the buffer tail and
    /// releases wildcard bindings to it. Used on stream reset.
    pub(crate) fn rewind_targets_for_tag(&self, source_tag: &str, buffer_len: usize) {
        let mut targets = self.lock();
        for by_instance in targets.values_mut() {
            for info in by_instance.values_mut() {
                if info.covers_tag(source_tag) {
                    info.next_packet_read_index = buffer_len;
                    if info.bound_source_tag.as_deref() == Some(source_tag) {
                        info.bound_source_tag = None;
                    }
                }
            }
        }
    }

    pub(crate) fn target_keys(&self) -> Vec<(String, String)> {
        let targets = self.lock();
        let mut keys = Vec::new();
        for (filter, by_instance) in targets.iter() {
            for instance_id in by_instance.keys() {
                keys.push((filter.clone(), instance_id.clone()));
            }
        }
        keys
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Earliest buffer index whose packet was received no earlier than
/// `now − delay − timeshift`; the buffer tail when not timeshifting.
/// Receive times are non-decreasing, so a binary scan suffices.
fn seek_read_index(
    buffer_len: usize,
    delay_ms: i64,
    timeshift_sec: f64,
    now: Instant,
    probe: impl Fn(usize) -> Option<Instant>,
) -> usize {
    if timeshift_sec <= 0.0 || buffer_len == 0 {
        return buffer_len;
    }

    let backshift = Duration::from_secs_f64(timeshift_sec + (delay_ms.max(0) as f64) / 1_000.0);
    let Some(horizon) = now.checked_sub(backshift) else {
        return 0;
    };

    let mut lo = 0;
    let mut hi = buffer_len;
    while lo < hi {
        let mid = (lo + hi) / 2;
        match probe(mid) {
            Some(received) if received < horizon => lo = mid + 1,
            Some(_) => hi = mid,
            None => return buffer_len,
        }
    }
    lo
}
