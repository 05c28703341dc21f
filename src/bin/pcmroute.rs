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

use miette::Result;
use pcmroute::{
    config::{Config, ProcessorConfig},
    error::PcmRouteError,
    monitoring::stats_logger,
    net::start_listener,
    source::SourceInputProcessor,
    telemetry,
    timeshift::{IngestQueue, TimeshiftManager, registry::SinkRing},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tokio::task::spawn_blocking;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::{info, trace, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    telemetry::init()?;

    let config = Config::load().await?;

    info!(
        "Starting {} instance '{}' with {} listener(s) and {} processor registration(s)",
        config.app.name,
        config.app.instance.name,
        config.listeners.len(),
        config.processors.len()
    );

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("pcmroute", move |s| async move {
            let manager = Arc::new(TimeshiftManager::start(config.timing.clone())?);
            let ingest = Arc::new(IngestQueue::start(manager.clone())?);

            for processor in &config.processors {
                start_processor(&s, &manager, &config, processor)?;
            }

            for listener in config.listeners.clone() {
                start_listener(&s, listener, ingest.clone());
            }

            let stats_manager = manager.clone();
            let stats_interval = config.stats_interval;
            s.start(SubsystemBuilder::new("stats", move |s| {
                stats_logger(s, stats_manager, stats_interval)
            }));

            s.on_shutdown_requested().await;
            ingest.stop();
            manager.stop();

            Ok::<(), PcmRouteError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}

/// Registers one processor target and spawns its pull worker: a thread
/// popping dispatched packets off the sink ring and running them through
/// the input processor. Sink mixers would consume the resulting chunks;
/// without one attached they are dropped after processing.
fn start_processor(
    subsys: &SubsystemHandle,
    manager: &Arc<TimeshiftManager>,
    config: &Config,
    processor: &ProcessorConfig,
) -> Result<(), PcmRouteError> {
    manager.register_processor(
        &processor.instance_id,
        &processor.filter_tag,
        processor.delay_ms,
        processor.timeshift_sec,
    );

    let ring = Arc::new(SinkRing::new(config.timing.max_processor_queue_packets));
    manager.attach_sink_ring(
        &processor.instance_id,
        &processor.filter_tag,
        "mixer",
        &ring,
    );

    let sip = Arc::new(SourceInputProcessor::new(
        processor.instance_id.clone(),
        config.output.audio_format(),
        config.output.chunk_frames,
    )?);
    sip.set_delay_ms(processor.delay_ms);
    sip.set_timeshift_sec(processor.timeshift_sec);

    let name = format!("processor-{}", processor.instance_id);
    subsys.start(SubsystemBuilder::new(name, move |s| async move {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker_sip = sip.clone();
        let worker = spawn_blocking(move || pull_loop(ring, worker_sip, worker_stop));

        s.on_shutdown_requested().await;
        stop.store(true, Ordering::Release);
        sip.stop();
        if let Err(e) = worker.await {
            warn!("Error waiting for pull worker: {e}");
        }

        Ok::<(), PcmRouteError>(())
    }));

    Ok(())
}

fn pull_loop(ring: Arc<SinkRing>, sip: Arc<SourceInputProcessor>, stop: Arc<AtomicBool>) {
    let mut chunks = Vec::new();
    while !stop.load(Ordering::Acquire) {
        let mut idle = true;
        while let Some(packet) = ring.pop() {
            idle = false;
            sip.ingest_packet(&packet, &mut chunks);
        }
        if !chunks.is_empty() {
            trace!(
                "Processor '{}' produced {} chunk(s)",
                sip.instance_id(),
                chunks.len()
            );
            chunks.clear();
        }
        if idle {
            thread::sleep(Duration::from_millis(2));
        }
    }
}
