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

//! Packet producers. Each listener owns a blocking RX thread reading
//! datagrams, decoding them into tagged packets and pushing them onto the
//! engine's ingest queue. The control plane around the thread is a
//! graceful-shutdown subsystem; the read timeout on the socket lets the
//! thread observe cancellation promptly.

pub mod rtp;
pub mod scream;

use crate::{
    config::{ListenerConfig, WireProtocol},
    error::{PcmRouteError, PcmRouteResult},
    formats::AudioFormat,
    net::{rtp::RtpDecoder, scream::ScreamDecoder},
    socket::create_rx_socket,
    timeshift::IngestQueue,
    utils::{WarnRateLimiter, set_realtime_priority},
};
use std::{
    io::ErrorKind,
    net::UdpSocket,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::task::spawn_blocking;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};

const DEFAULT_RTP_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 48_000,
    channels: 2,
    bit_depth: 16,
};

#[instrument(skip(subsys, ingest))]
pub fn start_listener(subsys: &SubsystemHandle, config: ListenerConfig, ingest: Arc<IngestQueue>) {
    let name = format!("listener-{}", config.name);
    subsys.start(SubsystemBuilder::new(name, move |s| {
        run(s, config, ingest)
    }));
}

async fn run(
    subsys: SubsystemHandle,
    config: ListenerConfig,
    ingest: Arc<IngestQueue>,
) -> PcmRouteResult<()> {
    let socket = create_rx_socket(&config)?;
    info!("Listener '{}' started.", config.name);

    let stop = Arc::new(AtomicBool::new(false));
    let rx_stop = stop.clone();
    let rx_config = config.clone();
    let rx_thread = spawn_blocking(move || rx_loop(socket, rx_config, ingest, rx_stop));

    subsys.on_shutdown_requested().await;
    stop.store(true, Ordering::Release);

    match rx_thread.await {
        Ok(Ok(())) => info!("Listener '{}' stopped.", config.name),
        Ok(Err(e)) => warn!("Listener '{}' terminated with error: {e}", config.name),
        Err(e) => warn!("Error waiting for RX thread of '{}': {e}", config.name),
    }

    Ok(())
}

fn rx_loop(
    socket: UdpSocket,
    config: ListenerConfig,
    ingest: Arc<IngestQueue>,
    stop: Arc<AtomicBool>,
) -> PcmRouteResult<()> {
    set_realtime_priority();

    let mut scream_decoder = ScreamDecoder::new(&config.name);
    let rtp_decoder = match config.protocol {
        WireProtocol::Rtp => Some(RtpDecoder::new(
            &config.name,
            config.rtp_format.unwrap_or(DEFAULT_RTP_FORMAT),
        )?),
        WireProtocol::Scream => None,
    };

    let mut warn_limiter = WarnRateLimiter::new(Duration::from_secs(5));
    let mut receive_buffer = [0u8; 65_535];

    while !stop.load(Ordering::Acquire) {
        let (len, sender) = match socket.recv_from(&mut receive_buffer) {
            Ok(it) => it,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => return Err(PcmRouteError::IoError(e)),
        };
        let received_time = Instant::now();
        let data = &receive_buffer[..len];

        let decoded = match &rtp_decoder {
            Some(decoder) => decoder.decode(data, sender, received_time),
            None => scream_decoder.decode(data, sender, received_time),
        };

        match decoded {
            Ok(packet) => ingest.push(packet),
            Err(e) => {
                if let Some(suppressed) = warn_limiter.check(received_time) {
                    if suppressed > 0 {
                        warn!(
                            "Listener '{}' received malformed datagram: {e} ({suppressed} similar warnings suppressed)",
                            config.name
                        );
                    } else {
                        warn!("Listener '{}' received malformed datagram: {e}", config.name);
                    }
                }
            }
        }
    }

    Ok(())
}
