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

pub mod stats;

use crate::timeshift::TimeshiftManager;
use std::{sync::Arc, time::Duration};
use tokio::{select, time::interval};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{info, warn};

/// Periodically logs a statistics snapshot of the engine.
pub async fn stats_logger(
    subsys: SubsystemHandle,
    manager: Arc<TimeshiftManager>,
    period: Duration,
) -> Result<(), &'static str> {
    if period.is_zero() {
        info!("Stats logging disabled.");
        return Ok(());
    }

    info!("Stats subsystem started.");
    let mut ticker = interval(period);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        select! {
            _ = ticker.tick() => log_snapshot(&manager),
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    info!("Stats subsystem stopped.");
    Ok(())
}

fn log_snapshot(manager: &TimeshiftManager) {
    let snapshot = manager.get_stats();
    match serde_json::to_string(&snapshot) {
        Ok(json) => info!("stats: {json}"),
        Err(e) => warn!("Could not serialize stats snapshot: {e}"),
    }
}
