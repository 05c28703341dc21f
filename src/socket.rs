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

use crate::{config::ListenerConfig, error::PcmRouteError, error::PcmRouteResult};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::Duration,
};
use tracing::{info, instrument};

/// Read timeout so blocking receiver threads can observe cancellation.
const RX_READ_TIMEOUT: Duration = Duration::from_millis(250);

#[instrument]
pub fn create_rx_socket(config: &ListenerConfig) -> PcmRouteResult<UdpSocket> {
    let socket = match (config.multicast_group, config.bind_address) {
        (Some(IpAddr::V4(group)), IpAddr::V4(local_ip)) => {
            create_ipv4_rx_socket(Some(group), local_ip, config.port)?
        }
        (Some(IpAddr::V6(group)), IpAddr::V6(local_ip)) => {
            create_ipv6_rx_socket(Some(group), local_ip, config.port)?
        }
        (None, IpAddr::V4(local_ip)) => create_ipv4_rx_socket(None, local_ip, config.port)?,
        (None, IpAddr::V6(local_ip)) => create_ipv6_rx_socket(None, local_ip, config.port)?,
        _ => {
            return Err(PcmRouteError::InvalidConfig(format!(
                "multicast group and bind address families differ for listener '{}'",
                config.name
            )));
        }
    };

    Ok(socket.into())
}

#[instrument]
fn create_ipv4_rx_socket(
    group: Option<Ipv4Addr>,
    local_ip: Ipv4Addr,
    port: u16,
) -> PcmRouteResult<Socket> {
    info!(
        "Creating IPv4 {} RX socket at {}:{}",
        if group.is_some() { "multicast" } else { "unicast" },
        local_ip,
        port
    );

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(RX_READ_TIMEOUT))?;

    if let Some(group) = group {
        socket.join_multicast_v4(&group, &local_ip)?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(group), port)))?;
    } else {
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(local_ip), port)))?;
    }
    Ok(socket)
}

#[instrument]
fn create_ipv6_rx_socket(
    group: Option<Ipv6Addr>,
    local_ip: Ipv6Addr,
    port: u16,
) -> PcmRouteResult<Socket> {
    info!(
        "Creating IPv6 {} RX socket at {}:{}",
        if group.is_some() { "multicast" } else { "unicast" },
        local_ip,
        port
    );

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(RX_READ_TIMEOUT))?;

    if let Some(group) = group {
        socket.join_multicast_v6(&group, 0)?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(group), port)))?;
    } else {
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(local_ip), port)))?;
    }
    Ok(socket)
}
