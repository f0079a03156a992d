//! UDP multicast transport
//!
//! Every unit joins the same multicast group and port. One datagram carries
//! one JSON envelope.

use anyhow::{Context, Result};
use crossbeam::channel::{self, Sender, TrySendError};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Inbox, Transport, INBOX_CAPACITY};
use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::protocol::{Envelope, UnitId, MAX_DATAGRAM};

/// Pause after a socket error before receiving again
const RECV_BACKOFF_MS: u64 = 10;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    recv_task: JoinHandle<()>,
}

/// Bind a socket on the configured port and join the multicast group
pub async fn join_group(config: &NetworkConfig) -> Result<(UdpSocket, Ipv4Addr)> {
    let group: Ipv4Addr = config
        .group
        .parse()
        .with_context(|| format!("Invalid multicast group: {}", config.group))?;
    let bind: Ipv4Addr = config
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind))?;

    let std_socket = reusable_socket(SocketAddrV4::new(bind, config.port))
        .with_context(|| format!("Failed to bind UDP port {}", config.port))?;
    let socket = UdpSocket::from_std(std_socket).context("Failed to register UDP socket")?;
    socket
        .join_multicast_v4(group, bind)
        .with_context(|| format!("Failed to join multicast group {}", group))?;
    socket
        .set_multicast_loop_v4(config.multicast_loop)
        .context("Failed to configure multicast loopback")?;

    Ok((socket, group))
}

/// Non-blocking UDP socket that other units and the sniffer can bind alongside
fn reusable_socket(addr: SocketAddrV4) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket.into())
}

impl UdpTransport {
    /// Join the group and start receiving; envelopes from `unit` itself are dropped
    pub async fn bind(config: &NetworkConfig, unit: UnitId) -> Result<(Self, Inbox)> {
        let (socket, group) = join_group(config).await?;
        let socket = Arc::new(socket);
        let (tx, rx) = channel::bounded(INBOX_CAPACITY);

        let recv_task = tokio::spawn(receive_loop(Arc::clone(&socket), tx, unit));

        info!("Joined {}:{} as unit {}", group, config.port, unit);

        Ok((
            Self {
                socket,
                target: SocketAddr::V4(SocketAddrV4::new(group, config.port)),
                recv_task,
            },
            rx,
        ))
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, tx: Sender<Envelope>, unit: UnitId) {
    let mut buf = vec![0u8; MAX_DATAGRAM * 2];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                tokio::time::sleep(Duration::from_millis(RECV_BACKOFF_MS)).await;
                continue;
            }
        };

        let envelope = match Envelope::decode(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                continue;
            }
        };
        if envelope.unit == unit {
            continue;
        }

        trace!("<- {} from {}", envelope, from);
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!("Inbox full, dropping {}", dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Inbox closed, stopping UDP receiver");
                return;
            }
        }
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> &str {
        "udp"
    }

    fn broadcast(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        self.socket.try_send_to(&bytes, self.target)?;
        trace!("-> {}", envelope);
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_is_shared_between_sockets() {
        let first = reusable_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = first.local_addr().unwrap().port();

        let second = reusable_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
