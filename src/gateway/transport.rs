//! UDP plumbing between the bridge and the gateways.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to bind gateway port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("unable to join multicast group {group}: {source}")]
    Multicast { group: Ipv4Addr, source: io::Error },
}

/// Fire-and-forget datagram sender. Implementations must not block.
pub trait GatewayTransport {
    fn send(&mut self, payload: &str, to: SocketAddr);
}

/// Binds the listener for all inbound gateway traffic and joins the
/// discovery group on it.
pub async fn bind(port: u16, group: Ipv4Addr) -> Result<UdpSocket, TransportError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .await
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AddrInUse {
                info!("use 'lsof -i -P' to check for ports used.");
            }
            TransportError::Bind { port, source }
        })?;

    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .map_err(|source| TransportError::Multicast { group, source })?;

    info!("Listening for gateways on UDP port {} (group {})", port, group);
    Ok(socket)
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl GatewayTransport for UdpTransport {
    fn send(&mut self, payload: &str, to: SocketAddr) {
        trace!("Send {} to {}", payload, to);
        if let Err(e) = self.socket.try_send_to(payload.as_bytes(), to) {
            error!("Failed to send datagram to {}: {}", to, e);
        }
    }
}
