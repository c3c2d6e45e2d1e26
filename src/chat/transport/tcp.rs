//! TCP rendezvous between two peers that both start the same program.
//!
//! Each side first tries to connect out from its local port. If nothing is
//! listening yet, it listens on that local port for a short, random window
//! and accepts only the expected address, then tries connecting out again.
//! Two peers started together therefore cannot both end up listening.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::chat::error::ChatError;
use crate::chat::protocol::Role;
use crate::chat::transport::Connection;

/// Pending incoming connections on the fallback listener.
const LISTEN_BACKLOG: u32 = 128;

/// Upper bound on one outbound connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Milliseconds the fallback listener stays up before dialing again.
const LISTEN_WINDOW_MS: RangeInclusive<u64> = 300..=1500;

/// Resolved peer endpoint plus the local port to use on both paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl PeerAddress {
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.remote_port)
    }

    /// Wildcard address of the peer's family on the local port.
    pub fn local(&self) -> SocketAddr {
        let any = match self.ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(any, self.local_port)
    }

    /// Whether an accepted connection comes from the peer's IP.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        addr.ip().to_canonical() == self.ip.to_canonical()
    }
}

/// Resolve a host name or IP literal, preferring IPv4.
pub async fn resolve(host: &str, remote_port: u16, local_port: u16) -> Result<PeerAddress, ChatError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, remote_port))
        .await
        .map_err(|e| ChatError::Connection(format!("Failed to resolve {}: {}", host, e)))?
        .collect();

    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .ok_or_else(|| ChatError::Connection(format!("No addresses found for {}", host)))?;

    debug!(%host, ip = %addr.ip(), "resolved peer address");

    Ok(PeerAddress {
        ip: addr.ip(),
        remote_port,
        local_port,
    })
}

/// Establish the one TCP stream between the two peers.
///
/// Returns [`Role::Connector`] if an outbound connect succeeded and
/// [`Role::Acceptor`] if the peer connected to us. If both ends dial at
/// the same moment, both get [`Role::Connector`] on a single connection;
/// the handshake driver sorts that out.
pub async fn rendezvous(peer: &PeerAddress) -> Result<(Connection, Role), ChatError> {
    let mut waiting = false;
    loop {
        match dial(peer).await {
            Ok(stream) => {
                info!(peer = %peer.remote(), "connected to peer");
                return Ok((Connection::from_tcp(stream), Role::Connector));
            }
            Err(e) => debug!(peer = %peer.remote(), error = %e, "connect failed, listening instead"),
        }

        if !waiting {
            info!(port = peer.local_port, expected = %peer.ip, "waiting for peer to connect");
            waiting = true;
        }

        let window = Duration::from_millis(rand::thread_rng().gen_range(LISTEN_WINDOW_MS));
        if let Some(stream) = accept_from(peer, window).await? {
            return Ok((Connection::from_tcp(stream), Role::Acceptor));
        }
    }
}

fn new_socket(peer: &PeerAddress) -> io::Result<TcpSocket> {
    let socket = match peer.ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    Ok(socket)
}

async fn dial(peer: &PeerAddress) -> io::Result<TcpStream> {
    let socket = new_socket(peer)?;
    socket.bind(peer.local())?;
    match timeout(CONNECT_TIMEOUT, socket.connect(peer.remote())).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// Listen on the local port for `window`; `None` if the peer did not show.
async fn accept_from(peer: &PeerAddress, window: Duration) -> Result<Option<TcpStream>, ChatError> {
    let socket = new_socket(peer)?;
    socket
        .bind(peer.local())
        .map_err(|e| ChatError::Connection(format!("Failed to bind port {}: {}", peer.local_port, e)))?;
    let listener = socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ChatError::Connection(format!("Failed to listen: {}", e)))?;

    let deadline = Instant::now() + window;
    loop {
        let accepted = match timeout_at(deadline, listener.accept()).await {
            Ok(accepted) => accepted,
            // Take a connection that completed just as the window closed.
            Err(_) => match timeout(Duration::ZERO, listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => return Ok(None),
            },
        };
        let (stream, addr) = accepted.map_err(|e| ChatError::Connection(format!("Failed to accept: {}", e)))?;

        if peer.matches(&addr) {
            info!(%addr, "peer connected");
            return Ok(Some(stream));
        }

        warn!(%addr, expected = %peer.ip, "rejecting connection from unexpected address");
        drop(stream);
    }
}
