//! Transport seam over the unreliable datagram substrate.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::warn;

/// Largest datagram either role will send or accept.
pub const MAX_DATAGRAM: usize = 60 * 1024;

/// An inbound datagram, tagged with the logical address of its sender.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Point-to-point unreliable message substrate.
///
/// Delivery may drop or duplicate datagrams but preserves the integrity of
/// whatever arrives; the commit protocol is built on exactly that profile.
/// Sends are best-effort: implementations log transmission faults and
/// swallow them, since the caller retransmits on timeout anyway.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: &str, payload: Vec<u8>) -> impl Future<Output = ()> + Send;

    /// Blocks until a datagram arrives. `None` means the substrate shut
    /// down and no further messages will ever arrive.
    fn recv(&self) -> impl Future<Output = Option<Inbound>> + Send;
}

/// UDP transport with a logical-name peer table.
///
/// Outbound addresses are resolved through the table first, falling back to
/// `host:port` literals, so a participant can answer the coordinator without
/// carrying a table of its own: it just replies to [`Inbound::from`].
pub struct UdpTransport {
    socket: UdpSocket,
    peers: HashMap<String, SocketAddr>,
    names: HashMap<SocketAddr, String>,
}

impl UdpTransport {
    /// Bind on `port` with the given logical-name peer table.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(port: u16, peers: HashMap<String, SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let names = peers.iter().map(|(n, a)| (*a, n.clone())).collect();
        Ok(Self {
            socket,
            peers,
            names,
        })
    }

    fn resolve(&self, to: &str) -> Option<SocketAddr> {
        self.peers.get(to).copied().or_else(|| to.parse().ok())
    }
}

impl Transport for UdpTransport {
    async fn send(&self, to: &str, payload: Vec<u8>) {
        let Some(addr) = self.resolve(to) else {
            warn!(to, "dropping datagram for unresolvable peer");
            return;
        };
        if payload.len() > MAX_DATAGRAM {
            warn!(to, len = payload.len(), "dropping oversized datagram");
            return;
        }
        if let Err(e) = self.socket.send_to(&payload, addr).await {
            warn!(to, error = %e, "datagram send failed");
        }
    }

    async fn recv(&self) -> Option<Inbound> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    let from = self
                        .names
                        .get(&addr)
                        .cloned()
                        .unwrap_or_else(|| addr.to_string());
                    return Some(Inbound {
                        from,
                        payload: buf[..len].to_vec(),
                    });
                }
                // Transient socket errors (e.g. ICMP-reflected resets on
                // some platforms) are indistinguishable from loss.
                Err(e) => warn!(error = %e, "datagram receive failed"),
            }
        }
    }
}
