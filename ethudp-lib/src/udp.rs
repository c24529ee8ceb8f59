//! UDP path endpoints.
//!
//! Each path binds its own socket. With a known remote port the socket is
//! connected and the kernel filters foreign sources. With a remote port of
//! zero the path runs in NAT mode: the socket stays unconnected, outbound
//! traffic is suppressed, and the peer is learned from the first acceptable
//! inbound datagram (authenticated by the shared secret when one is set).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::config::PathSpec;
use crate::control::PathIndex;
use crate::error::Result;
use crate::wire;

/// Socket receive buffer target. Best effort: the kernel clamps it to
/// `net.core.rmem_max` unless the process has CAP_NET_ADMIN.
pub const RECV_BUFFER_BYTES: usize = 40 * 1024 * 1024;

/// Address family of a path's UDP transport; selects the MSS table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFamily {
    Ipv4,
    Ipv6,
}

/// Whether an inbound datagram survives source screening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Deliver,
    Drop,
}

pub struct UdpPath {
    socket: UdpSocket,
    /// Current remote. Immutable once connected; in NAT mode rewritten by
    /// this path's receive task and read by every other task, hence the
    /// atomic swap.
    peer: ArcSwap<SocketAddr>,
    nat: bool,
    transport: TransportFamily,
    index: PathIndex,
}

impl UdpPath {
    /// Bind (and in non-NAT mode connect) the path's socket.
    ///
    /// Must run inside the tokio runtime that will drive the socket.
    pub fn bind(spec: &PathSpec, index: PathIndex) -> Result<Self> {
        let socket = Socket::new(
            Domain::for_address(spec.local),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        if let Err(err) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
            debug!(path = index.name(), %err, "could not grow receive buffer");
        }
        socket.bind(&spec.local.into())?;
        let nat = spec.remote.port() == 0;
        if !nat {
            socket.connect(&spec.remote.into())?;
        }
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        let transport = match spec.local {
            SocketAddr::V4(_) => TransportFamily::Ipv4,
            SocketAddr::V6(_) => TransportFamily::Ipv6,
        };
        info!(
            path = index.name(),
            local = %spec.local,
            remote = %spec.remote,
            nat,
            "udp path ready"
        );
        Ok(Self {
            socket,
            peer: ArcSwap::from_pointee(spec.remote),
            nat,
            transport,
            index,
        })
    }

    pub fn index(&self) -> PathIndex {
        self.index
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_nat(&self) -> bool {
        self.nat
    }

    pub fn transport(&self) -> TransportFamily {
        self.transport
    }

    /// Remote IP for the loopback filter; known even before a NAT peer's
    /// port is, since the remote host is resolved at startup.
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.load().ip()
    }

    /// Send one datagram to the current remote. In NAT mode the send is
    /// suppressed until a peer with a real port has been learned. Transient
    /// errors are logged and the datagram is dropped.
    pub async fn send(&self, payload: &[u8]) {
        if self.nat {
            let peer = **self.peer.load();
            if peer.port() == 0 {
                return;
            }
            if let Err(err) = self.socket.send_to(payload, peer).await {
                debug!(path = self.index.name(), %err, "udp send failed");
            }
        } else if let Err(err) = self.socket.send(payload).await {
            debug!(path = self.index.name(), %err, "udp send failed");
        }
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// NAT-mode source screening over the decrypted payload, per the peer
    /// learning rules:
    ///
    /// - without a password, any source updates the peer; handshake
    ///   datagrams are consumed
    /// - with a password, only a correct handshake updates the peer, and
    ///   data is accepted from the learned peer alone
    ///
    /// Connected paths deliver everything; the kernel already filtered.
    pub fn screen_source(
        &self,
        src: SocketAddr,
        payload: &[u8],
        password: Option<&str>,
    ) -> Delivery {
        if !self.nat {
            return Delivery::Deliver;
        }
        match password {
            None => {
                self.learn_peer(src);
                if payload.starts_with(wire::PASSWORD_PREFIX) {
                    Delivery::Drop
                } else {
                    Delivery::Deliver
                }
            }
            Some(expected) => {
                if let Some(rest) = payload.strip_prefix(wire::PASSWORD_PREFIX) {
                    if wire::password_matches(rest, expected) {
                        self.learn_peer(src);
                    } else {
                        debug!(path = self.index.name(), %src, "handshake with wrong password");
                    }
                    Delivery::Drop
                } else if **self.peer.load() == src {
                    Delivery::Deliver
                } else {
                    debug!(path = self.index.name(), %src, "datagram from unknown source");
                    Delivery::Drop
                }
            }
        }
    }

    fn learn_peer(&self, src: SocketAddr) {
        if **self.peer.load() == src {
            return;
        }
        self.peer.store(Arc::new(src));
        info!(path = self.index.name(), peer = %src, "nat mode, peer changed");
    }
}
