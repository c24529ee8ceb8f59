//! The forwarding engine.
//!
//! One [`Tunnel`] owns the tap endpoint, the UDP paths and the shared
//! control state, and drives four tasks: tap-to-UDP, UDP-to-tap for the
//! master, the same for the slave when one is configured, and the
//! one-second keepalive ticker. Every task owns its receive and cipher
//! scratch buffers; the only cross-task writes go through atomics and the
//! per-path peer slot.
//!
//! Nothing on the data path is fatal: a frame or datagram that cannot be
//! forwarded is dropped and the task moves on.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn, Level};

use crate::cipher::{Cipher, BLOCK_LEN};
use crate::config::Config;
use crate::control::{ControlState, PathIndex, StatusChange};
use crate::error::Result;
use crate::tap::{self, TapReader, TapWriter, MAX_FRAME, VLAN_TAG_LEN};
use crate::udp::{Delivery, UdpPath};
use crate::wire::{self, Datagram};
use crate::{loopback, mss};

/// Receive buffers leave room for a reinserted VLAN tag and for cipher
/// growth, so every stage can work in place.
const FRAME_BUF_LEN: usize = MAX_FRAME + VLAN_TAG_LEN + BLOCK_LEN;

struct Shared {
    control: ControlState,
    cipher: Option<Cipher>,
    password: Option<String>,
    fix_mss: bool,
    read_only: bool,
    write_only: bool,
    loopback_check: bool,
    paths: Vec<Arc<UdpPath>>,
}

impl Shared {
    fn path(&self, index: PathIndex) -> Option<&Arc<UdpPath>> {
        self.paths.get(index.as_usize())
    }

    fn peer_ips(&self) -> Vec<IpAddr> {
        self.paths.iter().map(|p| p.peer_ip()).collect()
    }
}

pub struct Tunnel {
    shared: Arc<Shared>,
    reader: TapReader,
    writer: TapWriter,
}

impl Tunnel {
    /// Resolve the configuration into live sockets and devices. Everything
    /// that can fail, fails here; after `run` starts, errors only drop
    /// traffic.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let cipher = match &config.cipher {
            Some(spec) => Some(Cipher::new(spec.algorithm, spec.key.as_bytes())?),
            None => None,
        };
        let mut paths = Vec::with_capacity(config.paths.len());
        for (i, spec) in config.paths.iter().enumerate() {
            let index = if i == 0 { PathIndex::Master } else { PathIndex::Slave };
            paths.push(Arc::new(UdpPath::bind(spec, index)?));
        }
        let (reader, writer) = tap::open(&config)?;
        let shared = Arc::new(Shared {
            control: ControlState::new(config.master_slave()),
            cipher,
            password: config.password,
            fix_mss: config.fix_mss,
            read_only: config.read_only,
            write_only: config.write_only,
            loopback_check: config.loopback_check,
            paths,
        });
        Ok(Self { shared, reader, writer })
    }

    /// Spawn the per-path receive tasks and the ticker, then forward tap
    /// ingress until the process dies.
    pub async fn run(self) -> Result<()> {
        for path in &self.shared.paths {
            tokio::spawn(udp_to_tap(
                path.clone(),
                self.writer.clone(),
                self.shared.clone(),
            ));
        }
        tokio::spawn(keepalive_loop(self.shared.clone()));
        tap_to_udp(self.reader, self.shared).await
    }
}

/// Open and run a tunnel from its configuration.
pub async fn run(config: Config) -> Result<()> {
    Tunnel::open(config).await?.run().await
}

async fn tap_to_udp(mut reader: TapReader, shared: Arc<Shared>) -> Result<()> {
    let mut buf = vec![0u8; FRAME_BUF_LEN];
    let mut scratch = vec![0u8; FRAME_BUF_LEN];
    loop {
        let (len, offset) = match reader.recv_frame(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                debug!(%err, "tap receive failed");
                continue;
            }
        };
        if len < 12 || shared.write_only {
            continue;
        }
        let end = offset + len;
        if shared.loopback_check {
            let peers = shared.peer_ips();
            if loopback::is_loopback_frame(&buf[offset..end], &peers) {
                continue;
            }
        }
        let Some(path) = shared.path(shared.control.current_remote()) else {
            continue;
        };
        if !shared.read_only && shared.fix_mss {
            mss::clamp_mss(&mut buf[offset..end], path.transport());
        }
        if tracing::enabled!(Level::DEBUG) {
            trace_frame("tap ingress", &buf[offset..end]);
        }
        let payload: &[u8] = match &shared.cipher {
            Some(cipher) => {
                let n = cipher.encrypt(&buf[offset..end], &mut scratch);
                if n == 0 {
                    continue;
                }
                &scratch[..n]
            }
            None => &buf[offset..end],
        };
        path.send(payload).await;
    }
}

enum ControlAction {
    Ping,
    Pong,
    Password,
    Data,
}

async fn udp_to_tap(path: Arc<UdpPath>, writer: TapWriter, shared: Arc<Shared>) {
    let index = path.index();
    let mut buf = vec![0u8; FRAME_BUF_LEN];
    let mut scratch = vec![0u8; FRAME_BUF_LEN];
    let mut pong_scratch = [0u8; wire_reply_capacity()];
    loop {
        let (len, src) = match path.recv(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                debug!(path = index.name(), %err, "udp receive failed");
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        let payload_len = match &shared.cipher {
            Some(cipher) => match cipher.decrypt(&buf[..len], &mut scratch) {
                Some(n) if n > 0 => n,
                _ => continue,
            },
            None => len,
        };
        let payload: &mut [u8] = if shared.cipher.is_some() {
            &mut scratch[..payload_len]
        } else {
            &mut buf[..payload_len]
        };

        if path.screen_source(src, payload, shared.password.as_deref()) == Delivery::Drop {
            continue;
        }

        let action = match Datagram::decode(payload) {
            Datagram::Ping => ControlAction::Ping,
            Datagram::Pong => ControlAction::Pong,
            Datagram::Password(_) => ControlAction::Password,
            Datagram::Data(_) => ControlAction::Data,
        };
        match action {
            ControlAction::Ping => {
                shared.control.path(index).counters.record_ping_recv();
                let pong: &[u8] = match &shared.cipher {
                    Some(cipher) => {
                        let n = cipher.encrypt(wire::PONG, &mut pong_scratch);
                        if n == 0 {
                            continue;
                        }
                        &pong_scratch[..n]
                    }
                    None => wire::PONG,
                };
                path.send(pong).await;
                shared.control.path(index).counters.record_pong_send();
            }
            ControlAction::Pong => shared.control.record_pong(index),
            // Peer learning already happened in screen_source; the
            // handshake never reaches the tap.
            ControlAction::Password => {}
            ControlAction::Data => {
                if shared.read_only {
                    continue;
                }
                if !shared.write_only && shared.fix_mss {
                    mss::clamp_mss(payload, path.transport());
                }
                if tracing::enabled!(Level::DEBUG) {
                    trace_frame("udp ingress", payload);
                }
                if let Err(err) = writer.send_frame(payload).await {
                    debug!(path = index.name(), %err, "tap write failed");
                }
            }
        }
    }
}

const fn wire_reply_capacity() -> usize {
    wire::PONG.len() + BLOCK_LEN
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(%err, "SIGHUP handler unavailable, reports are periodic only");
            None
        }
    };
    let password_payload = shared.password.as_ref().map(|pw| wire::encode_password(pw));
    let mut password_scratch =
        vec![0u8; password_payload.as_ref().map_or(0, |p| p.len() + BLOCK_LEN)];
    let mut ping_scratch = [0u8; wire_reply_capacity()];

    // one status line at startup, before the first tick
    shared.control.maybe_report(true);

    loop {
        // SIGHUP forces the report but never skips a tick's keepalive and
        // status work.
        let forced = tokio::select! {
            _ = interval.tick() => false,
            Some(_) = recv_hangup(&mut hangup) => true,
        };
        shared.control.maybe_report(forced);
        shared.control.advance_ticket();

        // The handshake goes out every tick so a peer behind NAT can find
        // us; paths whose own remote is NATed have nowhere to send it.
        if let Some(payload) = &password_payload {
            let bytes: &[u8] = match &shared.cipher {
                Some(cipher) => {
                    let n = cipher.encrypt(payload, &mut password_scratch);
                    if n == 0 {
                        continue;
                    }
                    &password_scratch[..n]
                }
                None => payload,
            };
            for path in &shared.paths {
                if !path.is_nat() {
                    path.send(bytes).await;
                }
            }
        }

        let ping: &[u8] = match &shared.cipher {
            Some(cipher) => {
                let n = cipher.encrypt(wire::PING, &mut ping_scratch);
                if n == 0 {
                    continue;
                }
                &ping_scratch[..n]
            }
            None => wire::PING,
        };
        for path in &shared.paths {
            path.send(ping).await;
            shared.control.path(path.index()).counters.record_ping_send();
            if let Some(change) = shared.control.evaluate_path(path.index()) {
                let current = shared.control.current_remote().name();
                match change {
                    StatusChange::WentBad => {
                        info!(path = path.index().name(), current_remote = current, "path OK --> BAD");
                    }
                    StatusChange::Recovered => {
                        info!(path = path.index().name(), current_remote = current, "path BAD --> OK");
                    }
                }
            }
        }
    }
}

async fn recv_hangup(hangup: &mut Option<Signal>) -> Option<()> {
    match hangup {
        Some(stream) => stream.recv().await,
        None => None,
    }
}

struct Mac<'a>(&'a [u8]);

impl fmt::Display for Mac<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

fn trace_frame(direction: &'static str, frame: &[u8]) {
    if frame.len() < 14 {
        return;
    }
    let dst = Mac(&frame[0..6]);
    let src = Mac(&frame[6..12]);
    if frame[12..14] == [0x81, 0x00] && frame.len() >= 18 {
        tracing::debug!(
            direction,
            %dst,
            %src,
            vlan_id = u16::from_be_bytes([frame[14], frame[15]]) & 0x0fff,
            ethertype = %format_args!("{:#06x}", u16::from_be_bytes([frame[16], frame[17]])),
            len = frame.len(),
            "frame"
        );
    } else {
        tracing::debug!(
            direction,
            %dst,
            %src,
            ethertype = %format_args!("{:#06x}", u16::from_be_bytes([frame[12], frame[13]])),
            len = frame.len(),
            "frame"
        );
    }
}
