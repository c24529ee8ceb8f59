use std::net::{Ipv4Addr, SocketAddr};

use crate::cipher::CipherAlgorithm;
use crate::error::{Result, TunnelError};

/// How the tunnel reaches the local Layer-2 network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Raw packet socket bound to a physical interface; the only mode that
    /// reconstructs VLAN tags and uses promiscuous mode.
    Ether { interface: String },
    /// TAP device with a locally assigned IPv4 address.
    Tap { address: Ipv4Addr, prefix_len: u8 },
    /// TAP device meant to be enslaved to an existing software bridge.
    /// Bridge membership itself is configured outside the tunnel.
    Bridge { bridge: String },
}

/// Mode selector before its positional payload has been parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Ether,
    Tap,
    Bridge,
}

/// One UDP path. A remote port of zero selects NAT mode: the peer's port
/// is unknown until it introduces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSpec {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct CipherConfig {
    pub algorithm: CipherAlgorithm,
    pub key: String,
}

/// Fully resolved tunnel configuration. Established at startup and
/// immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Master path, optionally followed by the slave path.
    pub paths: Vec<PathSpec>,
    pub password: Option<String>,
    pub cipher: Option<CipherConfig>,
    pub fix_mss: bool,
    pub read_only: bool,
    pub write_only: bool,
    pub no_promisc: bool,
    pub loopback_check: bool,
}

impl Config {
    pub fn master_slave(&self) -> bool {
        self.paths.len() == 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() || self.paths.len() > 2 {
            return Err(TunnelError::Config(format!(
                "expected one or two udp paths, got {}",
                self.paths.len()
            )));
        }
        if self.read_only && self.write_only {
            return Err(TunnelError::Config(
                "read-only and write-only are mutually exclusive".into(),
            ));
        }
        if let Some(cipher) = &self.cipher {
            if cipher.key.is_empty() {
                return Err(TunnelError::EmptyKey);
            }
        }
        if let Mode::Tap { prefix_len, .. } = &self.mode {
            if *prefix_len > 32 {
                return Err(TunnelError::Config(format!(
                    "prefix length {prefix_len} out of range"
                )));
            }
        }
        for path in &self.paths {
            if path.local.is_ipv4() != path.remote.is_ipv4() {
                return Err(TunnelError::Config(format!(
                    "path {} -> {} mixes address families",
                    path.local, path.remote
                )));
            }
        }
        Ok(())
    }
}
