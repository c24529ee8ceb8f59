use std::fs;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;

use crate::cipher::CipherAlgorithm;
use crate::config::{CipherConfig, Config, Mode, ModeKind, PathSpec};
use crate::error::{Result, TunnelError};

/// Parse the positional arguments of one mode into its payload and paths.
///
/// Every mode starts with a `(local-ip, local-port, remote-ip, remote-port)`
/// tuple, followed by the mode payload (interface name, address + prefix
/// length, or bridge name). A trailing second tuple enables the slave path.
pub fn parse_positionals(kind: ModeKind, args: &[String]) -> Result<(Mode, Vec<PathSpec>)> {
    let payload_len = match kind {
        ModeKind::Ether | ModeKind::Bridge => 1,
        ModeKind::Tap => 2,
    };
    let single = 4 + payload_len;
    let dual = single + 4;
    if args.len() != single && args.len() != dual {
        return Err(TunnelError::Config(format!(
            "expected {single} or {dual} positional arguments, got {}",
            args.len()
        )));
    }

    let mut paths = vec![parse_tuple(&args[0..4])?];
    if args.len() == dual {
        paths.push(parse_tuple(&args[single..single + 4])?);
    }

    let payload = &args[4..single];
    let mode = match kind {
        ModeKind::Ether => Mode::Ether { interface: payload[0].clone() },
        ModeKind::Bridge => Mode::Bridge { bridge: payload[0].clone() },
        ModeKind::Tap => {
            let address: Ipv4Addr = payload[0]
                .parse()
                .map_err(|_| TunnelError::Config(format!("invalid tap address '{}'", payload[0])))?;
            let prefix_len: u8 = payload[1]
                .parse()
                .map_err(|_| TunnelError::Config(format!("invalid prefix length '{}'", payload[1])))?;
            Mode::Tap { address, prefix_len }
        }
    };
    Ok((mode, paths))
}

fn parse_tuple(tuple: &[String]) -> Result<PathSpec> {
    let local_port = parse_port(&tuple[1])?;
    let remote_port = parse_port(&tuple[3])?;
    resolve_path(&tuple[0], local_port, &tuple[2], remote_port)
}

fn parse_port(text: &str) -> Result<u16> {
    text.parse()
        .map_err(|_| TunnelError::Config(format!("invalid port '{text}'")))
}

/// Resolve both ends and pick the first local/remote pair sharing an
/// address family, so a dual-stack hostname cannot pair an IPv6 local with
/// an IPv4 remote.
fn resolve_path(
    local_host: &str,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Result<PathSpec> {
    let locals = lookup(local_host, local_port)?;
    let remotes = lookup(remote_host, remote_port)?;
    for local in &locals {
        for remote in &remotes {
            if local.is_ipv4() == remote.is_ipv4() {
                return Ok(PathSpec { local: *local, remote: *remote });
            }
        }
    }
    Err(TunnelError::FamilyMismatch(format!(
        "{local_host}:{local_port} -> {remote_host}:{remote_port}"
    )))
}

fn lookup(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| TunnelError::Resolve(format!("{host}:{port}: {err}")))?
        .collect();
    if addrs.is_empty() {
        return Err(TunnelError::Resolve(format!("{host}:{port}: no addresses")));
    }
    Ok(addrs)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FileMode {
    Ether,
    Tap,
    Bridge,
}

#[derive(Debug, Deserialize)]
struct FilePath {
    local: String,
    remote: String,
}

#[derive(Debug, Deserialize)]
struct FileCipher {
    algorithm: CipherAlgorithm,
    key: String,
}

/// TOML rendition of the CLI surface.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: FileMode,
    /// Physical interface to bridge (mode = "ether")
    interface: Option<String>,
    /// Address assigned to the tap device (mode = "tap")
    address: Option<Ipv4Addr>,
    /// Prefix length for `address` (mode = "tap")
    prefix_len: Option<u8>,
    /// Bridge the tap device is meant to join (mode = "bridge")
    bridge: Option<String>,
    password: Option<String>,
    cipher: Option<FileCipher>,
    #[serde(default)]
    fix_mss: bool,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    write_only: bool,
    #[serde(default)]
    no_promisc: bool,
    #[serde(default)]
    no_loopback_check: bool,
    /// Master path first; a second entry enables the slave path.
    #[serde(rename = "path")]
    paths: Vec<FilePath>,
}

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| TunnelError::Config(format!("Failed to read config file: {e}")))?;
    let file: FileConfig = toml::from_str(&txt)
        .map_err(|e| TunnelError::Config(format!("Failed to parse config: {e}")))?;

    let mode = match file.mode {
        FileMode::Ether => Mode::Ether {
            interface: file
                .interface
                .ok_or_else(|| TunnelError::Config("mode = \"ether\" requires interface".into()))?,
        },
        FileMode::Bridge => Mode::Bridge {
            bridge: file
                .bridge
                .ok_or_else(|| TunnelError::Config("mode = \"bridge\" requires bridge".into()))?,
        },
        FileMode::Tap => Mode::Tap {
            address: file
                .address
                .ok_or_else(|| TunnelError::Config("mode = \"tap\" requires address".into()))?,
            prefix_len: file
                .prefix_len
                .ok_or_else(|| TunnelError::Config("mode = \"tap\" requires prefix_len".into()))?,
        },
    };

    let mut paths = Vec::with_capacity(file.paths.len());
    for path in &file.paths {
        paths.push(PathSpec {
            local: resolve_endpoint(&path.local)?,
            remote: resolve_endpoint(&path.remote)?,
        });
    }

    let config = Config {
        mode,
        paths,
        password: file.password,
        cipher: file.cipher.map(|c| CipherConfig { algorithm: c.algorithm, key: c.key }),
        fix_mss: file.fix_mss,
        read_only: file.read_only,
        write_only: file.write_only,
        no_promisc: file.no_promisc,
        loopback_check: file.read_only && !file.no_loopback_check,
    };
    config.validate()?;
    Ok(config)
}

fn resolve_endpoint(text: &str) -> Result<SocketAddr> {
    let mut addrs = text
        .to_socket_addrs()
        .map_err(|err| TunnelError::Resolve(format!("{text}: {err}")))?;
    addrs
        .next()
        .ok_or_else(|| TunnelError::Resolve(format!("{text}: no addresses")))
}
