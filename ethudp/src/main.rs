#![forbid(unsafe_code)]

use clap::Parser;
use ethudp_lib::config::{self, Config, ModeKind};
use ethudp_lib::{CipherAlgorithm, TunnelError};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ethernet-over-UDP tunnel with redundant paths")]
struct Cli {
    /// Bridge a physical interface over the tunnel (raw Ethernet mode)
    #[arg(short = 'e', group = "mode")]
    ether: bool,

    /// Create a tap interface and assign it an address
    #[arg(short = 'i', group = "mode")]
    interface: bool,

    /// Create a tap interface for an external software bridge
    #[arg(short = 'b', group = "mode")]
    bridge: bool,

    /// Shared secret for NAT peer discovery
    #[arg(short = 'p', long = "password", value_name = "PASSWORD")]
    password: Option<String>,

    /// Encrypt UDP payloads: xor, aes-128, aes-192 or aes-256
    #[arg(long = "enc", value_name = "ALGORITHM")]
    enc: Option<CipherAlgorithm>,

    /// Key for the selected cipher
    #[arg(short = 'k', long = "key", value_name = "KEY")]
    key: Option<String>,

    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short = 'd')]
    debug: bool,

    /// Clamp TCP MSS on SYNs crossing the tunnel
    #[arg(short = 'f')]
    fix_mss: bool,

    /// Read only: never write received datagrams to the local side
    #[arg(short = 'r')]
    read_only: bool,

    /// Write only: never forward local frames to the remote
    #[arg(short = 'w')]
    write_only: bool,

    /// Leave the interface out of promiscuous mode (raw Ethernet mode)
    #[arg(long = "nopromisc")]
    no_promisc: bool,

    /// Disable the loopback filter that read-only mode enables
    #[arg(long = "noloopcheck")]
    no_loopback_check: bool,

    /// Load the tunnel description from a TOML file instead of
    /// positional arguments
    #[arg(long = "config", value_name = "FILE", conflicts_with = "mode")]
    config: Option<PathBuf>,

    /// Per mode: local-ip local-port remote-ip remote-port, then the
    /// interface name (-e), address and prefix length (-i) or bridge name
    /// (-b); a second address tuple enables the slave path
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match build_config(&cli) {
        Ok(cfg) => {
            info!(
                mode = ?cfg.mode,
                paths = cfg.paths.len(),
                cipher = cfg.cipher.as_ref().map(|c| c.algorithm.to_string()),
                "configuration loaded"
            );
            if let Err(err) = ethudp_lib::run(cfg).await {
                error!(%err, "tunnel exited with error");
                std::process::exit(1);
            }
        }
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    }
}

fn build_config(cli: &Cli) -> Result<Config, TunnelError> {
    if let Some(path) = &cli.config {
        return config::load_from_path(path);
    }
    let kind = if cli.ether {
        ModeKind::Ether
    } else if cli.interface {
        ModeKind::Tap
    } else if cli.bridge {
        ModeKind::Bridge
    } else {
        return Err(TunnelError::Config(
            "one of -e, -i, -b or --config is required".into(),
        ));
    };
    let (mode, paths) = config::parse_positionals(kind, &cli.args)?;
    let cfg = Config {
        mode,
        paths,
        password: cli.password.clone(),
        cipher: cli.enc.map(|algorithm| config::CipherConfig {
            algorithm,
            key: cli.key.clone().unwrap_or_default(),
        }),
        fix_mss: cli.fix_mss,
        read_only: cli.read_only,
        write_only: cli.write_only,
        no_promisc: cli.no_promisc,
        loopback_check: cli.read_only && !cli.no_loopback_check,
    };
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
