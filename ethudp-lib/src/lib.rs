pub mod cipher;
pub mod config;
pub mod control;
pub mod error;
pub mod loopback;
pub mod mss;
pub mod tap;
pub mod tunnel;
pub mod udp;
pub mod wire;

pub use cipher::{Cipher, CipherAlgorithm};
pub use config::{load_from_path, parse_positionals, Config, Mode, ModeKind, PathSpec};
pub use control::{ControlState, PathIndex, StatusChange};
pub use error::{Result, TunnelError};
pub use tunnel::{run, Tunnel};
pub use udp::{TransportFamily, UdpPath};
pub use wire::Datagram;
