//! Datagram classification for the tunnel's UDP channel.
//!
//! Control traffic (keepalives and the peer-discovery handshake) shares the
//! UDP channel with encapsulated Ethernet frames and is identified purely by
//! the leading bytes of the decrypted payload. A frame whose first bytes
//! happen to spell a control prefix is misclassified; the prefixes were
//! chosen so that no sane Ethernet destination address produces them, and
//! the collision is an accepted limitation of the wire format.

/// Liveness probe, sent once per second on every path.
pub const PING: &[u8] = b"PING:PING:";
/// Reply to [`PING`], echoed on the path the probe arrived on.
pub const PONG: &[u8] = b"PONG:PONG:";
/// Prefix of the shared-secret handshake used to discover NATed peers.
pub const PASSWORD_PREFIX: &[u8] = b"PASSWORD:";

/// A decrypted UDP payload, classified by prefix.
#[derive(Debug, PartialEq, Eq)]
pub enum Datagram<'a> {
    Ping,
    Pong,
    /// The bytes after `PASSWORD:`; a well-formed handshake carries the
    /// password followed by a NUL.
    Password(&'a [u8]),
    /// An encapsulated Ethernet frame.
    Data(&'a [u8]),
}

impl<'a> Datagram<'a> {
    pub fn decode(payload: &'a [u8]) -> Self {
        if payload.starts_with(PING) {
            Datagram::Ping
        } else if payload.starts_with(PONG) {
            Datagram::Pong
        } else if let Some(rest) = payload.strip_prefix(PASSWORD_PREFIX) {
            Datagram::Password(rest)
        } else {
            Datagram::Data(payload)
        }
    }
}

/// Encode the handshake payload: `PASSWORD:<password>\0`.
pub fn encode_password(password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PASSWORD_PREFIX.len() + password.len() + 1);
    buf.extend_from_slice(PASSWORD_PREFIX);
    buf.extend_from_slice(password.as_bytes());
    buf.push(0);
    buf
}

/// Check the bytes following `PASSWORD:` against the configured secret.
///
/// The handshake is only accepted when the password matches exactly and is
/// NUL-terminated, so a configured password that is a prefix of the offered
/// one (or vice versa) is rejected.
pub fn password_matches(rest: &[u8], expected: &str) -> bool {
    let expected = expected.as_bytes();
    rest.len() > expected.len() && &rest[..expected.len()] == expected && rest[expected.len()] == 0
}
