//! Loopback suppression for bridged deployments.
//!
//! When the tap side is attached to a bridge that also carries the tunnel's
//! own underlay traffic, the tunnel's UDP datagrams reappear as tap-ingress
//! frames and would be re-encapsulated forever. A frame is a loopback
//! candidate when its inner payload is UDP over IP and either inner address
//! is one of the configured remote peers.

use std::net::IpAddr;

use tracing::debug;

const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
const ETHERTYPE_IPV6: [u8; 2] = [0x86, 0xdd];
const ETHERTYPE_VLAN: [u8; 2] = [0x81, 0x00];

const IPPROTO_UDP: u8 = 17;

/// True when forwarding `frame` would re-encapsulate tunnel traffic.
/// Non-IP, non-UDP and short frames always pass.
pub fn is_loopback_frame(frame: &[u8], peers: &[IpAddr]) -> bool {
    if frame.len() < 14 {
        return false;
    }
    let mut off = 12;
    if frame[off..off + 2] == ETHERTYPE_VLAN {
        off += 4;
    }
    if frame.len() < off + 2 {
        return false;
    }
    let ethertype = [frame[off], frame[off + 1]];
    let ip = &frame[off + 2..];
    if ethertype == ETHERTYPE_IPV4 {
        is_loopback_v4(ip, peers)
    } else if ethertype == ETHERTYPE_IPV6 {
        is_loopback_v6(ip, peers)
    } else {
        false
    }
}

fn is_loopback_v4(ip: &[u8], peers: &[IpAddr]) -> bool {
    if ip.len() < 20 || ip[0] >> 4 != 4 || ip[9] != IPPROTO_UDP {
        return false;
    }
    let src = IpAddr::from([ip[12], ip[13], ip[14], ip[15]]);
    let dst = IpAddr::from([ip[16], ip[17], ip[18], ip[19]]);
    matches_peer(src, dst, peers)
}

fn is_loopback_v6(ip: &[u8], peers: &[IpAddr]) -> bool {
    if ip.len() < 40 || ip[0] >> 4 != 6 || ip[6] != IPPROTO_UDP {
        return false;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&ip[8..24]);
    dst.copy_from_slice(&ip[24..40]);
    matches_peer(IpAddr::from(src), IpAddr::from(dst), peers)
}

fn matches_peer(src: IpAddr, dst: IpAddr, peers: &[IpAddr]) -> bool {
    for peer in peers {
        if src == *peer || dst == *peer {
            debug!(%src, %dst, %peer, "suppressing loopback frame");
            return true;
        }
    }
    false
}
