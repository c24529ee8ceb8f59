use std::net::IpAddr;

use ethudp_lib::loopback::is_loopback_frame;

fn peers() -> Vec<IpAddr> {
    vec!["203.0.113.5".parse().unwrap(), "2001:db8::5".parse().unwrap()]
}

/// Ethernet + IPv4 + minimal UDP header.
fn ipv4_udp_frame(src: [u8; 4], dst: [u8; 4], vlan: Option<u16>) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    if let Some(tci) = vlan {
        frame.extend_from_slice(&[0x81, 0x00]);
        frame.extend_from_slice(&tci.to_be_bytes());
    }
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&28u16.to_be_bytes()); // total length
    frame.extend_from_slice(&[0, 0, 0, 0]); // id + frag
    frame.push(64);
    frame.push(17); // udp
    frame.extend_from_slice(&[0, 0]); // checksum
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&[0x17, 0x70, 0x17, 0x70, 0x00, 0x08, 0x00, 0x00]);
    frame
}

fn ipv6_udp_frame(src: [u8; 16], dst: [u8; 16]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.extend_from_slice(&[0x86, 0xdd]);
    frame.push(0x60);
    frame.extend_from_slice(&[0x00, 0x00, 0x00]);
    frame.extend_from_slice(&8u16.to_be_bytes()); // payload length
    frame.push(17); // next header: udp
    frame.push(64);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&[0x17, 0x70, 0x17, 0x70, 0x00, 0x08, 0x00, 0x00]);
    frame
}

fn v6(last: u8) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[0] = 0x20;
    addr[1] = 0x01;
    addr[2] = 0x0d;
    addr[3] = 0xb8;
    addr[15] = last;
    addr
}

#[test]
fn drops_udp_to_a_peer_address() {
    let frame = ipv4_udp_frame([10, 0, 0, 1], [203, 0, 113, 5], None);
    assert!(is_loopback_frame(&frame, &peers()));
}

#[test]
fn drops_udp_from_a_peer_address() {
    let frame = ipv4_udp_frame([203, 0, 113, 5], [10, 0, 0, 1], None);
    assert!(is_loopback_frame(&frame, &peers()));
}

#[test]
fn passes_udp_between_other_hosts() {
    let frame = ipv4_udp_frame([10, 0, 0, 1], [198, 51, 100, 10], None);
    assert!(!is_loopback_frame(&frame, &peers()));
}

#[test]
fn matches_through_a_vlan_tag() {
    let frame = ipv4_udp_frame([10, 0, 0, 1], [203, 0, 113, 5], Some(42));
    assert!(is_loopback_frame(&frame, &peers()));
}

#[test]
fn matches_ipv6_peers() {
    let peer = v6(5);
    assert!(is_loopback_frame(&ipv6_udp_frame(v6(1), peer), &peers()));
    assert!(is_loopback_frame(&ipv6_udp_frame(peer, v6(1)), &peers()));
    assert!(!is_loopback_frame(&ipv6_udp_frame(v6(1), v6(2)), &peers()));
}

#[test]
fn passes_non_udp_traffic() {
    let mut frame = ipv4_udp_frame([10, 0, 0, 1], [203, 0, 113, 5], None);
    frame[23] = 6; // tcp
    assert!(!is_loopback_frame(&frame, &peers()));
}

#[test]
fn passes_non_ip_traffic() {
    let mut frame = ipv4_udp_frame([10, 0, 0, 1], [203, 0, 113, 5], None);
    frame[12] = 0x08;
    frame[13] = 0x06; // arp
    assert!(!is_loopback_frame(&frame, &peers()));
}

#[test]
fn passes_short_frames() {
    assert!(!is_loopback_frame(&[0u8; 13], &peers()));
    // ethertype says IPv4 but the header is truncated
    let mut frame = vec![0u8; 20];
    frame[12] = 0x08;
    frame[13] = 0x00;
    assert!(!is_loopback_frame(&frame, &peers()));
}

#[test]
fn without_peers_nothing_matches() {
    let frame = ipv4_udp_frame([203, 0, 113, 5], [203, 0, 113, 5], None);
    assert!(!is_loopback_frame(&frame, &[]));
}
