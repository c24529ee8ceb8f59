use ethudp_lib::mss::{clamp_mss, tcp_checksum_v4, tcp_checksum_v6};
use ethudp_lib::TransportFamily;

/// Ethernet + IPv4 + TCP SYN with a single MSS option. Offsets (untagged):
/// IP header at 14, TCP at 34, MSS option bytes at 54..58.
fn ipv4_syn_frame(mss: u16, vlan: Option<u16>) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src
    if let Some(tci) = vlan {
        frame.extend_from_slice(&[0x81, 0x00]);
        frame.extend_from_slice(&tci.to_be_bytes());
    }
    frame.extend_from_slice(&[0x08, 0x00]);

    let tcp = tcp_syn_segment(mss);
    let total_len = (20 + tcp.len()) as u16;
    let src_ip = [192, 0, 2, 1];
    let dst_ip = [198, 51, 100, 2];
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]); // id
    frame.extend_from_slice(&[0x40, 0x00]); // DF, fragment offset 0
    frame.push(64); // ttl
    frame.push(6); // tcp
    frame.extend_from_slice(&[0x00, 0x00]); // header checksum (unused here)
    frame.extend_from_slice(&src_ip);
    frame.extend_from_slice(&dst_ip);

    let mut tcp = tcp;
    let sum = tcp_checksum_v4(src_ip, dst_ip, &tcp);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());
    frame.extend_from_slice(&tcp);
    frame
}

/// Ethernet + IPv6 + TCP SYN with a single MSS option. TCP starts at 54.
fn ipv6_syn_frame(mss: u16) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.extend_from_slice(&[0x86, 0xdd]);

    let tcp = tcp_syn_segment(mss);
    let mut src_ip = [0u8; 16];
    src_ip[0] = 0x20;
    src_ip[1] = 0x01;
    src_ip[15] = 0x01;
    let mut dst_ip = src_ip;
    dst_ip[15] = 0x02;
    frame.push(0x60);
    frame.extend_from_slice(&[0x00, 0x00, 0x00]);
    frame.extend_from_slice(&(tcp.len() as u16).to_be_bytes());
    frame.push(6); // next header: tcp
    frame.push(64); // hop limit
    frame.extend_from_slice(&src_ip);
    frame.extend_from_slice(&dst_ip);

    let mut tcp = tcp;
    let sum = tcp_checksum_v6(src_ip, dst_ip, &tcp);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());
    frame.extend_from_slice(&tcp);
    frame
}

/// 24-byte TCP SYN: base header plus `02 04 mss`. Checksum left zero.
fn tcp_syn_segment(mss: u16) -> Vec<u8> {
    let mut tcp = Vec::new();
    tcp.extend_from_slice(&48000u16.to_be_bytes()); // sport
    tcp.extend_from_slice(&80u16.to_be_bytes()); // dport
    tcp.extend_from_slice(&1u32.to_be_bytes()); // seq
    tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
    tcp.push(6 << 4); // data offset: 24 bytes
    tcp.push(0x02); // SYN
    tcp.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    tcp.extend_from_slice(&[0x00, 0x00]); // checksum
    tcp.extend_from_slice(&[0x00, 0x00]); // urgent
    tcp.push(2); // MSS option
    tcp.push(4);
    tcp.extend_from_slice(&mss.to_be_bytes());
    tcp
}

fn fold16(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}

fn sum_be_words(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// One's-complement total over pseudo-header and segment, checksum field
/// included, must come out as 0xffff for a valid TCP checksum.
fn ipv4_checksum_is_valid(frame: &[u8], ip_off: usize) -> bool {
    let ip = &frame[ip_off..];
    let ihl = (ip[0] & 0x0f) as usize * 4;
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    let segment = &ip[ihl..total_len];
    let mut sum = sum_be_words(&ip[12..20]); // src + dst
    sum += 6;
    sum += segment.len() as u32;
    sum += sum_be_words(segment);
    fold16(sum) == 0xffff
}

fn ipv6_checksum_is_valid(frame: &[u8], ip_off: usize) -> bool {
    let ip = &frame[ip_off..];
    let payload_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
    let segment = &ip[40..40 + payload_len];
    let mut sum = sum_be_words(&ip[8..40]); // src + dst
    sum += 6;
    sum += segment.len() as u32;
    sum += sum_be_words(segment);
    fold16(sum) == 0xffff
}

#[test]
fn clamps_ipv4_syn_over_ipv4_transport() {
    let mut frame = ipv4_syn_frame(1460, None);
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(&frame[56..58], &[0x05, 0x8a], "1460 must become 1418");
    assert!(ipv4_checksum_is_valid(&frame, 14));
}

#[test]
fn clamps_ipv4_syn_over_ipv6_transport() {
    let mut frame = ipv4_syn_frame(1460, None);
    clamp_mss(&mut frame, TransportFamily::Ipv6);
    assert_eq!(u16::from_be_bytes([frame[56], frame[57]]), 1398);
    assert!(ipv4_checksum_is_valid(&frame, 14));
}

#[test]
fn never_raises_the_mss() {
    let pristine = ipv4_syn_frame(1300, None);
    let mut frame = pristine.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine, "a small MSS must pass unchanged");

    // boundary: exactly the clamp value is left alone
    let pristine = ipv4_syn_frame(1418, None);
    let mut frame = pristine.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine);
}

#[test]
fn vlan_tag_costs_four_more_bytes() {
    let mut frame = ipv4_syn_frame(1460, Some(100));
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    // MSS option sits 4 bytes later in a tagged frame
    assert_eq!(u16::from_be_bytes([frame[60], frame[61]]), 1414);
    // the tag itself is untouched
    assert_eq!(&frame[12..16], &[0x81, 0x00, 0x00, 0x64]);
    assert!(ipv4_checksum_is_valid(&frame, 18));
}

#[test]
fn clamps_ipv6_syn_per_transport() {
    // IPv6 header ends at 54, TCP options at 74, MSS value at 76..78
    let mut frame = ipv6_syn_frame(1460);
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(u16::from_be_bytes([frame[76], frame[77]]), 1398);
    assert!(ipv6_checksum_is_valid(&frame, 14));

    let mut frame = ipv6_syn_frame(1460);
    clamp_mss(&mut frame, TransportFamily::Ipv6);
    assert_eq!(u16::from_be_bytes([frame[76], frame[77]]), 1378);
    assert!(ipv6_checksum_is_valid(&frame, 14));
}

#[test]
fn ignores_non_syn_segments() {
    let pristine = {
        let mut f = ipv4_syn_frame(1460, None);
        f[47] = 0x10; // ACK instead of SYN
        f
    };
    let mut frame = pristine.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine);
}

#[test]
fn ignores_later_fragments() {
    let pristine = {
        let mut f = ipv4_syn_frame(1460, None);
        f[20] = 0x00;
        f[21] = 0x01; // fragment offset 1
        f
    };
    let mut frame = pristine.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine);
}

#[test]
fn ignores_non_tcp_and_non_ip() {
    let pristine = {
        let mut f = ipv4_syn_frame(1460, None);
        f[23] = 17; // UDP
        f
    };
    let mut frame = pristine.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine);

    let pristine = {
        let mut f = ipv4_syn_frame(1460, None);
        f[12] = 0x08;
        f[13] = 0x06; // ARP
        f
    };
    let mut frame = pristine.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine);
}

#[test]
fn ignores_short_frames() {
    let mut frame = vec![0u8; 53];
    let pristine = frame.clone();
    clamp_mss(&mut frame, TransportFamily::Ipv4);
    assert_eq!(frame, pristine);
}

#[test]
fn finds_the_mss_option_behind_nops() {
    // 28-byte TCP header: NOP NOP MSS(4) then two EOL padding bytes
    let mut frame = ipv4_syn_frame(1460, None);
    let mut tcp = frame.split_off(34);
    tcp.truncate(20);
    tcp[12] = 7 << 4; // data offset: 28 bytes
    tcp.extend_from_slice(&[1, 1, 2, 4, 0x05, 0xb4, 0, 0]);
    frame[16..18].copy_from_slice(&(20u16 + 28).to_be_bytes());
    tcp[16] = 0;
    tcp[17] = 0;
    let sum = tcp_checksum_v4([192, 0, 2, 1], [198, 51, 100, 2], &tcp);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());
    frame.extend_from_slice(&tcp);

    clamp_mss(&mut frame, TransportFamily::Ipv4);
    // MSS value now sits at offset 34 + 20 + 2 (NOP NOP) + 2 (kind, len)
    assert_eq!(u16::from_be_bytes([frame[58], frame[59]]), 1418);
    assert!(ipv4_checksum_is_valid(&frame, 14));
}
