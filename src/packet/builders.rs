use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use smallvec::SmallVec;

use super::constants::*;

static ECHO_SEQ: AtomicU16 = AtomicU16::new(1);

/// Next ICMP echo sequence number. Monotonic per process; the value itself
/// never participates in rule matching.
pub fn next_echo_seq() -> u16 {
    ECHO_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// RFC 1071 Internet checksum over `data` (odd trailing byte padded with 0).
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an Ethernet/IPv4/ICMP echo-request frame.
pub fn build_icmp_echo_request(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ident: u16,
    seq: u16,
) -> SmallVec<[u8; 128]> {
    let mut icmp = [0u8; ICMP_HDR_LEN + ECHO_PAYLOAD.len()];
    icmp[0] = ICMP_ECHO_REQUEST;
    icmp[1] = 0; // code
    icmp[4..6].copy_from_slice(&ident.to_be_bytes());
    icmp[6..8].copy_from_slice(&seq.to_be_bytes());
    icmp[8..].copy_from_slice(ECHO_PAYLOAD);
    let csum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let mut frame = SmallVec::new();
    push_ethernet(&mut frame, dst_mac, src_mac);
    push_ipv4(&mut frame, src_ip, dst_ip, IPPROTO_ICMP, icmp.len());
    frame.extend_from_slice(&icmp);
    frame
}

/// Build an Ethernet/IPv4/UDP probe frame with a valid UDP checksum.
pub fn build_udp_probe(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> SmallVec<[u8; 128]> {
    let udp_len = UDP_HDR_LEN + UDP_PROBE_PAYLOAD.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(UDP_PROBE_PAYLOAD);
    let csum = udp_checksum(src_ip, dst_ip, &udp);
    // An all-zero checksum means "not computed"; the wire encoding for a
    // computed zero is 0xffff.
    let csum = if csum == 0 { 0xffff } else { csum };
    udp[6..8].copy_from_slice(&csum.to_be_bytes());

    let mut frame = SmallVec::new();
    push_ethernet(&mut frame, dst_mac, src_mac);
    push_ipv4(&mut frame, src_ip, dst_ip, IPPROTO_UDP, udp.len());
    frame.extend_from_slice(&udp);
    frame
}

fn push_ethernet(frame: &mut SmallVec<[u8; 128]>, dst_mac: [u8; 6], src_mac: [u8; 6]) {
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
}

fn push_ipv4(
    frame: &mut SmallVec<[u8; 128]>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
) {
    let total_len = (IPV4_HDR_LEN + payload_len) as u16;
    let mut hdr = [0u8; IPV4_HDR_LEN];
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[6] = 0x40; // DF, no fragmentation
    hdr[8] = IPV4_TTL;
    hdr[9] = protocol;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    let csum = internet_checksum(&hdr);
    hdr[10..12].copy_from_slice(&csum.to_be_bytes());
    frame.extend_from_slice(&hdr);
}

/// UDP checksum over the IPv4 pseudo-header plus the datagram.
fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, udp: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + udp.len() + 1);
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(IPPROTO_UDP);
    pseudo.extend_from_slice(&(udp.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(udp);
    internet_checksum(&pseudo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parsers;

    const SRC_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xfb, 0x00, 0x01];
    const DST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xfb, 0x00, 0x02];

    #[test]
    fn checksum_of_zero_buffer() {
        assert_eq!(internet_checksum(&[0u8; 8]), 0xffff);
    }

    #[test]
    fn checksum_known_vector() {
        // Example from RFC 1071 section 3: words 0x0001 0xf203 0xf4f5 0xf6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn checksum_handles_odd_length() {
        // Padding with a zero byte must match manual computation.
        let odd = [0xab, 0xcd, 0xef];
        let even = [0xab, 0xcd, 0xef, 0x00];
        assert_eq!(internet_checksum(&odd), internet_checksum(&even));
    }

    #[test]
    fn echo_request_layout() {
        let src = Ipv4Addr::new(10, 210, 1, 1);
        let dst = Ipv4Addr::new(10, 210, 1, 2);
        let frame = build_icmp_echo_request(SRC_MAC, DST_MAC, src, dst, 0x1234, 7);

        assert_eq!(
            frame.len(),
            ETH_HDR_LEN + IPV4_HDR_LEN + ICMP_HDR_LEN + ECHO_PAYLOAD.len()
        );
        assert_eq!(&frame[0..6], &DST_MAC);
        assert_eq!(&frame[6..12], &SRC_MAC);
        assert_eq!(parsers::ethertype(&frame), Some(ETHERTYPE_IPV4));
        assert_eq!(parsers::ipv4_protocol(&frame), Some(IPPROTO_ICMP));
        assert_eq!(parsers::ipv4_src(&frame), Some(src));
        assert_eq!(parsers::ipv4_dst(&frame), Some(dst));
        assert_eq!(parsers::icmp_type(&frame), Some(ICMP_ECHO_REQUEST));
        assert_eq!(parsers::icmp_echo_ident(&frame), Some(0x1234));
        assert_eq!(parsers::icmp_echo_seq(&frame), Some(7));
    }

    #[test]
    fn echo_request_checksums_verify() {
        let frame = build_icmp_echo_request(
            SRC_MAC,
            DST_MAC,
            Ipv4Addr::new(10, 210, 1, 1),
            Ipv4Addr::new(10, 210, 1, 2),
            1,
            1,
        );
        assert!(parsers::verify_ipv4_checksum(&frame));
        // ICMP checksum over the whole ICMP message must fold to zero.
        let icmp = &frame[ETH_HDR_LEN + IPV4_HDR_LEN..];
        assert_eq!(internet_checksum(icmp), 0);
    }

    #[test]
    fn udp_probe_layout() {
        let src = Ipv4Addr::new(10, 210, 1, 1);
        let dst = Ipv4Addr::new(10, 210, 1, 2);
        let frame = build_udp_probe(SRC_MAC, DST_MAC, src, dst, 40000, 9);

        assert_eq!(parsers::ipv4_protocol(&frame), Some(IPPROTO_UDP));
        assert_eq!(parsers::udp_src_port(&frame), Some(40000));
        assert_eq!(parsers::udp_dst_port(&frame), Some(9));
        assert!(parsers::verify_ipv4_checksum(&frame));
        assert_eq!(
            frame.len(),
            ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN + UDP_PROBE_PAYLOAD.len()
        );
    }

    #[test]
    fn sequence_numbers_increment() {
        let a = next_echo_seq();
        let b = next_echo_seq();
        assert_eq!(b, a.wrapping_add(1));
    }
}
