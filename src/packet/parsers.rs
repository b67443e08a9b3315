use std::net::Ipv4Addr;

use super::constants::*;
use super::types::{PacketDescriptor, ProtocolKind};

#[inline]
pub fn ethertype(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    Some(u16::from_be_bytes([frame[12], frame[13]]))
}

/// Length of the IPv4 header in bytes (IHL * 4), validated against the frame.
#[inline]
pub fn ipv4_header_len(frame: &[u8]) -> Option<usize> {
    if ethertype(frame)? != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = frame.get(ETH_HDR_LEN..)?;
    let first = *ip.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(first & 0x0f) * 4;
    if ihl < IPV4_HDR_LEN || ip.len() < ihl {
        return None;
    }
    Some(ihl)
}

#[inline]
pub fn ipv4_protocol(frame: &[u8]) -> Option<u8> {
    ipv4_header_len(frame)?;
    Some(frame[ETH_HDR_LEN + 9])
}

#[inline]
pub fn ipv4_src(frame: &[u8]) -> Option<Ipv4Addr> {
    ipv4_header_len(frame)?;
    let o = &frame[ETH_HDR_LEN + 12..ETH_HDR_LEN + 16];
    Some(Ipv4Addr::new(o[0], o[1], o[2], o[3]))
}

#[inline]
pub fn ipv4_dst(frame: &[u8]) -> Option<Ipv4Addr> {
    ipv4_header_len(frame)?;
    let o = &frame[ETH_HDR_LEN + 16..ETH_HDR_LEN + 20];
    Some(Ipv4Addr::new(o[0], o[1], o[2], o[3]))
}

/// Offset of the transport payload within the frame.
#[inline]
fn transport_offset(frame: &[u8]) -> Option<usize> {
    Some(ETH_HDR_LEN + ipv4_header_len(frame)?)
}

#[inline]
pub fn icmp_type(frame: &[u8]) -> Option<u8> {
    if ipv4_protocol(frame)? != IPPROTO_ICMP {
        return None;
    }
    let off = transport_offset(frame)?;
    frame.get(off).copied()
}

#[inline]
pub fn icmp_echo_ident(frame: &[u8]) -> Option<u16> {
    icmp_type(frame)?;
    let off = transport_offset(frame)?;
    let b = frame.get(off + 4..off + 6)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

#[inline]
pub fn icmp_echo_seq(frame: &[u8]) -> Option<u16> {
    icmp_type(frame)?;
    let off = transport_offset(frame)?;
    let b = frame.get(off + 6..off + 8)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

#[inline]
pub fn udp_src_port(frame: &[u8]) -> Option<u16> {
    if ipv4_protocol(frame)? != IPPROTO_UDP {
        return None;
    }
    let off = transport_offset(frame)?;
    let b = frame.get(off..off + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

#[inline]
pub fn udp_dst_port(frame: &[u8]) -> Option<u16> {
    if ipv4_protocol(frame)? != IPPROTO_UDP {
        return None;
    }
    let off = transport_offset(frame)?;
    let b = frame.get(off + 2..off + 4)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Does `frame` look like the peer's answer to `request`?
///
/// For an echo request that is the matching echo reply (addresses swapped,
/// identifier and sequence preserved). For a UDP probe it is any UDP
/// datagram flowing back on the reversed 4-tuple.
pub fn is_reply_to(request: &PacketDescriptor, frame: &[u8]) -> bool {
    let addrs_swapped = ipv4_src(frame) == Some(request.dst_ip())
        && ipv4_dst(frame) == Some(request.src_ip());
    if !addrs_swapped {
        return false;
    }

    match request.kind() {
        ProtocolKind::IcmpEchoRequest => {
            icmp_type(frame) == Some(ICMP_ECHO_REPLY)
                && icmp_echo_ident(frame) == Some(request.echo_ident())
                && icmp_echo_seq(frame) == Some(request.echo_seq())
        }
        ProtocolKind::UdpProbe { src_port, dst_port } => {
            udp_src_port(frame) == Some(*dst_port) && udp_dst_port(frame) == Some(*src_port)
        }
    }
}

/// Validate the IPv4 header checksum of a frame (used in tests).
pub fn verify_ipv4_checksum(frame: &[u8]) -> bool {
    match ipv4_header_len(frame) {
        Some(ihl) => {
            super::builders::internet_checksum(&frame[ETH_HDR_LEN..ETH_HDR_LEN + ihl]) == 0
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::builders::{build_icmp_echo_request, build_udp_probe, internet_checksum};

    const MAC_A: [u8; 6] = [0x52, 0x54, 0x00, 0xfb, 0x00, 0x01];
    const MAC_B: [u8; 6] = [0x52, 0x54, 0x00, 0xfb, 0x00, 0x02];

    fn addrs() -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::new(10, 210, 1, 1), Ipv4Addr::new(10, 210, 1, 2))
    }

    /// Build the echo reply the kernel would send back for `request`.
    fn synthesize_echo_reply(request: &[u8]) -> Vec<u8> {
        let mut reply = request.to_vec();
        // Swap MACs
        let (dst, src) = (reply[0..6].to_vec(), reply[6..12].to_vec());
        reply[0..6].copy_from_slice(&src);
        reply[6..12].copy_from_slice(&dst);
        // Swap IPs and refresh the header checksum
        let (sip, dip) = (
            reply[ETH_HDR_LEN + 12..ETH_HDR_LEN + 16].to_vec(),
            reply[ETH_HDR_LEN + 16..ETH_HDR_LEN + 20].to_vec(),
        );
        reply[ETH_HDR_LEN + 12..ETH_HDR_LEN + 16].copy_from_slice(&dip);
        reply[ETH_HDR_LEN + 16..ETH_HDR_LEN + 20].copy_from_slice(&sip);
        reply[ETH_HDR_LEN + 10..ETH_HDR_LEN + 12].copy_from_slice(&[0, 0]);
        let csum = internet_checksum(&reply[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN]);
        reply[ETH_HDR_LEN + 10..ETH_HDR_LEN + 12].copy_from_slice(&csum.to_be_bytes());
        // Type 8 -> 0, refresh ICMP checksum
        let off = ETH_HDR_LEN + IPV4_HDR_LEN;
        reply[off] = ICMP_ECHO_REPLY;
        reply[off + 2..off + 4].copy_from_slice(&[0, 0]);
        let csum = internet_checksum(&reply[off..]);
        reply[off + 2..off + 4].copy_from_slice(&csum.to_be_bytes());
        reply
    }

    #[test]
    fn short_frames_are_rejected() {
        assert_eq!(ethertype(&[0u8; 4]), None);
        assert_eq!(ipv4_protocol(&[0u8; 20]), None);
        assert_eq!(icmp_type(&[]), None);
    }

    #[test]
    fn echo_reply_matches_its_request() {
        let (src, dst) = addrs();
        let request = crate::packet::PacketDescriptor::from_frame(
            ProtocolKind::IcmpEchoRequest,
            build_icmp_echo_request(MAC_A, MAC_B, src, dst, 0xbeef, 3),
            src,
            dst,
            0xbeef,
            3,
        );
        let reply = synthesize_echo_reply(request.frame());
        assert!(is_reply_to(&request, &reply));
    }

    #[test]
    fn echo_reply_with_wrong_ident_is_ignored() {
        let (src, dst) = addrs();
        let request = crate::packet::PacketDescriptor::from_frame(
            ProtocolKind::IcmpEchoRequest,
            build_icmp_echo_request(MAC_A, MAC_B, src, dst, 0xbeef, 3),
            src,
            dst,
            0xbeef,
            3,
        );
        // A reply-direction frame with a foreign identifier.
        let mut reply = build_icmp_echo_request(MAC_B, MAC_A, dst, src, 0xdead, 3).to_vec();
        reply[ETH_HDR_LEN + IPV4_HDR_LEN] = ICMP_ECHO_REPLY;
        assert!(!is_reply_to(&request, &reply));
    }

    #[test]
    fn request_does_not_match_itself() {
        let (src, dst) = addrs();
        let request = crate::packet::PacketDescriptor::from_frame(
            ProtocolKind::IcmpEchoRequest,
            build_icmp_echo_request(MAC_A, MAC_B, src, dst, 1, 1),
            src,
            dst,
            1,
            1,
        );
        assert!(!is_reply_to(&request, request.frame()));
    }

    #[test]
    fn udp_reply_matches_on_reversed_tuple() {
        let (src, dst) = addrs();
        let request = crate::packet::PacketDescriptor::from_frame(
            ProtocolKind::UdpProbe {
                src_port: 40000,
                dst_port: 9,
            },
            build_udp_probe(MAC_A, MAC_B, src, dst, 40000, 9),
            src,
            dst,
            0,
            0,
        );
        let reply_frame = build_udp_probe(MAC_B, MAC_A, dst, src, 9, 40000);
        assert!(is_reply_to(&request, &reply_frame));
        // Same direction as the request: not a reply.
        assert!(!is_reply_to(&request, request.frame()));
    }

    #[test]
    fn arp_frames_never_match() {
        let (src, dst) = addrs();
        let request = crate::packet::PacketDescriptor::from_frame(
            ProtocolKind::IcmpEchoRequest,
            build_icmp_echo_request(MAC_A, MAC_B, src, dst, 1, 1),
            src,
            dst,
            1,
            1,
        );
        let mut arp = vec![0u8; 42];
        arp[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        assert!(!is_reply_to(&request, &arp));
    }
}
