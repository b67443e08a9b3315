// Wire-format constants for the frames the harness builds and matches.

pub const ETH_HDR_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
#[allow(dead_code)]
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const IPV4_HDR_LEN: usize = 20;
pub const IPV4_TTL: u8 = 64;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;

pub const ICMP_HDR_LEN: usize = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

pub const UDP_HDR_LEN: usize = 8;

/// Fixed benign payload carried by echo requests. 48 bytes, mirroring the
/// classic ping payload size.
pub const ECHO_PAYLOAD: &[u8; 48] = b"fwprobe-echo-payload-0123456789abcdefghijklmnopq";

/// Payload for UDP probe datagrams.
pub const UDP_PROBE_PAYLOAD: &[u8] = b"fwprobe-udp-probe";

pub const MTU: usize = 1500;
