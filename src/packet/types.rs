use std::net::Ipv4Addr;

use smallvec::SmallVec;

use super::builders;
use super::constants::ETH_HDR_LEN;
use crate::topology::Endpoint;

/// What kind of probe packet to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// ICMP echo request with a fixed benign payload. The peer's kernel
    /// answers it unless a rule drops the request first.
    IcmpEchoRequest,
    /// Minimal UDP datagram. Useful for rules matching `-p udp`.
    UdpProbe { src_port: u16, dst_port: u16 },
}

/// An immutable, fully-framed packet between two topology endpoints.
///
/// Built once by the factory and consumed by the transport; carries the
/// addressing facts needed to recognize its reply.
#[derive(Debug, Clone)]
pub struct PacketDescriptor {
    kind: ProtocolKind,
    frame: SmallVec<[u8; 128]>,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    echo_ident: u16,
    echo_seq: u16,
}

impl PacketDescriptor {
    /// Build a packet of `kind` addressed from `src` to `dst`.
    ///
    /// Deterministic for identical endpoints, except for the echo
    /// identifier (random) and sequence (per-process counter), neither of
    /// which participates in rule matching.
    pub fn build(kind: ProtocolKind, src: &Endpoint, dst: &Endpoint) -> Self {
        match kind {
            ProtocolKind::IcmpEchoRequest => {
                let ident = rand::random::<u16>();
                let seq = builders::next_echo_seq();
                let frame = builders::build_icmp_echo_request(
                    src.mac(),
                    dst.mac(),
                    src.ip(),
                    dst.ip(),
                    ident,
                    seq,
                );
                Self::from_frame(kind, frame, src.ip(), dst.ip(), ident, seq)
            }
            ProtocolKind::UdpProbe { src_port, dst_port } => {
                let frame = builders::build_udp_probe(
                    src.mac(),
                    dst.mac(),
                    src.ip(),
                    dst.ip(),
                    src_port,
                    dst_port,
                );
                Self::from_frame(kind, frame, src.ip(), dst.ip(), 0, 0)
            }
        }
    }

    pub(crate) fn from_frame(
        kind: ProtocolKind,
        frame: SmallVec<[u8; 128]>,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        echo_ident: u16,
        echo_seq: u16,
    ) -> Self {
        Self {
            kind,
            frame,
            src_ip,
            dst_ip,
            echo_ident,
            echo_seq,
        }
    }

    pub fn kind(&self) -> &ProtocolKind {
        &self.kind
    }

    /// The raw frame bytes, ready for injection.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Full frame length including the Ethernet header.
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Length as seen at the network layer (the byte count most backends
    /// report in their counters).
    pub fn network_len(&self) -> usize {
        self.frame.len().saturating_sub(ETH_HDR_LEN)
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        self.src_ip
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        self.dst_ip
    }

    pub fn echo_ident(&self) -> u16 {
        self.echo_ident
    }

    pub fn echo_seq(&self) -> u16 {
        self.echo_seq
    }
}
