//! Packet factory: protocol-correct frame construction and classification.
//!
//! Builders produce complete Ethernet/IPv4/ICMP-or-UDP frames addressed
//! between two topology endpoints; parsers recognize the corresponding
//! replies in captured traffic. Both are pure functions over byte slices.

pub mod builders;
pub mod constants;
pub mod parsers;
pub mod types;

pub use types::{PacketDescriptor, ProtocolKind};
