//! Multi-network addresses and node-entry wire codecs.
//!
//! Two entry formats coexist on the wire:
//!
//! - **Legacy** (50 bytes): `pubkey[32] || ip16[16] || port(u16 BE)`.
//!   IPv4 is carried in the IPv4-mapped-IPv6 form (`0…0 FF FF || ipv4[4]`).
//!   IPv4/IPv6 only.
//! - **Extended** (type-tagged): `pubkey[32] || tag(u8) || body || port(u16 BE)`.
//!   The tag selects the body layout and covers onion-style overlay networks
//!   whose address bytes are opaque to this crate.
//!
//! Network type is never inferred by string scraping: it is either declared
//! by the peer on the wire (extended tag) or derived by the legacy parser,
//! which only ever emits IPv4/IPv6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::dht::error::DhtError;
use crate::dht::handshake::ProtocolVersion;
use crate::dht::types::{EXTENDED_ENTRY_MIN_SIZE, LEGACY_ENTRY_SIZE};
use crate::types::{PUBLIC_KEY_SIZE, PublicKey};

// =============================================================================
// ADDRESS TYPES
// =============================================================================

/// Wire tag for extended node entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Ipv6 = 0x02,
    Onion = 0x03,
    I2p = 0x04,
    Nym = 0x05,
    Loki = 0x06,
}

impl AddressType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Ipv4),
            0x02 => Some(Self::Ipv6),
            0x03 => Some(Self::Onion),
            0x04 => Some(Self::I2p),
            0x05 => Some(Self::Nym),
            0x06 => Some(Self::Loki),
            _ => None,
        }
    }

    /// True for overlay networks whose address bytes we never inspect.
    pub fn is_opaque(self) -> bool {
        matches!(self, Self::Onion | Self::I2p | Self::Nym | Self::Loki)
    }
}

/// A peer endpoint on one of the supported networks.
///
/// Onion/I2P/Nym/Loki blobs are opaque: they are carried, compared, and
/// re-serialized but never parsed as IP addresses. Code needing a host
/// string must branch on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Ipv4 { octets: [u8; 4], port: u16 },
    Ipv6 { octets: [u8; 16], port: u16 },
    Onion { blob: Vec<u8>, port: u16 },
    I2p { blob: Vec<u8>, port: u16 },
    Nym { blob: Vec<u8>, port: u16 },
    Loki { blob: Vec<u8>, port: u16 },
}

impl Address {
    pub fn ipv4(octets: [u8; 4], port: u16) -> Self {
        Self::Ipv4 { octets, port }
    }

    pub fn ipv6(octets: [u8; 16], port: u16) -> Self {
        Self::Ipv6 { octets, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::Ipv4 { octets: v4.ip().octets(), port: v4.port() },
            SocketAddr::V6(v6) => {
                // Undo IPv4-mapped form so both socket families of the same
                // host compare equal.
                if let Some(v4) = v6.ip().to_ipv4_mapped() {
                    Self::Ipv4 { octets: v4.octets(), port: v6.port() }
                } else {
                    Self::Ipv6 { octets: v6.ip().octets(), port: v6.port() }
                }
            }
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Self::Ipv4 { .. } => AddressType::Ipv4,
            Self::Ipv6 { .. } => AddressType::Ipv6,
            Self::Onion { .. } => AddressType::Onion,
            Self::I2p { .. } => AddressType::I2p,
            Self::Nym { .. } => AddressType::Nym,
            Self::Loki { .. } => AddressType::Loki,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ipv4 { port, .. }
            | Self::Ipv6 { port, .. }
            | Self::Onion { port, .. }
            | Self::I2p { port, .. }
            | Self::Nym { port, .. }
            | Self::Loki { port, .. } => *port,
        }
    }

    /// Socket address for IP variants; None for overlay networks, which
    /// only a proxying transport can reach.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ipv4 { octets, port } => {
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*octets)), *port))
            }
            Self::Ipv6 { octets, port } => {
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*octets)), *port))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4 { octets, port } => {
                write!(f, "{}:{}", Ipv4Addr::from(*octets), port)
            }
            Self::Ipv6 { octets, port } => {
                write!(f, "[{}]:{}", Ipv6Addr::from(*octets), port)
            }
            Self::Onion { blob, port } => write!(f, "{}.onion:{}", hex::encode(blob), port),
            Self::I2p { blob, port } => write!(f, "{}.i2p:{}", hex::encode(blob), port),
            Self::Nym { blob, port } => write!(f, "{}.nym:{}", hex::encode(blob), port),
            Self::Loki { blob, port } => write!(f, "{}.loki:{}", hex::encode(blob), port),
        }
    }
}

// =============================================================================
// NODE ENTRIES
// =============================================================================

/// One node entry inside a SendNodes payload or the on-disk cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub public_key: PublicKey,
    pub address: Address,
}

/// Entry codec. One implementation per wire format.
pub trait PacketParser: Send + Sync {
    /// Parse one entry starting at `offset`; returns the entry and the
    /// offset just past it.
    fn parse_node_entry(&self, buf: &[u8], offset: usize) -> Result<(NodeEntry, usize), DhtError>;

    /// Serialize one entry in this parser's format.
    fn serialize_node_entry(&self, entry: &NodeEntry) -> Result<Vec<u8>, DhtError>;
}

fn need(buf: &[u8], offset: usize, len: usize) -> Result<(), DhtError> {
    if buf.len() < offset + len {
        return Err(DhtError::TruncatedPacket { got: buf.len() - offset.min(buf.len()), need: len });
    }
    Ok(())
}

fn read_port(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

// -----------------------------------------------------------------------------
// Legacy format
// -----------------------------------------------------------------------------

/// 50-byte fixed entries, IPv4/IPv6 only.
#[derive(Debug, Default)]
pub struct LegacyParser;

impl LegacyParser {
    fn is_ipv4_mapped(ip16: &[u8]) -> bool {
        ip16[..10].iter().all(|&b| b == 0) && ip16[10] == 0xff && ip16[11] == 0xff
    }
}

impl PacketParser for LegacyParser {
    fn parse_node_entry(&self, buf: &[u8], offset: usize) -> Result<(NodeEntry, usize), DhtError> {
        need(buf, offset, LEGACY_ENTRY_SIZE)?;
        let public_key = PublicKey::from_slice(&buf[offset..offset + PUBLIC_KEY_SIZE])?;
        let ip16 = &buf[offset + 32..offset + 48];
        let port = read_port(buf, offset + 48);

        let address = if Self::is_ipv4_mapped(ip16) {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&ip16[12..16]);
            Address::Ipv4 { octets, port }
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(ip16);
            Address::Ipv6 { octets, port }
        };

        Ok((NodeEntry { public_key, address }, offset + LEGACY_ENTRY_SIZE))
    }

    fn serialize_node_entry(&self, entry: &NodeEntry) -> Result<Vec<u8>, DhtError> {
        let mut out = Vec::with_capacity(LEGACY_ENTRY_SIZE);
        out.extend_from_slice(entry.public_key.as_bytes());
        match &entry.address {
            Address::Ipv4 { octets, port } => {
                out.extend_from_slice(&[0u8; 10]);
                out.extend_from_slice(&[0xff, 0xff]);
                out.extend_from_slice(octets);
                out.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6 { octets, port } => {
                out.extend_from_slice(octets);
                out.extend_from_slice(&port.to_be_bytes());
            }
            other => {
                return Err(DhtError::InvalidNodeEntry(format!(
                    "legacy format cannot carry {:?} addresses",
                    other.address_type()
                )));
            }
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Extended format
// -----------------------------------------------------------------------------

/// Type-tagged entries covering all supported networks. Opaque bodies are
/// length-prefixed (`len(u8) || blob[len]`, 1..=255 bytes).
#[derive(Debug, Default)]
pub struct ExtendedParser;

impl PacketParser for ExtendedParser {
    fn parse_node_entry(&self, buf: &[u8], offset: usize) -> Result<(NodeEntry, usize), DhtError> {
        need(buf, offset, EXTENDED_ENTRY_MIN_SIZE)?;
        let public_key = PublicKey::from_slice(&buf[offset..offset + PUBLIC_KEY_SIZE])?;
        let tag = buf[offset + 32];
        let addr_type = AddressType::from_tag(tag)
            .ok_or_else(|| DhtError::InvalidNodeEntry(format!("unknown address tag {tag:#04x}")))?;
        let mut pos = offset + 33;

        let address = match addr_type {
            AddressType::Ipv4 => {
                need(buf, pos, 4 + 2)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[pos..pos + 4]);
                pos += 4;
                let port = read_port(buf, pos);
                pos += 2;
                Address::Ipv4 { octets, port }
            }
            AddressType::Ipv6 => {
                need(buf, pos, 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[pos..pos + 16]);
                pos += 16;
                let port = read_port(buf, pos);
                pos += 2;
                Address::Ipv6 { octets, port }
            }
            opaque => {
                need(buf, pos, 1)?;
                let len = buf[pos] as usize;
                pos += 1;
                if len == 0 {
                    return Err(DhtError::InvalidNodeEntry("empty overlay address".into()));
                }
                need(buf, pos, len + 2)?;
                let blob = buf[pos..pos + len].to_vec();
                pos += len;
                let port = read_port(buf, pos);
                pos += 2;
                match opaque {
                    AddressType::Onion => Address::Onion { blob, port },
                    AddressType::I2p => Address::I2p { blob, port },
                    AddressType::Nym => Address::Nym { blob, port },
                    AddressType::Loki => Address::Loki { blob, port },
                    _ => unreachable!("ip variants handled above"),
                }
            }
        };

        Ok((NodeEntry { public_key, address }, pos))
    }

    fn serialize_node_entry(&self, entry: &NodeEntry) -> Result<Vec<u8>, DhtError> {
        let mut out = Vec::with_capacity(EXTENDED_ENTRY_MIN_SIZE + 16);
        out.extend_from_slice(entry.public_key.as_bytes());
        out.push(entry.address.address_type().tag());
        match &entry.address {
            Address::Ipv4 { octets, .. } => out.extend_from_slice(octets),
            Address::Ipv6 { octets, .. } => out.extend_from_slice(octets),
            Address::Onion { blob, .. }
            | Address::I2p { blob, .. }
            | Address::Nym { blob, .. }
            | Address::Loki { blob, .. } => {
                if blob.is_empty() || blob.len() > u8::MAX as usize {
                    return Err(DhtError::InvalidNodeEntry(format!(
                        "overlay address must be 1..=255 bytes, got {}",
                        blob.len()
                    )));
                }
                out.push(blob.len() as u8);
                out.extend_from_slice(blob);
            }
        }
        out.extend_from_slice(&entry.address.port().to_be_bytes());
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Format detection and selection
// -----------------------------------------------------------------------------

/// Entry format on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    Legacy,
    Extended,
}

/// Picks a parser per entry or per negotiated protocol version.
#[derive(Debug, Default)]
pub struct ParserSelector {
    legacy: LegacyParser,
    extended: ExtendedParser,
}

impl ParserSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect the format of the entry starting at `offset`.
    ///
    /// Rule: IPv4-mapped marker bytes at offset+42..44 with at least a full
    /// legacy entry remaining means legacy; otherwise a recognized address
    /// tag at offset+32 with the extended floor remaining means extended;
    /// otherwise legacy (a plain IPv6 legacy entry can begin with bytes that
    /// look like neither).
    pub fn detect(&self, buf: &[u8], offset: usize) -> EntryFormat {
        let remaining = buf.len().saturating_sub(offset);
        if remaining >= LEGACY_ENTRY_SIZE
            && buf[offset + 42] == 0xff
            && buf[offset + 43] == 0xff
        {
            return EntryFormat::Legacy;
        }
        if remaining >= EXTENDED_ENTRY_MIN_SIZE
            && AddressType::from_tag(buf[offset + 32]).is_some()
        {
            return EntryFormat::Extended;
        }
        EntryFormat::Legacy
    }

    pub fn for_format(&self, format: EntryFormat) -> &dyn PacketParser {
        match format {
            EntryFormat::Legacy => &self.legacy,
            EntryFormat::Extended => &self.extended,
        }
    }

    /// Parser implied by a negotiated protocol version: legacy peers speak
    /// 50-byte entries, versioned peers the tagged format.
    pub fn for_version(&self, version: ProtocolVersion) -> &dyn PacketParser {
        match version {
            ProtocolVersion::Legacy => &self.legacy,
            ProtocolVersion::NoiseIkV1 => &self.extended,
        }
    }

    /// Parser for serializing an entry with this address: IP addresses stay
    /// wire-compatible with legacy peers; overlay networks need the tagged
    /// format.
    pub fn for_address(&self, address: &Address) -> &dyn PacketParser {
        if address.address_type().is_opaque() {
            &self.extended
        } else {
            &self.legacy
        }
    }

    /// Parse the entry at `offset`, detecting its format.
    pub fn parse_entry(&self, buf: &[u8], offset: usize) -> Result<(NodeEntry, usize), DhtError> {
        let format = self.detect(buf, offset);
        self.for_format(format).parse_node_entry(buf, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(first: u8) -> PublicKey {
        let mut b = [0u8; 32];
        b[0] = first;
        PublicKey(b)
    }

    #[test]
    fn legacy_ipv4_round_trip() {
        let parser = LegacyParser;
        let entry = NodeEntry {
            public_key: key(3),
            address: Address::ipv4([127, 0, 0, 1], 33445),
        };
        let bytes = parser.serialize_node_entry(&entry).unwrap();
        assert_eq!(bytes.len(), LEGACY_ENTRY_SIZE);
        // IPv4-mapped marker
        assert_eq!(&bytes[42..44], &[0xff, 0xff]);
        let (parsed, next) = parser.parse_node_entry(&bytes, 0).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(next, LEGACY_ENTRY_SIZE);
    }

    #[test]
    fn legacy_ipv6_round_trip() {
        let parser = LegacyParser;
        let mut octets = [0u8; 16];
        octets[0] = 0x20;
        octets[1] = 0x01;
        octets[15] = 1;
        let entry = NodeEntry {
            public_key: key(7),
            address: Address::ipv6(octets, 33446),
        };
        let bytes = parser.serialize_node_entry(&entry).unwrap();
        let (parsed, _) = parser.parse_node_entry(&bytes, 0).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn legacy_rejects_overlay_addresses() {
        let parser = LegacyParser;
        let entry = NodeEntry {
            public_key: key(1),
            address: Address::Onion { blob: vec![1, 2, 3], port: 80 },
        };
        assert!(parser.serialize_node_entry(&entry).is_err());
    }

    #[test]
    fn extended_round_trip_all_variants() {
        let parser = ExtendedParser;
        let addrs = [
            Address::ipv4([10, 0, 0, 1], 1),
            Address::ipv6([9u8; 16], 2),
            Address::Onion { blob: vec![0xaa; 35], port: 3 },
            Address::I2p { blob: vec![0xbb; 52], port: 4 },
            Address::Nym { blob: vec![0xcc; 16], port: 5 },
            Address::Loki { blob: vec![0xdd; 32], port: 6 },
        ];
        for addr in addrs {
            let entry = NodeEntry { public_key: key(0x42), address: addr };
            let bytes = parser.serialize_node_entry(&entry).unwrap();
            let (parsed, next) = parser.parse_node_entry(&bytes, 0).unwrap();
            assert_eq!(parsed, entry);
            assert_eq!(next, bytes.len());
        }
    }

    #[test]
    fn extended_rejects_empty_blob() {
        let parser = ExtendedParser;
        let entry = NodeEntry {
            public_key: key(1),
            address: Address::Onion { blob: vec![], port: 80 },
        };
        assert!(parser.serialize_node_entry(&entry).is_err());

        // On the wire: pubkey, onion tag, zero length, port
        let mut buf = vec![0u8; 32];
        buf.push(AddressType::Onion.tag());
        buf.push(0);
        buf.extend_from_slice(&80u16.to_be_bytes());
        assert!(parser.parse_node_entry(&buf, 0).is_err());
    }

    #[test]
    fn detection_prefers_mapped_marker() {
        let selector = ParserSelector::new();
        let legacy = LegacyParser
            .serialize_node_entry(&NodeEntry {
                public_key: key(1),
                address: Address::ipv4([1, 2, 3, 4], 5),
            })
            .unwrap();
        assert_eq!(selector.detect(&legacy, 0), EntryFormat::Legacy);

        let extended = ExtendedParser
            .serialize_node_entry(&NodeEntry {
                public_key: key(1),
                address: Address::Onion { blob: vec![7; 10], port: 5 },
            })
            .unwrap();
        assert_eq!(selector.detect(&extended, 0), EntryFormat::Extended);
    }

    #[test]
    fn version_selects_entry_format() {
        let selector = ParserSelector::new();
        let entry = NodeEntry {
            public_key: key(1),
            address: Address::ipv4([1, 2, 3, 4], 5),
        };
        let legacy = selector
            .for_version(ProtocolVersion::Legacy)
            .serialize_node_entry(&entry)
            .unwrap();
        assert_eq!(legacy.len(), LEGACY_ENTRY_SIZE);
        let extended = selector
            .for_version(ProtocolVersion::NoiseIkV1)
            .serialize_node_entry(&entry)
            .unwrap();
        assert_eq!(extended[32], AddressType::Ipv4.tag());
    }

    #[test]
    fn mapped_socket_addr_normalizes_to_ipv4() {
        let v6: std::net::SocketAddr = "[::ffff:127.0.0.1]:33445".parse().unwrap();
        assert_eq!(
            Address::from_socket_addr(v6),
            Address::ipv4([127, 0, 0, 1], 33445)
        );
    }
}
