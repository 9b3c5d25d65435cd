//! Kademlia DHT: routing, bootstrap, maintenance, group announcements.

pub mod address;
pub mod bootstrap;
pub mod bucket;
pub mod cache;
pub mod error;
pub mod groups;
pub mod handshake;
pub mod lan;
pub mod maintainer;
pub mod packet;
pub mod routing;
pub mod transport;
pub mod types;

// Re-exports
pub use address::{
    Address, AddressType, EntryFormat, ExtendedParser, LegacyParser, NodeEntry, PacketParser,
    ParserSelector,
};
pub use bootstrap::BootstrapManager;
pub use bucket::KBucket;
pub use cache::NodeCache;
pub use error::DhtError;
pub use groups::{GroupAnnouncement, GroupStorage, ResponseCallback, ANNOUNCEMENT_HEADER_SIZE};
pub use handshake::{
    HandshakeResponse, NegotiatingHandshake, ProtocolVersion, VersionedHandshake, LATEST_VERSION,
};
pub use lan::{LanDiscovery, BROADCAST_TARGETS};
pub use maintainer::Maintainer;
pub use packet::{Packet, PacketType, sender_key};
pub use routing::{first_set_bit_position, RoutingStats, RoutingTable};
pub use transport::{
    ChannelTransport, PacketSink, Transport, TransportError, UdpTransport, MAX_PACKET_SIZE,
};
pub use types::*;
