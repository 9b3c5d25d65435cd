pub mod crypto;
pub mod dht;
pub mod time;
pub mod types;

pub use crypto::KeyPair;
pub use dht::{
    Address, AddressType, BootstrapManager, DhtConfig, DhtError, GroupAnnouncement, GroupStorage,
    LanDiscovery, Maintainer, Node, NodeCache, NodeStatus, Packet, PacketType, PingStats,
    ProtocolVersion, RoutingStats, RoutingTable, Transport, TransportError, UdpTransport,
    VersionedHandshake,
};
pub use time::{Clock, MockTimeProvider, SystemTimeProvider, TimeProvider, system_clock};
pub use types::*;
