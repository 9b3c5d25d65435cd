//! Packet framing at the core boundary.
//!
//! A packet is `{ packet_type: u8, data: bytes }`. Length prefixes,
//! checksums, and encryption are the transport's concern; this module only
//! knows the type registry and the payload layouts the handlers consume.

use crate::dht::error::DhtError;
use crate::dht::types::{
    GET_NODES_PAYLOAD_SIZE, LAN_DISCOVERY_PAYLOAD_SIZE, PACKET_GET_NODES, PACKET_GROUP_ANNOUNCE,
    PACKET_GROUP_QUERY, PACKET_GROUP_QUERY_RESPONSE, PACKET_LAN_DISCOVERY, PACKET_NOISE_HANDSHAKE,
    PACKET_PING_REQUEST, PACKET_PING_RESPONSE, PACKET_SEND_NODES,
};
use crate::types::{PUBLIC_KEY_SIZE, PublicKey};

/// Wire-visible packet types handled by the DHT core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    PingRequest = PACKET_PING_REQUEST,
    PingResponse = PACKET_PING_RESPONSE,
    GetNodes = PACKET_GET_NODES,
    SendNodes = PACKET_SEND_NODES,
    LanDiscovery = PACKET_LAN_DISCOVERY,
    GroupAnnounce = PACKET_GROUP_ANNOUNCE,
    GroupQuery = PACKET_GROUP_QUERY,
    GroupQueryResponse = PACKET_GROUP_QUERY_RESPONSE,
    NoiseHandshake = PACKET_NOISE_HANDSHAKE,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Result<Self, DhtError> {
        match value {
            PACKET_PING_REQUEST => Ok(Self::PingRequest),
            PACKET_PING_RESPONSE => Ok(Self::PingResponse),
            PACKET_GET_NODES => Ok(Self::GetNodes),
            PACKET_SEND_NODES => Ok(Self::SendNodes),
            PACKET_LAN_DISCOVERY => Ok(Self::LanDiscovery),
            PACKET_GROUP_ANNOUNCE => Ok(Self::GroupAnnounce),
            PACKET_GROUP_QUERY => Ok(Self::GroupQuery),
            PACKET_GROUP_QUERY_RESPONSE => Ok(Self::GroupQueryResponse),
            PACKET_NOISE_HANDSHAKE => Ok(Self::NoiseHandshake),
            other => Err(DhtError::UnsupportedPacketType(other)),
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }

    /// Human-readable name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::PingRequest => "ping_request",
            Self::PingResponse => "ping_response",
            Self::GetNodes => "get_nodes",
            Self::SendNodes => "send_nodes",
            Self::LanDiscovery => "lan_discovery",
            Self::GroupAnnounce => "group_announce",
            Self::GroupQuery => "group_query",
            Self::GroupQueryResponse => "group_query_response",
            Self::NoiseHandshake => "noise_handshake",
        }
    }
}

/// One framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, data: Vec<u8>) -> Self {
        Self { packet_type, data }
    }

    /// GetNodes payload: `sender_pubkey[32] || target_pubkey[32]`.
    pub fn get_nodes(sender: &PublicKey, target: &PublicKey) -> Self {
        let mut data = Vec::with_capacity(GET_NODES_PAYLOAD_SIZE);
        data.extend_from_slice(sender.as_bytes());
        data.extend_from_slice(target.as_bytes());
        Self::new(PacketType::GetNodes, data)
    }

    /// Ping request carrying our public key as the opaque payload.
    pub fn ping_request(sender: &PublicKey) -> Self {
        Self::new(PacketType::PingRequest, sender.as_bytes().to_vec())
    }

    /// Ping response: verbatim echo of the request payload.
    pub fn ping_response(request_payload: &[u8]) -> Self {
        Self::new(PacketType::PingResponse, request_payload.to_vec())
    }

    /// GroupQuery payload: `group_id(u32 BE)`.
    pub fn group_query(group_id: u32) -> Self {
        Self::new(PacketType::GroupQuery, group_id.to_be_bytes().to_vec())
    }

    /// LAN discovery beacon: `public_key[32] || port(u16 BE)`.
    pub fn lan_discovery(sender: &PublicKey, port: u16) -> Self {
        let mut data = Vec::with_capacity(LAN_DISCOVERY_PAYLOAD_SIZE);
        data.extend_from_slice(sender.as_bytes());
        data.extend_from_slice(&port.to_be_bytes());
        Self::new(PacketType::LanDiscovery, data)
    }
}

/// Read the leading 32-byte sender key common to most payloads.
pub fn sender_key(payload: &[u8]) -> Result<PublicKey, DhtError> {
    if payload.len() < PUBLIC_KEY_SIZE {
        return Err(DhtError::TruncatedPacket { got: payload.len(), need: PUBLIC_KEY_SIZE });
    }
    PublicKey::from_slice(&payload[..PUBLIC_KEY_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_registry_round_trip() {
        for t in [
            PacketType::PingRequest,
            PacketType::PingResponse,
            PacketType::GetNodes,
            PacketType::SendNodes,
            PacketType::LanDiscovery,
            PacketType::GroupAnnounce,
            PacketType::GroupQuery,
            PacketType::GroupQueryResponse,
            PacketType::NoiseHandshake,
        ] {
            assert_eq!(PacketType::from_wire(t.as_wire()).unwrap(), t);
        }
        assert!(matches!(
            PacketType::from_wire(0x7f),
            Err(DhtError::UnsupportedPacketType(0x7f))
        ));
    }

    #[test]
    fn get_nodes_payload_is_two_keys() {
        let sender = PublicKey([1u8; 32]);
        let target = PublicKey([2u8; 32]);
        let packet = Packet::get_nodes(&sender, &target);
        assert_eq!(packet.data.len(), GET_NODES_PAYLOAD_SIZE);
        assert_eq!(sender_key(&packet.data).unwrap(), sender);
        assert_eq!(&packet.data[32..], &[2u8; 32]);
    }

    #[test]
    fn ping_response_echoes_verbatim() {
        let request = Packet::ping_request(&PublicKey([9u8; 32]));
        let response = Packet::ping_response(&request.data);
        assert_eq!(response.data, request.data);
        assert_eq!(response.packet_type, PacketType::PingResponse);
    }

    #[test]
    fn lan_discovery_is_34_bytes() {
        let packet = Packet::lan_discovery(&PublicKey([3u8; 32]), 33_445);
        assert_eq!(packet.data.len(), LAN_DISCOVERY_PAYLOAD_SIZE);
        assert_eq!(&packet.data[32..], &33_445u16.to_be_bytes());
    }
}
