//! Bootstrap and packet state-machine integration tests. Two managers are
//! wired back-to-back by ferrying packets between their in-memory
//! transports.

use std::sync::Arc;

use cairn::dht::{
    Address, BootstrapManager, ChannelTransport, DhtConfig, DhtError, ExtendedParser, LegacyParser,
    NegotiatingHandshake, Node, NodeEntry, NodeStatus, Packet, PacketParser, PacketType,
    ProtocolVersion, RoutingTable,
};
use cairn::dht::handshake::{HANDSHAKE_FLAG_REQUEST, HANDSHAKE_FLAG_RESPONSE};
use cairn::time::MockTimeProvider;
use cairn::types::{NodeId, PublicKey};
use cairn::Clock;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

const START_SECS: u64 = 50_000;

struct Fixture {
    manager: Arc<BootstrapManager>,
    transport: Arc<ChannelTransport>,
    routing: Arc<RoutingTable>,
    addr: Address,
}

fn fixture_with(self_byte: u8, port: u16, config: DhtConfig, versioned: bool) -> Fixture {
    let clock: Clock = Arc::new(MockTimeProvider::new(START_SECS));
    let self_key = PublicKey([self_byte; 32]);
    let routing = Arc::new(RoutingTable::new(
        NodeId::from_public_key(self_key),
        &config,
        clock.clone(),
    ));
    let transport = ChannelTransport::new(format!("127.0.0.1:{port}").parse().unwrap());
    let handshake = versioned.then(|| {
        Arc::new(NegotiatingHandshake::new(self_key, config.send_timeout_secs))
            as Arc<dyn cairn::dht::VersionedHandshake>
    });
    let manager = BootstrapManager::new(config, routing.clone(), transport.clone(), clock, handshake);
    Fixture {
        manager,
        transport,
        routing,
        addr: Address::ipv4([127, 0, 0, 1], port),
    }
}

fn fixture(self_byte: u8, port: u16) -> Fixture {
    fixture_with(self_byte, port, DhtConfig::default(), false)
}

#[tokio::test]
async fn bootstrap_round_trip_learns_the_peers_neighbors() {
    // Peer A bootstraps from peer B, which knows 0x03… and 0xFF….
    let a = fixture(0x01, 33_001);
    let b = fixture(0x02, 33_002);

    b.routing.add(Node::new(
        PublicKey([0x03; 32]),
        Address::ipv4([127, 0, 0, 1], 33_445),
        START_SECS,
    ));
    b.routing.add(Node::new(
        PublicKey([0xFF; 32]),
        Address::ipv4([127, 0, 0, 2], 33_446),
        START_SECS,
    ));

    a.manager
        .add_bootstrap(b.addr.clone(), &"02".repeat(32))
        .await
        .unwrap();
    a.manager.bootstrap(CancellationToken::new()).await.unwrap();
    assert!(a.manager.is_bootstrapped().await);

    // A sent GetNodes{self, target=B} to B.
    let sent = a.transport.take_sent();
    let (request, to) = sent
        .iter()
        .find(|(p, _)| p.packet_type == PacketType::GetNodes)
        .expect("bootstrap sends GetNodes");
    assert_eq!(to, &b.addr);
    assert_eq!(&request.data[..32], &[0x01; 32]);
    assert_eq!(&request.data[32..64], &[0x02; 32]);

    // B answers with its two closest nodes.
    b.manager
        .handle_packet(request.clone(), a.addr.clone())
        .await
        .unwrap();
    let replies = b.transport.take_sent();
    let (reply, reply_to) = replies
        .iter()
        .find(|(p, _)| p.packet_type == PacketType::SendNodes)
        .expect("get_nodes produces send_nodes");
    assert_eq!(reply_to, &a.addr);
    assert_eq!(&reply.data[..32], &[0x02; 32]);
    assert_eq!(reply.data[32], 2);
    // two legacy entries
    assert_eq!(reply.data.len(), 33 + 2 * 50);

    // A ingests the reply: exactly {B, 0x03…, 0xFF…}, all Good.
    a.manager
        .handle_packet(reply.clone(), b.addr.clone())
        .await
        .unwrap();

    let nodes = a.routing.all_nodes();
    assert_eq!(nodes.len(), 3);
    let mut keys: Vec<[u8; 32]> = nodes.iter().map(|n| n.public_key.0).collect();
    keys.sort();
    assert_eq!(keys, vec![[0x02; 32], [0x03; 32], [0xFF; 32]]);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Good));

    // The answering seed is marked successful.
    let seeds = a.manager.bootstrap_nodes().await;
    assert!(seeds[0].success);
    assert!(seeds[0].last_used.is_some());
}

#[tokio::test]
async fn get_nodes_reply_mixes_legacy_and_extended_entries() {
    let a = fixture(0x01, 33_011);
    let b = fixture(0x02, 33_012);

    b.routing.add(Node::new(
        PublicKey([0x03; 32]),
        Address::ipv4([10, 0, 0, 3], 33_445),
        START_SECS,
    ));
    b.routing.add(Node::new(
        PublicKey([0x04; 32]),
        Address::Onion { blob: vec![0xAB; 32], port: 9_050 },
        START_SECS,
    ));

    let request = Packet::get_nodes(&PublicKey([0x01; 32]), &PublicKey([0x03; 32]));
    b.manager.handle_packet(request, a.addr.clone()).await.unwrap();
    let (reply, _) = b.transport.take_sent().pop().expect("reply sent");

    a.manager.handle_packet(reply, b.addr.clone()).await.unwrap();
    let nodes = a.routing.all_nodes();
    // A knows B (the sender) plus both entries, onion address intact.
    assert_eq!(nodes.len(), 3);
    let onion = nodes
        .iter()
        .find(|n| n.public_key == PublicKey([0x04; 32]))
        .expect("onion node learned");
    assert_eq!(onion.address, Address::Onion { blob: vec![0xAB; 32], port: 9_050 });
}

#[tokio::test]
async fn send_nodes_with_zero_entries_is_legal() {
    let a = fixture(0x01, 33_021);
    let mut payload = vec![0x09; 32];
    payload.push(0);
    a.manager
        .handle_packet(
            Packet::new(PacketType::SendNodes, payload),
            Address::ipv4([9, 9, 9, 9], 1),
        )
        .await
        .unwrap();
    // only the sender was learned
    assert_eq!(a.routing.count(), 1);
}

#[tokio::test]
async fn send_nodes_skips_truncated_trailing_entry() {
    let a = fixture(0x01, 33_022);

    let entry = LegacyParser
        .serialize_node_entry(&NodeEntry {
            public_key: PublicKey([0x03; 32]),
            address: Address::ipv4([10, 0, 0, 3], 33_445),
        })
        .unwrap();

    let mut payload = vec![0x09; 32];
    payload.push(2); // claims two entries
    payload.extend_from_slice(&entry);
    payload.extend_from_slice(&entry[..40]); // second entry cut short

    a.manager
        .handle_packet(
            Packet::new(PacketType::SendNodes, payload),
            Address::ipv4([9, 9, 9, 9], 1),
        )
        .await
        .unwrap();

    // sender + the one parseable entry
    assert_eq!(a.routing.count(), 2);
}

#[tokio::test]
async fn send_nodes_count_must_fit_payload() {
    let a = fixture(0x01, 33_023);
    let mut payload = vec![0x09; 32];
    payload.push(200); // impossible count for this length
    let result = a
        .manager
        .handle_packet(
            Packet::new(PacketType::SendNodes, payload),
            Address::ipv4([9, 9, 9, 9], 1),
        )
        .await;
    assert!(matches!(result, Err(DhtError::TruncatedPacket { .. })));
    assert_eq!(a.routing.count(), 1); // the sender itself was still learned
}

#[tokio::test]
async fn ping_request_is_echoed_verbatim() {
    let a = fixture(0x01, 33_031);
    let mut payload = vec![0x07; 32];
    payload.extend_from_slice(b"nonce-bytes");
    let from = Address::ipv4([127, 0, 0, 9], 33_445);

    a.manager
        .handle_packet(Packet::new(PacketType::PingRequest, payload.clone()), from.clone())
        .await
        .unwrap();

    let sent = a.transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.packet_type, PacketType::PingResponse);
    assert_eq!(sent[0].0.data, payload);
    assert_eq!(sent[0].1, from);
    // pinger is now a Good node
    assert_eq!(a.routing.nodes_by_status(NodeStatus::Good).len(), 1);
}

#[tokio::test]
async fn get_nodes_reply_excludes_the_requester() {
    // B knows nobody: the requester must not be reflected back at itself.
    let b = fixture(0x02, 33_033);
    let request = Packet::get_nodes(&PublicKey([0x01; 32]), &PublicKey([0x02; 32]));
    b.manager
        .handle_packet(request, Address::ipv4([127, 0, 0, 1], 33_001))
        .await
        .unwrap();

    let (reply, _) = b.transport.take_sent().pop().expect("reply sent");
    assert_eq!(reply.data[32], 0);
    assert_eq!(reply.data.len(), 33);
    // the requester itself was still learned
    assert_eq!(b.routing.count(), 1);
}

#[tokio::test]
async fn liveness_pong_echo_refreshes_the_responder() {
    // The maintainer's ping carries our own key; the verbatim echo must be
    // attributed to the peer that answered, not to the echoed key.
    let a = fixture(0x01, 33_034);
    let peer_addr = Address::ipv4([10, 0, 0, 5], 33_445);
    a.routing.add(Node::new(PublicKey([0x55; 32]), peer_addr.clone(), START_SECS));

    let echo = vec![0x01; 32]; // our own key, echoed back
    a.manager
        .handle_packet(Packet::new(PacketType::PingResponse, echo), peer_addr)
        .await
        .unwrap();

    assert_eq!(a.routing.count(), 1);
    let good = a.routing.nodes_by_status(NodeStatus::Good);
    assert_eq!(good.len(), 1);
    assert_eq!(good[0].public_key, PublicKey([0x55; 32]));
    assert_eq!(good[0].ping_stats.success, 1);
}

#[tokio::test]
async fn seed_pong_echo_inserts_the_seed() {
    // Empty table, seeds configured: a pong from a seed's address is
    // attributed to that seed.
    let a = fixture(0x01, 33_035);
    let seed_addr = Address::ipv4([127, 0, 0, 2], 33_002);
    a.manager
        .add_bootstrap(seed_addr.clone(), &"02".repeat(32))
        .await
        .unwrap();

    let echo = vec![0x01; 32];
    a.manager
        .handle_packet(Packet::new(PacketType::PingResponse, echo), seed_addr)
        .await
        .unwrap();

    let good = a.routing.nodes_by_status(NodeStatus::Good);
    assert_eq!(good.len(), 1);
    assert_eq!(good[0].public_key, PublicKey([0x02; 32]));
}

#[tokio::test]
async fn stamped_pong_from_unknown_address_marks_sender_good() {
    // Neither the table nor the seed list knows this address: fall back to
    // the key stamped in the payload.
    let a = fixture(0x01, 33_032);
    let from = Address::ipv4([127, 0, 0, 9], 33_445);

    // too short: rejected
    let result = a
        .manager
        .handle_packet(Packet::new(PacketType::PingResponse, vec![1; 31]), from.clone())
        .await;
    assert!(matches!(result, Err(DhtError::TruncatedPacket { .. })));

    a.manager
        .handle_packet(Packet::new(PacketType::PingResponse, vec![0x07; 32]), from)
        .await
        .unwrap();
    let good = a.routing.nodes_by_status(NodeStatus::Good);
    assert_eq!(good.len(), 1);
    assert_eq!(good[0].ping_stats.success, 1);
}

#[tokio::test]
async fn version_negotiation_round_trip() {
    let a = fixture_with(0x01, 33_041, DhtConfig::default(), true);
    let b = fixture_with(0x02, 33_042, DhtConfig::default(), true);

    let request = NegotiatingHandshake::packet(
        &PublicKey([0x01; 32]),
        HANDSHAKE_FLAG_REQUEST,
        cairn::dht::LATEST_VERSION,
    );
    b.manager.handle_packet(request, a.addr.clone()).await.unwrap();
    assert_eq!(b.manager.peer_version(&a.addr), ProtocolVersion::NoiseIkV1);

    let (response, to) = b.transport.take_sent().pop().expect("negotiation reply");
    assert_eq!(to, a.addr);
    assert_eq!(response.data[32], HANDSHAKE_FLAG_RESPONSE);

    a.manager.handle_packet(response, b.addr.clone()).await.unwrap();
    assert_eq!(a.manager.peer_version(&b.addr), ProtocolVersion::NoiseIkV1);
}

#[tokio::test]
async fn negotiation_is_rejected_when_disabled() {
    let config = DhtConfig { versioned_handshakes: false, ..Default::default() };
    let a = fixture_with(0x01, 33_043, config, false);
    let request = NegotiatingHandshake::packet(
        &PublicKey([0x02; 32]),
        HANDSHAKE_FLAG_REQUEST,
        cairn::dht::LATEST_VERSION,
    );
    let result = a.manager.handle_packet(request, Address::ipv4([9, 9, 9, 9], 1)).await;
    assert!(matches!(result, Err(DhtError::UnsupportedPacketType(0x60))));
}

#[tokio::test]
async fn unknown_peers_default_to_legacy() {
    let a = fixture(0x01, 33_044);
    assert_eq!(
        a.manager.peer_version(&Address::ipv4([8, 8, 8, 8], 53)),
        ProtocolVersion::Legacy
    );
}

#[tokio::test]
async fn cancellation_leaves_bootstrap_state_untouched() {
    let a = fixture(0x01, 33_051);
    a.manager
        .add_bootstrap(Address::ipv4([127, 0, 0, 2], 33_002), &"02".repeat(32))
        .await
        .unwrap();
    a.transport.fail_sends(true);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = a.manager.bootstrap(cancel).await;
    assert!(matches!(result, Err(DhtError::Cancelled)));
    assert!(!a.manager.is_bootstrapped().await);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_gives_up_after_max_attempts() {
    let config = DhtConfig {
        max_bootstrap_attempts: 2,
        min_bootstrap_nodes: 1,
        ..Default::default()
    };
    let a = fixture_with(0x01, 33_052, config, false);
    a.manager
        .add_bootstrap(Address::ipv4([127, 0, 0, 2], 33_002), &"02".repeat(32))
        .await
        .unwrap();
    a.transport.fail_sends(true);

    let result = a.manager.bootstrap(CancellationToken::new()).await;
    assert!(matches!(result, Err(DhtError::MaxAttemptsReached(2))));
    assert!(!a.manager.is_bootstrapped().await);
}

proptest! {
    /// Legacy entries survive serialize→parse with key, address, and port
    /// intact, including the IPv4-mapped form.
    #[test]
    fn legacy_entry_round_trip(
        key in any::<[u8; 32]>(),
        octets in any::<[u8; 4]>(),
        port in any::<u16>(),
    ) {
        let parser = LegacyParser;
        let entry = NodeEntry {
            public_key: PublicKey(key),
            address: Address::ipv4(octets, port),
        };
        let bytes = parser.serialize_node_entry(&entry).unwrap();
        let (parsed, consumed) = parser.parse_node_entry(&bytes, 0).unwrap();
        prop_assert_eq!(parsed, entry);
        prop_assert_eq!(consumed, bytes.len());
    }

    /// Extended entries round-trip for opaque overlay addresses.
    #[test]
    fn extended_entry_round_trip(
        key in any::<[u8; 32]>(),
        blob in proptest::collection::vec(any::<u8>(), 1..=255),
        port in any::<u16>(),
    ) {
        let parser = ExtendedParser;
        let entry = NodeEntry {
            public_key: PublicKey(key),
            address: Address::Onion { blob, port },
        };
        let bytes = parser.serialize_node_entry(&entry).unwrap();
        let (parsed, consumed) = parser.parse_node_entry(&bytes, 0).unwrap();
        prop_assert_eq!(parsed, entry);
        prop_assert_eq!(consumed, bytes.len());
    }
}
