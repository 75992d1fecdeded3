use super::*;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
}

fn id_with_prefix(first: u8, last: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    bytes[19] = last;
    NodeId(bytes)
}

/// Numeric comparison of two distances, most significant byte first.
fn numerically_less(a: &[u8; 20], b: &[u8; 20]) -> bool {
    for i in 0..20 {
        if a[i] != b[i] {
            return a[i] < b[i];
        }
    }
    false
}

#[derive(Clone, Default)]
struct RecordingProbe {
    pings: Arc<Mutex<Vec<NodeId>>>,
}

impl LivenessProbe for RecordingProbe {
    fn ping(&self, node: &Node) {
        self.pings.lock().push(node.id);
    }
}

fn spawn_table(our_id: NodeId, k: usize) -> (RoutingTable, RecordingProbe) {
    let probe = RecordingProbe::default();
    let config = TableConfig {
        k,
        ..TableConfig::default()
    };
    let table = RoutingTable::spawn(our_id, config, probe.clone(), CancellationToken::new());
    (table, probe)
}

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1, id2);
}

#[test]
fn test_node_id_from_bytes_invalid() {
    assert!(NodeId::from_bytes(&[1u8; 10]).is_err());
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

#[test]
fn test_node_id_hex() {
    let id = NodeId([0xAB; 20]);
    assert_eq!(id.to_hex(), "ab".repeat(20));
    assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
    assert!(NodeId::from_hex("zz").is_err());
}

#[test]
fn test_distance_symmetric_and_zero_only_for_self() {
    for _ in 0..50 {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 20]);
        assert_ne!(a.distance(&b), [0u8; 20]);
    }
}

#[test]
fn test_closer_matches_numeric_distance() {
    for _ in 0..100 {
        let target = NodeId::generate();
        let a = NodeId::generate();
        let b = NodeId::generate();
        let expected = numerically_less(&target.distance(&a), &target.distance(&b));
        assert_eq!(target.closer(&a, &b), expected);
    }

    let target = NodeId([0u8; 20]);
    assert!(target.closer(&id_with_prefix(0x01, 0), &id_with_prefix(0x02, 0)));
    assert!(!target.closer(&id_with_prefix(0x02, 0), &id_with_prefix(0x02, 0)));
}

#[test]
fn test_bucket_index_is_first_differing_bit() {
    let owner = NodeId::generate();
    for bit in 0..ID_BITS {
        let mut other = owner.0;
        other[bit / 8] ^= 0x80 >> (bit % 8);
        // Bits after the first difference must not matter.
        if bit + 1 < ID_BITS {
            let later = bit + 1;
            other[later / 8] ^= 0x80 >> (later % 8);
        }
        assert_eq!(owner.bucket_index(&NodeId(other)), Some(bit));
    }
    assert_eq!(owner.bucket_index(&owner), None);
}

#[test]
fn test_random_in_bucket() {
    let owner = NodeId::generate();
    for index in [0, 1, 7, 8, 9, 63, 100, 159] {
        let target = owner.random_in_bucket(index);
        assert_eq!(owner.bucket_index(&target), Some(index));
    }
}

#[test]
fn test_compact_node_port_is_big_endian() {
    let node = Node::new(NodeId([1u8; 20]), addr(1, 6881));
    let compact = node.to_compact().unwrap();
    assert_eq!(&compact[20..24], &[10, 0, 0, 1]);
    assert_eq!(&compact[24..26], &[0x1A, 0xE1]);
    assert_eq!(Node::from_compact(&compact).unwrap(), node);
}

#[test]
fn test_compact_node_list_round_trip() {
    for count in [0usize, 1, 26] {
        let nodes: Vec<Node> = (0..count)
            .map(|i| Node::new(NodeId::generate(), addr(i as u8, 1000 + i as u16)))
            .collect();

        let encoded = encode_compact_nodes(&nodes);
        assert_eq!(encoded.len(), count * COMPACT_NODE_LEN);
        assert_eq!(decode_compact_nodes(&encoded).unwrap(), nodes);
    }
}

#[test]
fn test_compact_node_list_rejects_ragged_length() {
    assert!(matches!(
        decode_compact_nodes(&[0u8; 27]),
        Err(DhtError::InvalidCompactLength(27))
    ));
}

#[test]
fn test_compact_skips_ipv6() {
    let v6: SocketAddr = "[::1]:6881".parse().unwrap();
    let nodes = vec![
        Node::new(NodeId::generate(), v6),
        Node::new(NodeId::generate(), addr(2, 6881)),
    ];
    assert_eq!(encode_compact_nodes(&nodes).len(), COMPACT_NODE_LEN);
}

#[test]
fn test_bucket_lists_stay_bounded() {
    let mut bucket = Bucket::new(2);
    let ids: Vec<NodeId> = (1..=5).map(|i| id_with_prefix(0x80, i)).collect();

    bucket.insert_active(ids[0]);
    bucket.insert_active(ids[1]);
    assert!(bucket.is_full());

    assert_eq!(bucket.push_candidate(ids[2]), None);
    assert_eq!(bucket.push_candidate(ids[3]), None);
    assert_eq!(bucket.push_candidate(ids[4]), Some(ids[2]));
    assert_eq!(bucket.candidate_len(), 2);

    // Repeat sightings move a candidate to the front instead of duplicating it.
    assert_eq!(bucket.push_candidate(ids[3]), None);
    let candidates: Vec<_> = bucket.candidates().copied().collect();
    assert_eq!(candidates, vec![ids[3], ids[4]]);
}

#[test]
fn test_bucket_refresh_and_promote() {
    let mut bucket = Bucket::new(2);
    let a = id_with_prefix(0x80, 1);
    let b = id_with_prefix(0x80, 2);
    let c = id_with_prefix(0x80, 3);

    bucket.insert_active(a);
    bucket.insert_active(b);
    assert!(bucket.refresh(&a));
    assert!(!bucket.refresh(&c));
    assert_eq!(bucket.active().copied().collect::<Vec<_>>(), vec![a, b]);

    bucket.push_candidate(c);
    assert_eq!(bucket.promote_candidate(), None);
    assert!(bucket.remove_active(&b));
    assert_eq!(bucket.promote_candidate(), Some(c));
    assert_eq!(bucket.active().copied().collect::<Vec<_>>(), vec![c, a]);
    assert!(!bucket.is_candidate(&c));
}

#[tokio::test]
async fn test_table_ignores_own_id() {
    let our_id = NodeId::generate();
    let (table, _) = spawn_table(our_id, 8);

    table.notify(Node::new(our_id, addr(1, 6881))).await;
    assert_eq!(table.stats().await, TableStats::default());
}

#[tokio::test]
async fn test_table_bucket_bounds_hold() {
    let k = 4;
    let (table, _) = spawn_table(NodeId([0u8; 20]), k);

    // Crowd the low buckets so both lists overflow.
    for i in 0..200u8 {
        let id = id_with_prefix(0x80 | (i % 4), i);
        table.notify(Node::new(id, addr(i, 6881))).await;
    }
    for i in 0..200u8 {
        table.notify(Node::new(NodeId::generate(), addr(i, 7000))).await;
    }

    let snapshot = table.snapshot().await.unwrap();
    let mut seen = std::collections::HashSet::new();
    for bucket in &snapshot.buckets {
        assert!(bucket.active.len() <= k);
        assert!(bucket.candidates.len() <= k);
        for node in bucket.active.iter().chain(&bucket.candidates) {
            assert!(seen.insert(node.id), "{} appears twice", node.id);
        }
    }
    assert_eq!(snapshot.bucket(0).unwrap().active.len(), k);
    assert_eq!(snapshot.bucket(0).unwrap().candidates.len(), k);
}

#[tokio::test]
async fn test_table_refreshes_address_in_place() {
    let (table, _) = spawn_table(NodeId([0u8; 20]), 8);
    let id = id_with_prefix(0x40, 1);

    table.notify(Node::new(id, addr(1, 6881))).await;
    table.notify(Node::new(id, addr(2, 6882))).await;

    let closest = table.closest_nodes(&id, 8).await;
    assert_eq!(closest, vec![Node::new(id, addr(2, 6882))]);
    assert_eq!(table.stats().await.known, 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_sightings_keep_one_timer_per_peer() {
    let metrics = tokio::runtime::Handle::current().metrics();
    let (table, _) = spawn_table(NodeId([0u8; 20]), 8);
    let id = id_with_prefix(0x40, 1);

    for _ in 0..10_000 {
        table.notify(Node::new(id, addr(1, 6881))).await;
    }
    assert_eq!(table.stats().await.active, 1);

    // Let the runtime reap the aborted timers.
    sleep(Duration::from_millis(10)).await;
    assert!(
        metrics.num_alive_tasks() <= 3,
        "{} tasks alive",
        metrics.num_alive_tasks()
    );
}

#[tokio::test]
async fn test_closest_nodes_sorted_and_bounded() {
    let (table, _) = spawn_table(NodeId::generate(), 8);
    for i in 0..60u8 {
        table.notify(Node::new(NodeId::generate(), addr(i, 6881))).await;
    }
    let active = table.stats().await.active;

    let target = NodeId::generate();
    for count in [0, 1, 8, 500] {
        let closest = table.closest_nodes(&target, count).await;
        assert!(closest.len() <= count.min(active));
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].id) <= target.distance(&pair[1].id));
        }
    }
    assert_eq!(table.closest_nodes(&target, 500).await.len(), active);
}

#[tokio::test]
async fn test_closest_nodes_exact_order() {
    let (table, _) = spawn_table(NodeId([0xFF; 20]), 8);
    let far = id_with_prefix(0x70, 0);
    let near = id_with_prefix(0x01, 0);
    let mid = id_with_prefix(0x10, 0);
    for (i, id) in [far, near, mid].into_iter().enumerate() {
        table.notify(Node::new(id, addr(i as u8, 6881))).await;
    }

    let ids: Vec<_> = table
        .closest_nodes(&NodeId([0u8; 20]), 2)
        .await
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(ids, vec![near, mid]);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_nodes_evicted_and_replaced() {
    let (table, probe) = spawn_table(NodeId([0u8; 20]), 2);
    let a = id_with_prefix(0x80, 1);
    let b = id_with_prefix(0x80, 2);
    let c = id_with_prefix(0x80, 3);
    let d = id_with_prefix(0x80, 4);
    for (i, id) in [a, b, c, d].into_iter().enumerate() {
        table.notify(Node::new(id, addr(i as u8, 6881))).await;
    }

    let bucket = table.snapshot().await.unwrap().bucket(0).cloned().unwrap();
    assert_eq!(bucket.active.iter().map(|n| n.id).collect::<Vec<_>>(), vec![b, a]);
    assert_eq!(bucket.candidates.iter().map(|n| n.id).collect::<Vec<_>>(), vec![d, c]);

    // Liveness check at 15m, retry at 15m+1s, eviction at 15m+2s.
    sleep(Duration::from_secs(15 * 60 + 3)).await;

    let pings = probe.pings.lock().clone();
    assert_eq!(pings.iter().filter(|id| **id == a).count(), 2);
    assert_eq!(pings.iter().filter(|id| **id == b).count(), 2);

    let bucket = table.snapshot().await.unwrap().bucket(0).cloned().unwrap();
    let mut active: Vec<_> = bucket.active.iter().map(|n| n.id).collect();
    active.sort_by_key(|id| id.0);
    assert_eq!(active, vec![c, d]);
    assert!(bucket.candidates.is_empty());
    assert_eq!(table.stats().await.known, 2);
}

#[tokio::test(start_paused = true)]
async fn test_answer_between_pings_keeps_node() {
    let (table, _) = spawn_table(NodeId([0u8; 20]), 2);
    let a = id_with_prefix(0x80, 1);
    let b = id_with_prefix(0x80, 2);
    let c = id_with_prefix(0x80, 3);
    for (i, id) in [a, b, c].into_iter().enumerate() {
        table.notify(Node::new(id, addr(i as u8, 6881))).await;
    }

    sleep(Duration::from_millis(15 * 60 * 1000 + 500)).await;
    table.notify(Node::new(a, addr(0, 6881))).await;
    sleep(Duration::from_secs(3)).await;

    let bucket = table.snapshot().await.unwrap().bucket(0).cloned().unwrap();
    assert_eq!(bucket.active.iter().map(|n| n.id).collect::<Vec<_>>(), vec![c, a]);
    assert!(bucket.candidates.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_single_missed_ping_is_not_eviction() {
    let (table, probe) = spawn_table(NodeId([0u8; 20]), 8);
    let a = id_with_prefix(0x80, 1);
    table.notify(Node::new(a, addr(1, 6881))).await;

    sleep(Duration::from_millis(15 * 60 * 1000 + 1500)).await;
    assert_eq!(probe.pings.lock().len(), 2);
    assert_eq!(table.stats().await.active, 1);
}

#[tokio::test]
async fn test_snapshot_persist_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.json");
    let owner = NodeId::generate();

    let config = TableConfig {
        snapshot_path: Some(path.clone()),
        ..TableConfig::default()
    };
    let table = RoutingTable::spawn(
        owner,
        config,
        RecordingProbe::default(),
        CancellationToken::new(),
    );
    for i in 0..30u8 {
        table.notify(Node::new(NodeId::generate(), addr(i, 6881))).await;
    }
    let before = table.snapshot().await.unwrap();
    table.shutdown().await;

    let loaded = TableSnapshot::load(&path).await.unwrap();
    assert_eq!(loaded.owner_id, owner);
    assert_eq!(loaded.buckets, before.buckets);
    assert!(loaded.active_count() > 0);

    let (restored, _) = spawn_table(loaded.owner_id, 8);
    let replayed = restored.restore(&loaded).await;
    assert_eq!(replayed, loaded.active_count() + loaded.candidate_count());

    let after = restored.snapshot().await.unwrap();
    for bucket in &loaded.buckets {
        let got = after.bucket(bucket.index).unwrap();
        assert_eq!(got.active, bucket.active);
        assert_eq!(got.candidates, bucket.candidates);
    }
}

#[tokio::test]
async fn test_snapshot_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = TableSnapshot::load(&dir.path().join("nope.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::Io(_)));
}

#[test]
fn test_message_ping_round_trip() {
    let our_id = NodeId::generate();
    let tid = Bytes::from_static(b"aa");

    let encoded = DhtMessage::ping(tid.clone(), &our_id).encode();
    let parsed = DhtMessage::parse(&encoded).unwrap();

    assert_eq!(parsed.transaction_id(), &tid);
    assert_eq!(parsed.sender(), Some(&our_id));
    assert!(matches!(
        parsed,
        DhtMessage::Query {
            query: DhtQuery::Ping,
            ..
        }
    ));
}

#[test]
fn test_message_wire_form() {
    let msg = DhtMessage::ping(Bytes::from_static(b"aa"), &NodeId([b'a'; 20]));
    assert_eq!(
        msg.encode(),
        b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe".to_vec()
    );
}

#[test]
fn test_message_find_node_and_get_peers() {
    let our_id = NodeId::generate();
    let target = NodeId::generate();

    let parsed =
        DhtMessage::parse(&DhtMessage::find_node(Bytes::from_static(b"bb"), &our_id, target).encode())
            .unwrap();
    assert!(matches!(
        parsed,
        DhtMessage::Query { query: DhtQuery::FindNode { target: t }, .. } if t == target
    ));

    let info_hash = [0xAB; 20];
    let parsed =
        DhtMessage::parse(&DhtMessage::get_peers(Bytes::from_static(b"cc"), &our_id, info_hash).encode())
            .unwrap();
    assert!(matches!(
        parsed,
        DhtMessage::Query { query: DhtQuery::GetPeers { info_hash: h }, .. } if h == info_hash
    ));
}

#[test]
fn test_message_announce_peer() {
    let our_id = NodeId::generate();
    let info_hash = [7u8; 20];
    let msg = DhtMessage::announce_peer(
        Bytes::from_static(b"dd"),
        &our_id,
        info_hash,
        51413,
        Bytes::from_static(b"tok"),
    );

    let parsed = DhtMessage::parse(&msg.encode()).unwrap();
    assert_eq!(parsed, msg);

    // Query arguments use the standard `info_hash` key.
    let raw = crate::bencode::decode(&msg.encode()).unwrap();
    assert!(raw.get(b"a").unwrap().get(b"info_hash").is_some());
}

#[test]
fn test_message_implied_port() {
    let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaa12:implied_porti1e9:info_hash20:bbbbbbbbbbbbbbbbbbbb4:porti0e5:token1:xe1:q13:announce_peer1:t2:ee1:y1:qe";
    let parsed = DhtMessage::parse(raw).unwrap();
    match parsed {
        DhtMessage::Query {
            query:
                DhtQuery::AnnouncePeer {
                    implied_port, port, ..
                },
            ..
        } => {
            assert!(implied_port);
            assert_eq!(port, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_message_unknown_method() {
    let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q9:vote_blah1:t2:ff1:y1:qe";
    let parsed = DhtMessage::parse(raw).unwrap();
    assert!(matches!(
        parsed,
        DhtMessage::Query { query: DhtQuery::Unknown { ref method }, .. } if method == "vote_blah"
    ));
}

#[test]
fn test_message_rejects_malformed() {
    assert!(DhtMessage::parse(b"").is_err());
    assert!(DhtMessage::parse(b"i42e").is_err());
    assert!(DhtMessage::parse(b"d1:t2:aa1:y1:xe").is_err());
    // Query without a sender id.
    assert!(DhtMessage::parse(b"d1:ade1:q4:ping1:t2:aa1:y1:qe").is_err());
    // Ragged compact node list.
    assert!(DhtMessage::parse(b"d1:rd2:id20:aaaaaaaaaaaaaaaaaaaa5:nodes3:abce1:t2:aa1:y1:re").is_err());
}

#[test]
fn test_response_kind_inferred_from_fields() {
    let id = NodeId::generate();
    let tid = Bytes::from_static(b"ee");
    let nodes = vec![Node::new(NodeId::generate(), addr(9, 6881))];

    let responses = [
        DhtResponse::Ping { id },
        DhtResponse::FindNode {
            id,
            nodes: nodes.clone(),
        },
        DhtResponse::GetPeers {
            id,
            token: Bytes::from_static(b"12345678"),
            nodes: nodes.clone(),
            values: vec![addr(3, 51413)],
        },
    ];

    for response in responses {
        let msg = DhtMessage::response(tid.clone(), response);
        assert_eq!(DhtMessage::parse(&msg.encode()).unwrap(), msg);
    }
}

#[test]
fn test_error_message_round_trip() {
    let msg = DhtMessage::error(Bytes::from_static(b"zz"), ERROR_METHOD_UNKNOWN, "Method Unknown");
    let parsed = DhtMessage::parse(&msg.encode()).unwrap();
    assert_eq!(parsed, msg);
    assert_eq!(parsed.sender(), None);
}

#[test]
fn test_compact_peer() {
    let peer = addr(4, 6881);
    let encoded = encode_compact_peer(&peer).unwrap();
    assert_eq!(encoded, [10, 0, 0, 4, 0x1A, 0xE1]);
    assert_eq!(decode_compact_peer(&encoded), Some(peer));
    assert_eq!(decode_compact_peer(&encoded[..5]), None);
}

fn local_config() -> crate::config::DhtConfig {
    crate::config::DhtConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        bootstrap_nodes: Vec::new(),
        ..Default::default()
    }
}

fn ignore_announces() -> AnnounceHandler {
    Arc::new(|_: PeerAnnouncement| {})
}

/// Sends `msg` and waits for the reply carrying its transaction id. The
/// server may query us on its own in the meantime; those are skipped.
async fn query(client: &UdpSocket, server: SocketAddr, msg: &DhtMessage) -> DhtMessage {
    client.send_to(&msg.encode(), server).await.unwrap();
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = DhtMessage::parse(&buf[..n]).unwrap();
        if reply.transaction_id() == msg.transaction_id() {
            return reply;
        }
    }
}

#[tokio::test]
async fn test_server_answers_queries() {
    let server = DhtServer::bind(local_config(), ignore_announces()).await.unwrap();
    let server_id = *server.our_id();
    let server_addr = server.local_addr();
    let table = server.routing_table().clone();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(server.run(shutdown.clone()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_id = NodeId::generate();

    let reply = query(
        &client,
        server_addr,
        &DhtMessage::ping(Bytes::from_static(b"p1"), &client_id),
    )
    .await;
    assert_eq!(reply.transaction_id().as_ref(), b"p1");
    assert_eq!(reply.sender(), Some(&server_id));

    // The client was recorded, so find_node returns it.
    let reply = query(
        &client,
        server_addr,
        &DhtMessage::find_node(Bytes::from_static(b"f1"), &client_id, client_id),
    )
    .await;
    match reply {
        DhtMessage::Response {
            response: DhtResponse::FindNode { nodes, .. },
            ..
        } => assert_eq!(nodes[0].id, client_id),
        other => panic!("unexpected {:?}", other),
    }
    assert!(table.stats().await.active >= 1);

    let reply = query(
        &client,
        server_addr,
        &DhtMessage::get_peers(Bytes::from_static(b"g1"), &client_id, [3u8; 20]),
    )
    .await;
    match reply {
        DhtMessage::Response {
            response: DhtResponse::GetPeers { token, .. },
            ..
        } => assert_eq!(token.len(), 8),
        other => panic!("unexpected {:?}", other),
    }

    shutdown.cancel();
    timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_server_harvests_announces() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = DhtServer::bind(
        local_config(),
        Arc::new(move |announce: PeerAnnouncement| {
            let _ = tx.send(announce);
        }),
    )
    .await
    .unwrap();
    let server_addr = server.local_addr();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_port = client.local_addr().unwrap().port();
    let client_id = NodeId::generate();
    let info_hash = [9u8; 20];

    let explicit = DhtMessage::announce_peer(
        Bytes::from_static(b"a1"),
        &client_id,
        info_hash,
        51413,
        Bytes::from_static(b"whatever"),
    );
    let reply = query(&client, server_addr, &explicit).await;
    assert!(matches!(
        reply,
        DhtMessage::Response {
            response: DhtResponse::Ping { .. },
            ..
        }
    ));

    let announce = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(announce.info_hash, info_hash);
    assert_eq!(announce.node_id, client_id);
    assert_eq!(announce.addr, SocketAddr::from(([127, 0, 0, 1], 51413)));

    let implied = DhtMessage::Query {
        transaction_id: Bytes::from_static(b"a2"),
        sender: client_id,
        query: DhtQuery::AnnouncePeer {
            info_hash,
            port: 1,
            implied_port: true,
            token: Bytes::new(),
        },
    };
    query(&client, server_addr, &implied).await;
    let announce = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(announce.addr.port(), client_port);

    shutdown.cancel();
}

#[tokio::test]
async fn test_server_survives_garbage_and_rejects_unknown_methods() {
    let server = DhtServer::bind(local_config(), ignore_announces()).await.unwrap();
    let server_addr = server.local_addr();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"not bencode at all", server_addr).await.unwrap();
    client.send_to(b"d1:y1:qe", server_addr).await.unwrap();

    let unknown = DhtMessage::Query {
        transaction_id: Bytes::from_static(b"u1"),
        sender: NodeId::generate(),
        query: DhtQuery::Unknown {
            method: "sample_infohashes".into(),
        },
    };
    match query(&client, server_addr, &unknown).await {
        DhtMessage::Error { code, .. } => assert_eq!(code, ERROR_METHOD_UNKNOWN),
        other => panic!("unexpected {:?}", other),
    }

    let reply = query(
        &client,
        server_addr,
        &DhtMessage::ping(Bytes::from_static(b"p2"), &NodeId::generate()),
    )
    .await;
    assert_eq!(reply.transaction_id().as_ref(), b"p2");

    shutdown.cancel();
}

#[tokio::test]
async fn test_server_adopts_snapshot_owner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.json");
    let owner = NodeId::generate();
    let peer = Node::new(owner.random_in_bucket(3), addr(5, 6881));

    TableSnapshot {
        owner_id: owner,
        saved_at: 0,
        buckets: vec![BucketSnapshot {
            index: 3,
            last_updated: 0,
            active: vec![peer],
            candidates: Vec::new(),
        }],
    }
    .save(&path)
    .await
    .unwrap();

    let config = crate::config::DhtConfig {
        snapshot_path: Some(path.clone()),
        ..local_config()
    };
    let server = DhtServer::bind(config, ignore_announces()).await.unwrap();
    assert_eq!(server.our_id(), &owner);

    let snapshot = server.routing_table().snapshot().await.unwrap();
    assert_eq!(snapshot.bucket(3).unwrap().active, vec![peer]);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    server.run(shutdown).await.unwrap();
    assert_eq!(TableSnapshot::load(&path).await.unwrap().owner_id, owner);
}
