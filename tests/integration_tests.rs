//! End-to-end tests over loopback TCP.
//!
//! Each test starts real nodes with fixture event loops and drives them
//! through the public `Node` API.

use kadlink_core::{
    AuthEvent, AuthFailureReason, Keypair, Metadata, NetworkError, NetworkEvent, NodeConfig,
    PeerId, StreamDirection, StreamState,
};
use kadlink_integration_tests::fixtures::{AcceptPolicy, Cluster, TestNode, TestNodeOptions};
use kadlink_integration_tests::test_helpers::{ci_timeout, wait_for};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_mutual_auth_success() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();

    assert!(b.node.connect(&a.address.to_string()).await);
    assert!(b.wait_for_auth_success(&a.peer_id(), TIMEOUT).await);
    assert!(a.wait_for_auth_success(&b.peer_id(), TIMEOUT).await);

    assert!(a.node.is_peer_authenticated(&b.peer_id()));
    assert!(b.node.is_peer_authenticated(&a.peer_id()));
    assert_eq!(a.node.authenticated_peers(), vec![b.peer_id()]);

    // PeerConnected precedes the verification request on each side
    let events = b.events();
    let connected = events
        .iter()
        .position(|e| matches!(e, NetworkEvent::PeerConnected { .. }))
        .unwrap();
    let verify = events
        .iter()
        .position(|e| e.kind() == "VerifyPorRequest")
        .unwrap();
    assert!(connected < verify);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_rejection_seen_on_both_sides() {
    let a = TestNode::with_policy(AcceptPolicy::Reject("not on the list".to_string()))
        .await
        .unwrap();
    let b = TestNode::spawn().await.unwrap();

    assert!(b.node.connect(&a.address.to_string()).await);

    let on_a = a.wait_for_auth_failure(&b.peer_id(), TIMEOUT).await;
    assert_eq!(
        on_a,
        Some(AuthFailureReason::Rejected {
            by_remote: false,
            reason: "not on the list".to_string()
        })
    );
    let on_b = b.wait_for_auth_failure(&a.peer_id(), TIMEOUT).await;
    assert_eq!(
        on_b,
        Some(AuthFailureReason::Rejected {
            by_remote: true,
            reason: "not on the list".to_string()
        })
    );

    assert!(
        wait_for(TIMEOUT, || {
            !a.node.is_connected(&b.peer_id()) && !b.node.is_connected(&a.peer_id())
        })
        .await
    );
    assert!(a.find_event(|e| e.kind() == "MutualAuthSuccess").is_none());
    assert!(b.find_event(|e| e.kind() == "MutualAuthSuccess").is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_auth_timeout() {
    let mut config = NodeConfig::default();
    config.auth.timeout = Duration::from_millis(300);
    let a = TestNode::with_options(TestNodeOptions {
        config: config.clone(),
        policy: AcceptPolicy::Ignore,
        ..TestNodeOptions::default()
    })
    .await
    .unwrap();
    let b = TestNode::with_options(TestNodeOptions {
        config,
        ..TestNodeOptions::default()
    })
    .await
    .unwrap();

    assert!(b.node.connect(&a.address.to_string()).await);

    let on_a = a.wait_for_auth_failure(&b.peer_id(), TIMEOUT).await;
    let on_b = b.wait_for_auth_failure(&a.peer_id(), TIMEOUT).await;
    for reason in [&on_a, &on_b] {
        assert!(
            matches!(
                reason,
                Some(AuthFailureReason::Timeout | AuthFailureReason::ConnectionLost)
            ),
            "unexpected reason {reason:?}"
        );
    }
    assert!(
        on_a == Some(AuthFailureReason::Timeout) || on_b == Some(AuthFailureReason::Timeout)
    );
    assert!(wait_for(TIMEOUT, || !b.node.is_connected(&a.peer_id())).await);

    a.shutdown().await;
    b.shutdown().await;
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_stream_gate_before_auth() {
    let a = TestNode::with_policy(AcceptPolicy::Ignore).await.unwrap();
    let b = TestNode::spawn().await.unwrap();

    assert!(b.node.connect(&a.address.to_string()).await);
    assert!(wait_for(TIMEOUT, || a.node.is_connected(&b.peer_id())).await);

    assert!(matches!(
        b.node.open_stream(&a.peer_id()).await,
        Err(NetworkError::Unauthenticated(p)) if p == a.peer_id()
    ));
    assert!(matches!(
        a.node.open_stream(&b.peer_id()).await,
        Err(NetworkError::Unauthenticated(p)) if p == b.peer_id()
    ));
    assert!(a.find_event(|e| e.kind() == "IncomingStream").is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_stream_gate_holds_until_opener_authenticates() {
    let a = TestNode::with_policy(AcceptPolicy::Ignore).await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    assert!(a.node.connect(&b.address.to_string()).await);

    let request = a
        .wait_for_event(TIMEOUT, |e| e.kind() == "VerifyPorRequest")
        .await
        .unwrap();
    let NetworkEvent::AuthEvent(AuthEvent::VerifyPorRequest { connection_id, .. }) = &request
    else {
        panic!("unexpected event {request:?}");
    };

    // B has accepted A; A is still undecided
    assert!(
        b.wait_for_event(TIMEOUT, |e| e.kind() == "VerifyPorRequest")
            .await
            .is_some()
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        a.node.open_stream(&b.peer_id()).await,
        Err(NetworkError::Unauthenticated(p)) if p == b.peer_id()
    ));
    assert!(a.find_event(|e| e.kind() == "MutualAuthSuccess").is_none());

    a.node
        .submit_por_verification(*connection_id, true, Metadata::new())
        .await
        .unwrap();
    assert!(a.wait_for_auth_success(&b.peer_id(), TIMEOUT).await);

    let stream = a.node.open_stream(&b.peer_id()).await.unwrap();
    stream.write(b"after auth").await.unwrap();
    stream.write_eof().await.unwrap();
    let reply = stream.read_to_end(ci_timeout(TIMEOUT)).await.unwrap();
    assert_eq!(reply, b"ACK: after auth");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_stream_message_delivers_without_reply() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    b.node
        .stream_message(&a.peer_id(), b"one way", ci_timeout(TIMEOUT))
        .await
        .unwrap();
    assert!(wait_for(TIMEOUT, || a.received_messages().len() == 1).await);
    let received = a.received_messages();
    assert_eq!(received[0].peer_id, b.peer_id());
    assert_eq!(received[0].text, "one way");

    let stranger = PeerId::random();
    assert!(matches!(
        b.node.stream_message(&stranger, b"lost", TIMEOUT).await,
        Err(NetworkError::PeerUnreachable(p)) if p == stranger
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_length_prefixed_reads() {
    let options = TestNodeOptions {
        answer_streams: false,
        ..TestNodeOptions::default()
    };
    let a = TestNode::with_options(options.clone()).await.unwrap();
    let b = TestNode::with_options(options).await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    let outbound = b.node.open_stream(&a.peer_id()).await.unwrap();
    let inbound = a
        .wait_for_incoming_stream(&b.peer_id(), TIMEOUT)
        .await
        .unwrap();

    let body = b"framed body";
    outbound
        .write(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    outbound.write(body).await.unwrap();
    outbound.write(b"tail").await.unwrap();
    outbound.write_eof().await.unwrap();

    let header = inbound.read_exact(4, ci_timeout(TIMEOUT)).await.unwrap();
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    assert_eq!(len, body.len());
    assert_eq!(
        inbound.read_exact(len, ci_timeout(TIMEOUT)).await.unwrap(),
        body
    );
    assert!(wait_for(TIMEOUT, || inbound.is_remote_closed()).await);
    assert_eq!(inbound.read(ci_timeout(TIMEOUT)).await.unwrap(), b"tail");
    assert!(matches!(
        inbound.read(ci_timeout(TIMEOUT)).await,
        Err(NetworkError::StreamClosed(_))
    ));

    outbound.close().await.unwrap();
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_stream_lifecycle_and_error_channel() {
    let options = TestNodeOptions {
        answer_streams: false,
        ..TestNodeOptions::default()
    };
    let a = TestNode::with_options(options.clone()).await.unwrap();
    let b = TestNode::with_options(options).await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    let outbound = b.node.open_stream(&a.peer_id()).await.unwrap();
    assert_eq!(outbound.direction(), StreamDirection::Outbound);
    assert_eq!(outbound.state(), StreamState::Open);

    let inbound = a
        .wait_for_incoming_stream(&b.peer_id(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(inbound.direction(), StreamDirection::Inbound);
    assert_eq!(inbound.state(), StreamState::Open);
    assert_eq!(inbound.id(), outbound.id());

    outbound.write(b"hello").await.unwrap();
    outbound.write_eof().await.unwrap();
    assert_eq!(outbound.state(), StreamState::LocalClosed);
    assert!(matches!(
        outbound.write(b"late").await,
        Err(NetworkError::StreamClosed(_))
    ));

    let data = inbound.read_to_end(ci_timeout(TIMEOUT)).await.unwrap();
    assert_eq!(data, b"hello");
    assert!(inbound.is_remote_closed());

    inbound.error_write(b"boom").await.unwrap();
    assert!(wait_for(TIMEOUT, || outbound.has_error_data()).await);
    assert_eq!(outbound.error_read(), Some(b"boom".to_vec()));
    assert!(!outbound.has_error_data());
    assert_eq!(outbound.error_read(), None);

    inbound.write(b"reply").await.unwrap();
    inbound.write_eof().await.unwrap();
    assert_eq!(inbound.state(), StreamState::Closed);

    let reply = outbound.read_to_end(ci_timeout(TIMEOUT)).await.unwrap();
    assert_eq!(reply, b"reply");
    assert!(wait_for(TIMEOUT, || outbound.is_closed()).await);

    outbound.close().await.unwrap();
    outbound.close().await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_partial_then_error() {
    let options = TestNodeOptions {
        answer_streams: false,
        ..TestNodeOptions::default()
    };
    let a = TestNode::with_options(options.clone()).await.unwrap();
    let b = TestNode::with_options(options).await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    let outbound = b.node.open_stream(&a.peer_id()).await.unwrap();
    let inbound = a
        .wait_for_incoming_stream(&b.peer_id(), TIMEOUT)
        .await
        .unwrap();

    inbound.write(b"part").await.unwrap();
    inbound.error_write(b"fail").await.unwrap();

    assert!(matches!(
        outbound.read_to_end(ci_timeout(TIMEOUT)).await,
        Err(NetworkError::RemoteError(id)) if id == outbound.id()
    ));
    assert!(outbound.has_error_data());
    assert_eq!(outbound.error_read(), Some(b"fail".to_vec()));

    // The partial data survives the error
    let data = outbound
        .read_to_end(Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(data, b"part");
    assert_eq!(outbound.state(), StreamState::Open);

    outbound.close().await.unwrap();
    assert!(wait_for(TIMEOUT, || inbound.is_closed()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_closes_streams() {
    let options = TestNodeOptions {
        answer_streams: false,
        ..TestNodeOptions::default()
    };
    let a = TestNode::with_options(options.clone()).await.unwrap();
    let b = TestNode::with_options(options).await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    let outbound = b.node.open_stream(&a.peer_id()).await.unwrap();
    let inbound = a
        .wait_for_incoming_stream(&b.peer_id(), TIMEOUT)
        .await
        .unwrap();

    assert!(b.node.disconnect(&a.peer_id()).await);
    assert!(!b.node.disconnect(&a.peer_id()).await);
    assert!(outbound.is_closed());
    assert!(wait_for(TIMEOUT, || inbound.is_closed()).await);

    let peer_a = a.peer_id();
    assert!(
        b.wait_for_event(TIMEOUT, |e| {
            matches!(e, NetworkEvent::PeerDisconnected { peer_id } if *peer_id == peer_a)
        })
        .await
        .is_some()
    );

    a.shutdown().await;
    b.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_closes_everything() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    a.node.stop().await.unwrap();
    assert!(a.node.connected_peers().is_empty());
    assert!(!a.node.connect(&b.address.to_string()).await);
    assert!(matches!(
        a.node.listen("/ip4/127.0.0.1/tcp/0").await,
        Err(NetworkError::Bind(_))
    ));
    assert!(wait_for(TIMEOUT, || !b.node.is_connected(&a.peer_id())).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_connect_with_wrong_peer_id_fails() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    let c = TestNode::spawn().await.unwrap();

    let wrong = a.address.with_peer_id(c.peer_id());
    assert!(!b.node.connect(&wrong.to_string()).await);
    assert!(!b.node.is_connected(&a.peer_id()));

    // Already connected peers short-circuit
    assert!(b.node.connect(&a.address.to_string()).await);
    assert!(b.node.connect(&a.address.to_string()).await);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_bootstrap_find_stream_scenario() {
    let cluster = Cluster::star(2, TIMEOUT).await.unwrap();
    let hub = &cluster.hub;
    let b = &cluster.spokes[0];
    let c = &cluster.spokes[1];

    assert!(!c.node.is_connected(&b.peer_id()));
    assert!(c.node.find(&b.peer_id()).await);

    let addresses = c.node.search_peer_addresses(&b.peer_id());
    assert!(
        addresses.contains(&b.address),
        "{addresses:?} should contain {}",
        b.address
    );
    let b_addr = b.address.clone();
    let peer_b = b.peer_id();
    assert!(
        c.find_event(|e| {
            matches!(e, NetworkEvent::KadAddressAdded { peer_id, address }
                if *peer_id == peer_b && *address == b_addr)
        })
        .is_some()
    );

    assert!(c.node.connect(&addresses[0].to_string()).await);
    assert!(c.wait_for_auth_success(&b.peer_id(), TIMEOUT).await);

    let stream = c.node.open_stream(&b.peer_id()).await.unwrap();
    stream.write(b"hello from C").await.unwrap();
    stream.write_eof().await.unwrap();
    let reply = stream.read_to_end(ci_timeout(TIMEOUT)).await.unwrap();
    assert_eq!(reply, b"ACK: hello from C");

    let received = b.received_messages();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].peer_id, c.peer_id());
    assert_eq!(received[0].text, "hello from C");

    // The hub routes both spokes
    let known: Vec<_> = hub.node.kad_known_peers().into_iter().map(|(p, _)| p).collect();
    assert!(known.contains(&b.peer_id()));
    assert!(known.contains(&c.peer_id()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_find_unknown_peer_fails() {
    let cluster = Cluster::star(1, TIMEOUT).await.unwrap();
    let spoke = &cluster.spokes[0];

    let stranger = TestNode::spawn().await.unwrap();
    assert!(!spoke.node.find(&stranger.peer_id()).await);
    assert!(spoke.node.search_peer_addresses(&stranger.peer_id()).is_empty());

    stranger.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_dht_disabled_node_is_not_routed() {
    let mut config = NodeConfig::default();
    config.dht.enabled = false;
    let a = TestNode::with_options(TestNodeOptions {
        config,
        ..TestNodeOptions::default()
    })
    .await
    .unwrap();
    let b = TestNode::spawn().await.unwrap();
    assert!(b.connect_and_authenticate(&a, TIMEOUT).await);

    assert!(a.node.kad_known_peers().is_empty());
    assert!(!a.node.find(&PeerId::random()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_routing_updates_are_published() {
    let cluster = Cluster::star(1, TIMEOUT).await.unwrap();
    let hub = &cluster.hub;
    let spoke = &cluster.spokes[0];

    let hub_id = hub.peer_id();
    assert!(
        spoke
            .wait_for_event(TIMEOUT, |e| {
                matches!(e, NetworkEvent::KadRoutingUpdated { peer_id, addresses }
                    if *peer_id == hub_id && !addresses.is_empty())
            })
            .await
            .is_some()
    );

    let spoke_id = spoke.peer_id();
    let is_spoke_update = |e: &NetworkEvent| {
        matches!(e, NetworkEvent::KadRoutingUpdated { peer_id, .. } if *peer_id == spoke_id)
    };
    assert!(hub.wait_for_event(TIMEOUT, is_spoke_update).await.is_some());
    let before = hub.count_events(is_spoke_update);

    // A lookup through the hub refreshes the spoke's entry there
    assert!(!spoke.node.find(&PeerId::random()).await);
    assert!(wait_for(TIMEOUT, || hub.count_events(is_spoke_update) > before).await);

    cluster.shutdown().await;
}

/// Keypairs whose peer ids share one bucket of `local`'s routing table
fn keypairs_in_top_bucket(local: &PeerId, count: usize) -> Vec<Keypair> {
    let local = local.to_node_id();
    std::iter::repeat_with(Keypair::generate)
        .filter(|kp| kp.peer_id().to_node_id().bucket_index(&local) == Some(255))
        .take(count)
        .collect()
}

#[tokio::test]
async fn test_full_bucket_keeps_live_entry_and_evicts_dead_one() {
    let mut config = NodeConfig::default();
    config.dht.k = 1;
    config.dht.alpha = 1;
    let hub = TestNode::with_options(TestNodeOptions {
        config,
        ..TestNodeOptions::default()
    })
    .await
    .unwrap();

    let mut spokes = Vec::new();
    for keypair in keypairs_in_top_bucket(&hub.peer_id(), 3) {
        spokes.push(
            TestNode::with_options(TestNodeOptions {
                keypair: Some(keypair),
                ..TestNodeOptions::default()
            })
            .await
            .unwrap(),
        );
    }
    let third = spokes.pop().unwrap();
    let second = spokes.pop().unwrap();
    let first = spokes.pop().unwrap();
    let routed = |hub: &TestNode| -> Vec<PeerId> {
        hub.node.kad_known_peers().into_iter().map(|(p, _)| p).collect()
    };

    assert!(first.connect_and_authenticate(&hub, TIMEOUT).await);
    assert!(wait_for(TIMEOUT, || routed(&hub) == vec![first.peer_id()]).await);

    // The live entry answers the ping and stays
    let first_id = first.peer_id();
    let first_updates = |e: &NetworkEvent| {
        matches!(e, NetworkEvent::KadRoutingUpdated { peer_id, .. } if *peer_id == first_id)
    };
    assert!(second.connect_and_authenticate(&hub, TIMEOUT).await);
    assert!(wait_for(TIMEOUT, || hub.count_events(first_updates) >= 2).await);
    assert_eq!(routed(&hub), vec![first.peer_id()]);

    // Once gone, the stale entry gives way to the newcomer
    first.shutdown().await;
    assert!(wait_for(TIMEOUT, || !hub.node.is_connected(&first_id)).await);
    assert!(third.connect_and_authenticate(&hub, TIMEOUT).await);
    assert!(wait_for(TIMEOUT, || routed(&hub) == vec![third.peer_id()]).await);
    let third_id = third.peer_id();
    assert!(
        hub.find_event(|e| {
            matches!(e, NetworkEvent::KadRoutingUpdated { peer_id, .. } if *peer_id == third_id)
        })
        .is_some()
    );

    second.shutdown().await;
    third.shutdown().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn test_lookup_dials_unknown_peers_when_enabled() {
    // hub <-> b <-> target, with the searchers attached to the hub only
    let hub = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    let target = TestNode::spawn().await.unwrap();
    assert!(b.connect_and_authenticate(&hub, TIMEOUT).await);
    assert!(target.connect_and_authenticate(&b, TIMEOUT).await);

    let mut config = NodeConfig::default();
    config.dht.dial_unknown_peers = true;
    let dialing = TestNode::with_options(TestNodeOptions {
        config,
        ..TestNodeOptions::default()
    })
    .await
    .unwrap();
    let passive = TestNode::spawn().await.unwrap();
    assert!(dialing.connect_and_authenticate(&hub, TIMEOUT).await);
    assert!(passive.connect_and_authenticate(&hub, TIMEOUT).await);
    assert!(wait_for(TIMEOUT, || hub.node.kad_known_peers().len() == 3).await);
    assert!(wait_for(TIMEOUT, || b.node.kad_known_peers().len() == 2).await);

    assert!(!passive.node.find(&target.peer_id()).await);
    assert!(!passive.node.is_connected(&b.peer_id()));

    assert!(dialing.node.find(&target.peer_id()).await);
    assert!(dialing.node.is_peer_authenticated(&b.peer_id()));
    assert!(
        dialing
            .node
            .search_peer_addresses(&target.peer_id())
            .contains(&target.address)
    );

    for node in [dialing, passive, target, b, hub] {
        node.shutdown().await;
    }
}
