//! Integration test: peer attachment, peer gossip and end-to-end delivery.

use std::collections::BTreeSet;
use std::time::Duration;

use relaynet_core::ApplicationEnvelope;
use relaynet_integration_tests::{eventually, free_address, peer_config, start_router};
use relaynet_network::PeerClient;
use tokio::sync::mpsc;

async fn attach(
    id: &str,
    router: &str,
) -> (PeerClient, mpsc::UnboundedReceiver<ApplicationEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = PeerClient::attach(id, &[router.to_string()], peer_config(), move |msg| {
        let _ = tx.send(msg);
    })
    .await
    .expect("peer attaches");
    (client, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_location_gossips_to_neighbor() {
    let a_addr = free_address();
    let b_addr = free_address();
    let a = start_router("a", &a_addr, &[]).await;
    let b = start_router("b", &b_addr, &[a_addr.clone()]).await;
    assert!(eventually(|| a.routers().len() == 1).await);

    let (_peer, _rx) = attach("chain1:nodeX", &a_addr).await;
    let expected = BTreeSet::from([a_addr.clone()]);

    assert!(eventually(|| a.lookup_peer("chain1:nodeX") == expected).await);
    assert!(
        eventually(|| b.lookup_peer("chain1:nodeX") == expected).await,
        "b never learned where chain1:nodeX lives"
    );
    assert_eq!(b.lookup_peer("chain1:"), expected);
    assert_eq!(a.summary().peers, vec!["chain1:nodeX".to_string()]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_delivered_across_routers() {
    let a_addr = free_address();
    let b_addr = free_address();
    let a = start_router("a", &a_addr, &[]).await;
    let b = start_router("b", &b_addr, &[a_addr.clone()]).await;
    assert!(eventually(|| a.routers().len() == 1 && b.routers().len() == 1).await);

    let (sender, _sender_rx) = attach("chain1:alice", &a_addr).await;
    let (_receiver, mut receiver_rx) = attach("chain2:bob", &b_addr).await;
    assert!(eventually(|| !a.lookup_peer("chain2:bob").is_empty()).await);

    assert!(sender.send("chain2:bob", b"hello bob".to_vec(), None));
    let msg = tokio::time::timeout(Duration::from_secs(5), receiver_rx.recv())
        .await
        .expect("message arrives in time")
        .expect("channel open");
    assert_eq!(msg.source_peer_id, "chain1:alice");
    assert_eq!(msg.destination_peer_id, "chain2:bob");
    assert_eq!(msg.body, b"hello bob");

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_prefix_reaches_every_member() {
    let addr = free_address();
    let router = start_router("solo", &addr, &[]).await;

    let (sender, _) = attach("chain1:alice", &addr).await;
    let (_n1, mut rx1) = attach("chain3:n1", &addr).await;
    let (_n2, mut rx2) = attach("chain3:n2", &addr).await;
    assert!(eventually(|| router.local_peers().len() == 3).await);

    assert!(sender.send("chain3:", b"all".to_vec(), None));
    for rx in [&mut rx1, &mut rx2] {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message arrives in time")
            .expect("channel open");
        assert_eq!(msg.body, b"all");
    }

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_detached_peer_is_forgotten() {
    let addr = free_address();
    let router = start_router("solo", &addr, &[]).await;

    let (peer, _rx) = attach("chain1:gone", &addr).await;
    assert!(eventually(|| router.local_peers().len() == 1).await);
    peer.detach().await;
    assert!(eventually(|| router.local_peers().is_empty()).await);
    assert!(eventually(|| router.lookup_peer("chain1:gone").is_empty()).await);

    router.stop().await;
}
