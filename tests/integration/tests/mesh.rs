//! Integration test: routers discovering each other over loopback TCP.

use std::time::Duration;

use relaynet_integration_tests::{
    eventually, free_address, router_over, start_router, tcp_transport, test_router,
};
use relaynet_network::Transport;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_router_full_mesh() {
    let addresses: Vec<String> = (0..3).map(|_| free_address()).collect();
    let r1 = start_router("r1", &addresses[0], &addresses).await;
    let r2 = start_router("r2", &addresses[1], &addresses).await;
    let r3 = start_router("r3", &addresses[2], &addresses).await;
    let routers = [&r1, &r2, &r3];

    let converged = eventually(|| {
        routers.iter().all(|router| {
            addresses
                .iter()
                .filter(|a| a.as_str() != router.address())
                .all(|a| router.next_hop(a).ok().as_deref() == Some(a.as_str()))
        })
    })
    .await;
    assert!(converged, "routers did not converge to a full mesh");

    for router in routers {
        assert_eq!(router.routers().len(), 2);
        assert_eq!(router.summary().routers_cnt, 2);
    }

    for router in routers {
        router.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_routes_through_middle() {
    // a knows b, c knows b: a and c only meet through gossip.
    let a_addr = free_address();
    let b_addr = free_address();
    let c_addr = free_address();
    let b = start_router("b", &b_addr, &[]).await;
    let a = start_router("a", &a_addr, &[b_addr.clone()]).await;
    let c = start_router("c", &c_addr, &[b_addr.clone()]).await;

    assert!(eventually(|| a.next_hop(&b_addr).is_ok() && c.next_hop(&b_addr).is_ok()).await);

    // Router-list gossip eventually links a and c directly.
    let linked = eventually(|| a.next_hop(&c_addr).ok().as_deref() == Some(c_addr.as_str())).await;
    assert!(linked, "a never learned a direct route to c");

    for router in [&a, &b, &c] {
        router.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopped_router_is_forgotten() {
    let a_addr = free_address();
    let b_addr = free_address();
    let a = start_router("a", &a_addr, &[]).await;
    let b = start_router("b", &b_addr, &[a_addr.clone()]).await;

    assert!(eventually(|| a.routers().len() == 1 && b.routers().len() == 1).await);

    b.stop().await;
    assert!(eventually(|| a.routers().is_empty()).await, "a still lists b");
    assert!(a.next_hop(&b_addr).is_err());

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_router_relinks_after_neighbor_crashes() {
    let a_addr = free_address();
    let b_addr = free_address();
    let b_transport = tcp_transport(&b_addr);
    let b = router_over("b", &b_addr, &[], b_transport.clone());
    b.start().await.unwrap().unwrap();
    let a = start_router("a", &a_addr, &[b_addr.clone()]).await;
    assert!(eventually(|| a.routers().len() == 1 && b.routers().len() == 1).await);

    // Kill b's sockets without a CLOSE, as a crash would.
    b_transport.stop().await;
    assert!(eventually(|| a.routers().is_empty()).await, "a never evicted b");
    drop(b);

    // b comes back on the same address knowing nobody; a must dial it.
    let b2 = test_router("b", &b_addr, &[]);
    let mut restarted = false;
    for _ in 0..50 {
        if let Ok(Some(_)) = b2.start().await {
            restarted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(restarted, "b could not rebind its address");

    let relinked = eventually(|| {
        a.routers().iter().any(|r| r.address == b_addr)
            && b2.routers().iter().any(|r| r.address == a_addr)
    })
    .await;
    assert!(relinked, "a never re-dialed the restarted b");

    a.stop().await;
    b2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_discovery_keeps_one_link() {
    let a_addr = free_address();
    let b_addr = free_address();
    let a = test_router("a", &a_addr, &[b_addr.clone()]);
    let b = test_router("b", &b_addr, &[a_addr.clone()]);
    // Start both before either can dial, so both dial each other.
    let (started_a, started_b) = tokio::join!(a.start(), b.start());
    started_a.unwrap().unwrap();
    started_b.unwrap().unwrap();

    assert!(eventually(|| a.routers().len() == 1 && b.routers().len() == 1).await);

    // The surviving link stays up across several liveness sweeps.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(a.routers().len(), 1);
    assert_eq!(b.routers().len(), 1);
    assert_eq!(a.next_hop(&b_addr).unwrap(), b_addr);

    a.stop().await;
    b.stop().await;
}
