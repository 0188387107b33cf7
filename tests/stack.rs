//! End-to-end test of the full stack over real UDP loopback: transport →
//! network → link → physical, with every packet crossing the router.

use std::sync::Arc;
use std::time::Duration;

use netstack_sim::addr::Port;
use netstack_sim::physical::ChannelConfig;
use netstack_sim::topology::{build_host_transport, build_router_network, Topology};
use netstack_sim::transport::TransportConfig;

/// The default LAN shifted to a test-local port range.
fn test_topology() -> Topology {
    let mut topology = Topology::default_lan();
    for (i, host) in topology.hosts.iter_mut().enumerate() {
        host.port = Port::new(42000 + i as u16).unwrap();
    }
    topology.router.port = Port::new(42003).unwrap();
    topology
}

#[tokio::test]
async fn full_stack_message_crosses_the_router() {
    let topology = test_topology();

    let router = Arc::new(
        build_router_network(&topology, ChannelConfig::reliable())
            .await
            .expect("router stack"),
    );
    let forwarding = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            loop {
                if let Err(e) = router.process_one().await {
                    panic!("router failed: {e}");
                }
            }
        })
    };

    let config = TransportConfig {
        retransmit_timeout: Duration::from_millis(300),
        ..TransportConfig::default()
    };
    let alice = build_host_transport(&topology, "alice", ChannelConfig::reliable(), config.clone())
        .await
        .expect("alice stack");
    let server = build_host_transport(&topology, "server", ChannelConfig::reliable(), config)
        .await
        .expect("server stack");

    let server_addr = topology.node("server").unwrap().virtual_addr();
    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };

    let alice_conn = tokio::time::timeout(Duration::from_secs(10), alice.connect(server_addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let server_conn = tokio::time::timeout(Duration::from_secs(10), accepting)
        .await
        .expect("accept timed out")
        .expect("accept task panicked")
        .expect("accept failed");

    let receiving = {
        let server_conn = Arc::clone(&server_conn);
        tokio::spawn(async move { server_conn.receive().await })
    };
    alice_conn
        .send(b"hello through the router")
        .await
        .expect("send failed");

    let got = tokio::time::timeout(Duration::from_secs(10), receiving)
        .await
        .expect("receive timed out")
        .unwrap()
        .unwrap();
    assert_eq!(got.as_deref(), Some(&b"hello through the router"[..]));

    // Clean four-way teardown across the router.
    let closing_alice = tokio::spawn(async move { alice_conn.close().await });
    let closing_server = tokio::spawn(async move {
        assert_eq!(server_conn.receive().await.unwrap(), None);
        server_conn.close().await
    });
    tokio::time::timeout(Duration::from_secs(10), closing_alice)
        .await
        .expect("alice close timed out")
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), closing_server)
        .await
        .expect("server close timed out")
        .unwrap()
        .unwrap();

    assert_eq!(alice.active_connections(), 0);
    assert_eq!(server.active_connections(), 0);
    assert!(router.stats().forwarded > 0, "packets crossed the router");

    forwarding.abort();
}
