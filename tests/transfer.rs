//! Integration tests for the stop-and-wait data path: exact delivery,
//! fragmentation, ordering, and delivery through a half-lossy channel.

mod common;

use std::sync::Arc;
use std::time::Duration;

use netstack_sim::transport::TransportConfig;

use common::{deliver_all, drop_every_other, endpoint, fast_config, transport_pair, Tape};

/// A text envelope crosses the transport byte-for-byte.
#[tokio::test]
async fn text_message_delivered_byte_for_byte() {
    let (client, server) = transport_pair(deliver_all(), deliver_all(), fast_config());

    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };
    let client_conn = client.connect(endpoint("HOST_S", 10002)).await.unwrap();
    let server_conn = accepting.await.unwrap().unwrap();

    let payload =
        br#"{"type":"text","sender":"HOST_A","recipient":"HOST_B","timestamp":0,"content":"hi"}"#;

    let receiving = tokio::spawn(async move { server_conn.receive().await });
    client_conn.send(payload).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), receiving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.as_deref(), Some(&payload[..]));
}

/// A 10 000-byte message leaves as three fragments (4096, 4096, 1808)
/// with `more` flags (true, true, false) and reassembles exactly.
#[tokio::test]
async fn large_message_fragments_at_mss_and_reassembles() {
    let tape = Tape::new();
    let (client, server) = transport_pair(tape.hook("c->s"), deliver_all(), fast_config());

    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };
    let client_conn = client.connect(endpoint("HOST_S", 10002)).await.unwrap();
    let server_conn = accepting.await.unwrap().unwrap();

    let message = vec![b'x'; 10_000];
    let receiving = tokio::spawn(async move { server_conn.receive().await });
    client_conn.send(&message).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), receiving)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.len(), 10_000);
    assert_eq!(got, message);

    let fragments: Vec<(bool, usize)> = tape
        .entries()
        .iter()
        .filter(|(_, s)| !s.is_syn() && !s.is_ack() && !s.is_fin())
        .map(|(_, s)| (s.more, s.payload.len()))
        .collect();
    assert_eq!(
        fragments,
        vec![(true, 4096), (true, 4096), (false, 1808)],
        "fragment shapes"
    );
}

/// With every second segment dropped in both directions, the message
/// still arrives exactly once.
#[tokio::test]
async fn half_lossy_channel_still_delivers_exactly_once() {
    let config = TransportConfig {
        retransmit_timeout: Duration::from_millis(50),
        ..TransportConfig::default()
    };
    let (client, server) = transport_pair(drop_every_other(), drop_every_other(), config);

    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };
    let client_conn = tokio::time::timeout(
        Duration::from_secs(10),
        client.connect(endpoint("HOST_S", 10002)),
    )
    .await
    .expect("connect timed out under loss")
    .expect("connect failed");
    let server_conn = tokio::time::timeout(Duration::from_secs(10), accepting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let payload =
        br#"{"type":"text","sender":"HOST_A","recipient":"HOST_B","timestamp":0,"content":"hi"}"#;

    let receiving = {
        let server_conn = Arc::clone(&server_conn);
        tokio::spawn(async move { server_conn.receive().await })
    };
    tokio::time::timeout(Duration::from_secs(10), client_conn.send(payload))
        .await
        .expect("send timed out under loss")
        .expect("send failed");

    let got = tokio::time::timeout(Duration::from_secs(10), receiving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.as_deref(), Some(&payload[..]));

    // Exactly once: nothing further is waiting on the receive path.
    let nothing_more = tokio::time::timeout(Duration::from_millis(300), server_conn.receive()).await;
    assert!(nothing_more.is_err(), "message must not be delivered twice");
}

/// Messages sent in sequence arrive in the same order.
#[tokio::test]
async fn messages_preserve_order() {
    let (client, server) = transport_pair(deliver_all(), deliver_all(), fast_config());

    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };
    let client_conn = client.connect(endpoint("HOST_S", 10002)).await.unwrap();
    let server_conn = accepting.await.unwrap().unwrap();

    const COUNT: usize = 8;
    let receiving = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..COUNT {
            got.push(server_conn.receive().await.unwrap().unwrap());
        }
        got
    });

    for i in 0..COUNT {
        let msg = format!("message-{i:02}");
        client_conn.send(msg.as_bytes()).await.unwrap();
    }

    let got = tokio::time::timeout(Duration::from_secs(5), receiving)
        .await
        .unwrap()
        .unwrap();
    for (i, message) in got.iter().enumerate() {
        assert_eq!(message, format!("message-{i:02}").as_bytes(), "message {i}");
    }
}

/// An empty message is legal: one empty fragment, delivered as an empty
/// (but present) message.
#[tokio::test]
async fn empty_message_roundtrips() {
    let (client, server) = transport_pair(deliver_all(), deliver_all(), fast_config());

    let accepting = {
        let server = server.clone();
        tokio::spawn(async move { server.accept().await })
    };
    let client_conn = client.connect(endpoint("HOST_S", 10002)).await.unwrap();
    let server_conn = accepting.await.unwrap().unwrap();

    let receiving = tokio::spawn(async move { server_conn.receive().await });
    client_conn.send(b"").await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), receiving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.as_deref(), Some(&b""[..]));
}
