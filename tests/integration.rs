//! End-to-end loopback tests: server and client engines talking over
//! real sockets.

use std::sync::Arc;
use std::time::Duration;

use netwire::client::Client;
use netwire::error::{DisconnectReason, RequestError, SendError};
use netwire::protocol::{commands, CompressionMode};
use netwire::registry::{InboundMessage, RawDeserializer};
use netwire::server::Server;
use tokio::sync::mpsc;

const ECHO: u16 = 1;
const SINK: u16 = 2;
const BLOB: u16 = 3;

/// Wire an echo command onto a server: every payload arriving under
/// `command_id` is sent back to the requester under the same response
/// id.
fn install_echo(server: &Server, command_id: u16) {
    server
        .registry()
        .add_command_with(Arc::new(RawDeserializer), &[command_id])
        .unwrap();
    let echo_server = server.clone();
    server
        .add_data_received(command_id, move |msg: &InboundMessage, _unit: &()| {
            let server = echo_server.clone();
            let peer = msg.peer;
            let response_id = msg.response_id;
            let payload = msg.payload().to_vec();
            tokio::spawn(async move {
                let _ = server
                    .send_with_response_id(peer, command_id, &payload, response_id)
                    .await;
            });
            true
        })
        .unwrap();
}

/// Forward every payload arriving under `command_id` into a channel.
fn install_sink(server: &Server, command_id: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    server
        .registry()
        .add_command_with(Arc::new(RawDeserializer), &[command_id])
        .unwrap();
    server
        .add_data_received(command_id, move |msg: &InboundMessage, _unit: &()| {
            let _ = tx.send(msg.payload().to_vec());
            true
        })
        .unwrap();
    rx
}

async fn recv_soon<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_tcp_echo_roundtrip() {
    let server = Server::builder().build();
    install_echo(&server, ECHO);
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    let reply = client.send_r(ECHO, b"hello engine").await.unwrap();
    assert_eq!(&reply[..], b"hello engine");
    assert_eq!(client.outstanding_requests(), 0);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_tcp_ping() {
    let server = Server::builder().build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    let echoed = client.ping().await.unwrap();
    assert!(echoed.timestamp > 0);
    assert_eq!(client.outstanding_requests(), 0);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_fire_and_forget_send() {
    let server = Server::builder().build();
    let mut sink = install_sink(&server, SINK);
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    client.send(SINK, b"one-way").await.unwrap();

    assert_eq!(recv_soon(&mut sink).await, b"one-way");

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_typed_command_dispatch() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Greeting {
        name: String,
        attempt: u32,
    }

    let server = Server::builder().build();
    server.add_command::<Greeting>(&[SINK]).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .add_data_received(SINK, move |_msg, greeting: &Greeting| {
            let _ = tx.send((greeting.name.clone(), greeting.attempt));
            true
        })
        .unwrap();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    client
        .send_value(
            SINK,
            &Greeting {
                name: "netwire".into(),
                attempt: 3,
            },
        )
        .await
        .unwrap();

    let (name, attempt) = recv_soon(&mut rx).await;
    assert_eq!(name, "netwire");
    assert_eq!(attempt, 3);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_request_timeout_releases_slot() {
    let server = Server::builder().build();
    // SINK swallows the request and never answers.
    let mut _sink = install_sink(&server, SINK);
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    let started = std::time::Instant::now();
    let err = client
        .send_r_with_timeout(SINK, b"anyone there?", Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.outstanding_requests(), 0);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_connect_events_fire() {
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let server = Server::builder()
        .on_client_connected(move |client| {
            let _ = connected_tx.send(client.peer());
        })
        .build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel();
    let client = Client::builder()
        .on_connected(move || {
            let _ = handshake_tx.send(());
        })
        .connect(addr, Duration::from_secs(5))
        .await
        .unwrap();

    let peer = recv_soon(&mut connected_rx).await;
    recv_soon(&mut handshake_rx).await;
    assert_eq!(server.client_count(), 1);
    assert_eq!(peer.ip(), addr.ip());

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_graceful_disconnect() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::builder()
        .on_client_disconnected(move |peer, reason| {
            let _ = tx.send((peer, reason));
        })
        .build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    {
        let server = server.clone();
        wait_until(move || server.client_count() == 1).await;
    }

    client.dispose().await;

    let (peer, reason) = recv_soon(&mut rx).await;
    assert_eq!(reason, DisconnectReason::Graceful);
    assert_eq!(server.client_count(), 0);

    // The peer is gone: further sends report it.
    let err = server.send(peer, SINK, b"anyone?").await.unwrap_err();
    assert_eq!(err, SendError::Disconnected);

    server.dispose();
}

#[tokio::test]
async fn test_server_sent_disconnect_fires_client_event() {
    let server = Server::builder().build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::builder()
        .on_disconnected(move |reason| {
            let _ = tx.send(reason);
        })
        .connect(addr, Duration::from_secs(5))
        .await
        .unwrap();
    {
        let server = server.clone();
        wait_until(move || server.client_count() == 1).await;
    }

    // The server tells the client to go away.
    let reached = server.send_to_all(commands::DISCONNECT, b"").await;
    assert_eq!(reached, 1);

    let reason = recv_soon(&mut rx).await;
    assert_eq!(reason, DisconnectReason::Graceful);
    {
        let client = client.clone();
        wait_until(move || !client.is_connected()).await;
    }

    server.dispose();
}

#[tokio::test]
async fn test_client_sees_server_side_identity() {
    let server = Server::builder().build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    {
        let client = client.clone();
        wait_until(move || client.client_info().is_some()).await;
    }

    let info = client.client_info().unwrap();
    assert!(info.client_id > 0);
    assert!(!info.name.is_empty());

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_chunked_payload_reassembles() {
    let server = Server::builder().build();
    let mut sink = install_sink(&server, BLOB);
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // A small frame limit on the client forces fragmentation.
    let client = Client::builder()
        .max_payload_size(32_768)
        .connect(addr, Duration::from_secs(5))
        .await
        .unwrap();

    let payload: Vec<u8> = (0..131_072u32).map(|i| (i % 251) as u8).collect();
    client.send(BLOB, &payload).await.unwrap();

    let received = recv_soon(&mut sink).await;
    assert_eq!(received.len(), 131_072);
    assert_eq!(received, payload);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_chunked_response_reassembles() {
    let server = Server::builder().max_payload_size(16_384).build();
    install_echo(&server, ECHO);
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::builder()
        .max_payload_size(16_384)
        .connect(addr, Duration::from_secs(5))
        .await
        .unwrap();

    // Client request and server reply both fragment.
    let payload = vec![0x5A; 50_000];
    let reply = client.send_r(ECHO, &payload).await.unwrap();
    assert_eq!(&reply[..], &payload[..]);
    assert_eq!(client.outstanding_requests(), 0);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server = Server::builder().build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let mut clients = Vec::new();
    let mut inboxes = Vec::new();
    for _ in 0..3 {
        let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
        client
            .registry()
            .add_command_with(Arc::new(RawDeserializer), &[SINK])
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        client
            .add_data_received(SINK, move |msg: &InboundMessage, _unit: &()| {
                let _ = tx.send(msg.payload().to_vec());
                true
            })
            .unwrap();
        clients.push(client);
        inboxes.push(rx);
    }

    {
        let server = server.clone();
        wait_until(move || server.client_count() == 3).await;
    }

    let reached = server.send_to_all(SINK, b"fan out").await;
    assert_eq!(reached, 3);

    for inbox in &mut inboxes {
        assert_eq!(recv_soon(inbox).await, b"fan out");
    }

    for client in &clients {
        client.dispose().await;
    }
    server.dispose();
}

#[tokio::test]
async fn test_one_shot_subscriber_over_the_wire() {
    let server = Server::builder().build();
    server
        .registry()
        .add_command_with(Arc::new(RawDeserializer), &[SINK])
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .add_data_received(SINK, move |msg: &InboundMessage, _unit: &()| {
            let _ = tx.send(msg.payload().to_vec());
            false // unsubscribe after the first delivery
        })
        .unwrap();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    client.send(SINK, b"first").await.unwrap();
    client.send(SINK, b"second").await.unwrap();

    assert_eq!(recv_soon(&mut rx).await, b"first");
    // The handler unsubscribed itself: the channel must stay quiet.
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err(), "one-shot handler ran twice");

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_compressed_traffic() {
    let server = Server::builder()
        .compression(CompressionMode::Lz4)
        .build();
    install_echo(&server, ECHO);
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::builder()
        .compression(CompressionMode::Lz4)
        .connect(addr, Duration::from_secs(5))
        .await
        .unwrap();

    // Highly compressible payload survives both directions.
    let payload = vec![0x11; 40_000];
    let reply = client.send_r(ECHO, &payload).await.unwrap();
    assert_eq!(&reply[..], &payload[..]);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_udp_ping_and_assignment() {
    let server = Server::builder().build();
    let addr = server.run_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect_udp(addr, Duration::from_secs(5)).await.unwrap();
    {
        let client = client.clone();
        wait_until(move || client.udp_assignment().is_some()).await;
    }
    assert!(client.udp_assignment().unwrap().peer_assigned_id > 0);

    let echoed = client.ping().await.unwrap();
    assert!(echoed.timestamp > 0);
    assert_eq!(client.outstanding_requests(), 0);

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_udp_echo_roundtrip() {
    let server = Server::builder().build();
    install_echo(&server, ECHO);
    let addr = server.run_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect_udp(addr, Duration::from_secs(5)).await.unwrap();
    {
        let client = client.clone();
        wait_until(move || client.udp_assignment().is_some()).await;
    }

    let reply = client.send_r(ECHO, b"over datagrams").await.unwrap();
    assert_eq!(&reply[..], b"over datagrams");

    client.dispose().await;
    server.dispose();
}

#[tokio::test]
async fn test_server_initiated_push() {
    let server = Server::builder().build();
    let addr = server.run("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = Client::connect(addr, Duration::from_secs(5)).await.unwrap();
    client
        .registry()
        .add_command_with(Arc::new(RawDeserializer), &[SINK])
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .add_data_received(SINK, move |msg: &InboundMessage, _unit: &()| {
            let _ = tx.send(msg.payload().to_vec());
            true
        })
        .unwrap();

    {
        let server = server.clone();
        wait_until(move || server.client_count() == 1).await;
    }

    // Push from the server to the connected peer.
    let reached = server.send_to_all(SINK, b"pushed").await;
    assert_eq!(reached, 1);
    assert_eq!(recv_soon(&mut rx).await, b"pushed");

    client.dispose().await;
    server.dispose();
}
