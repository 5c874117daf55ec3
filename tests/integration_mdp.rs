//! End-to-end scenarios exercising real listeners and dialed transports —
//! no mocked sockets anywhere in this file.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use mdp::{framing, Client, Config, DualStackAddr, NodeId, Server, SessionId};

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[tokio::test]
async fn echoes_one_datagram_over_udp() {
    let server = Server::listen(0).await.unwrap();
    server.set_node_id(NodeId(1));
    let remote = loopback(server.local_addr().port());

    let config = Config {
        disable_tcp: true,
        disable_icmdp: true,
        threads: 1,
        ..Config::default()
    };
    let client = Client::dial(NodeId(1), NodeId(1), config, remote).await.unwrap();

    client.write(b"hello world").await.unwrap();

    let (payload, from) = server.read_from().await.unwrap();
    assert_eq!(payload, b"hello world");
    assert_eq!(from.network(), "mdp");
    assert!(from.to_string().starts_with("127.0.0.1:"));

    server.write_to(&payload, &from).await.unwrap();
    let echoed = client.read().await.unwrap();
    assert_eq!(echoed, b"hello world");

    client.close().await.ok();
    server.close().await.unwrap();
}

#[tokio::test]
async fn short_udp_packet_is_dropped_without_unblocking_read_from() {
    let server = Server::listen(0).await.unwrap();
    server.set_node_id(NodeId(1));
    let port = server.local_addr().port();

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.connect(loopback(port)).await.unwrap();
    probe.send(&[1, 2, 3, 4]).await.unwrap(); // shorter than the 8-byte trailer, I4

    let result = tokio::time::timeout(Duration::from_millis(200), server.read_from()).await;
    assert!(result.is_err(), "a short packet must never surface as a datagram");

    server.close().await.unwrap();
}

#[tokio::test]
async fn datagram_for_unregistered_node_is_dropped() {
    let server = Server::listen(0).await.unwrap();
    server.set_node_id(NodeId(1)); // node 1 only; nothing registered in the forward table

    let port = server.local_addr().port();
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.connect(loopback(port)).await.unwrap();

    let wire = framing::frame(b"hello", SessionId(42), NodeId(0xDEADBEEF));
    probe.send(&wire).await.unwrap();

    let result = tokio::time::timeout(Duration::from_millis(200), server.read_from()).await;
    assert!(result.is_err(), "an unroutable node id must not create a session or surface a datagram");

    server.close().await.unwrap();
}

#[tokio::test]
async fn forwarded_session_relays_round_trip_through_a_second_server() {
    let server_b = Server::listen(0).await.unwrap();
    server_b.set_node_id(NodeId(2));
    let addr_b = loopback(server_b.local_addr().port());

    let server_a = Server::listen(0).await.unwrap();
    server_a.set_node_id(NodeId(1));
    server_a.set_forward_node(NodeId(2), DualStackAddr::new_v4(addr_b_ip(addr_b), addr_b.port()));
    let addr_a = loopback(server_a.local_addr().port());

    // Dial A framing every outbound datagram with NodeID=2: A is not that
    // node, so it looks up its forward table and relays on to B instead of
    // terminating the session itself (spec §4.7/§4.8).
    let config = Config {
        disable_tcp: true,
        disable_icmdp: true,
        threads: 1,
        ..Config::default()
    };
    let client = Client::dial(NodeId(2), NodeId(2), config, addr_a).await.unwrap();

    client.write(b"relay me").await.unwrap();

    let (payload, from_b) = server_b.read_from().await.unwrap();
    assert_eq!(payload, b"relay me");

    server_b.write_to(&payload, &from_b).await.unwrap();
    let echoed = client.read().await.unwrap();
    assert_eq!(echoed, b"relay me");

    client.close().await.ok();
    server_a.close().await.unwrap();
    server_b.close().await.unwrap();
}

fn addr_b_ip(addr: SocketAddr) -> std::net::Ipv4Addr {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => ip,
        std::net::IpAddr::V6(_) => unreachable!("loopback() always builds a v4 address"),
    }
}

#[tokio::test]
async fn closing_a_session_concurrently_is_idempotent_and_aggregated() {
    let server = Server::listen(0).await.unwrap();
    server.set_node_id(NodeId(9));
    let remote = loopback(server.local_addr().port());

    // Both TCP and UDP enabled, so the session owns two endpoints when it
    // closes.
    let config = Config {
        disable_icmdp: true,
        threads: 1,
        ..Config::default()
    };
    let client = Arc::new(Client::dial(NodeId(9), NodeId(9), config, remote).await.unwrap());

    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.close().await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.close().await })
    };
    let (a, b) = tokio::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert!(client.is_closed());

    server.close().await.unwrap();
}
