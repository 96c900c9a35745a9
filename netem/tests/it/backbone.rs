use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use netem::{dpi::NoDpi, fast_link_factory, Backbone, DatagramBuilder, LinkImpairment};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{udp, TestStack, CLIENT, SERVER, SILENCE};

const THIRD: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

fn topology(cancel: &CancellationToken, impairment: LinkImpairment) -> (TestStack, TestStack) {
    let backbone = Backbone::new();
    let factory = impairment.factory();

    let client = TestStack::new(CLIENT);
    backbone.add_client(cancel, &client, &factory, Arc::new(NoDpi));
    let server = TestStack::new(SERVER);
    backbone.add_server(cancel, &server, &factory);

    (client, server)
}

/// Client and server networks exchange a UDP datagram and its reply through the backbone.
#[tokio::test]
async fn udp_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let cancel = CancellationToken::new();
    let (client, server) = topology(&cancel, LinkImpairment::default());

    let client_addr = SocketAddrV4::new(CLIENT, 5353);
    let server_addr = SocketAddrV4::new(SERVER, 53);

    client.send(udp(client_addr, server_addr, b"query"));

    let query = server.recv(Duration::from_secs(1)).await.expect("query not delivered");
    assert_eq!(query.time_to_live(), 63);
    assert_eq!(query.payload(), b"query");
    assert_eq!(query.source(), client_addr);
    assert_eq!(query.destination(), server_addr);

    let reply = DatagramBuilder::udp(client_addr, server_addr)
        .reply()
        .payload(&b"answer"[..])
        .build()
        .unwrap();
    server.send(reply);

    let answer = client.recv(Duration::from_secs(1)).await.expect("answer not delivered");
    assert_eq!(answer.time_to_live(), 63);
    assert_eq!(answer.payload(), b"answer");
    assert_eq!(answer.source(), server_addr);

    cancel.cancel();
}

#[tokio::test]
async fn ttl_decremented_once_per_crossing() {
    let cancel = CancellationToken::new();
    let (client, server) = topology(&cancel, LinkImpairment::default());

    let route = (SocketAddrV4::new(CLIENT, 1), SocketAddrV4::new(SERVER, 2));
    let datagram = DatagramBuilder::udp(route.0, route.1)
        .ttl(1)
        .payload(&b"last hop"[..])
        .build()
        .unwrap();
    client.send(datagram);

    let received = server.recv(Duration::from_secs(1)).await.expect("datagram not delivered");
    assert_eq!(received.time_to_live(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn expired_datagrams_are_dropped() {
    let cancel = CancellationToken::new();
    let (client, server) = topology(&cancel, LinkImpairment::default());

    let route = (SocketAddrV4::new(CLIENT, 1), SocketAddrV4::new(SERVER, 2));
    let expired = DatagramBuilder::udp(route.0, route.1)
        .ttl(0)
        .payload(&b"expired"[..])
        .build()
        .unwrap();
    client.send(expired);

    assert!(server.recv(SILENCE).await.is_none());
    cancel.cancel();
}

#[tokio::test]
async fn unknown_destinations_are_dropped() {
    let cancel = CancellationToken::new();
    let (client, server) = topology(&cancel, LinkImpairment::default());

    let lost = SocketAddrV4::new("10.0.0.9".parse().unwrap(), 53);
    client.send(udp(SocketAddrV4::new(CLIENT, 5353), lost, b"anyone?"));

    assert!(server.recv(SILENCE).await.is_none());
    assert!(client.recv(SILENCE).await.is_none());
    cancel.cancel();
}

#[tokio::test]
#[should_panic(expected = "already registered")]
async fn duplicate_address_panics() {
    let cancel = CancellationToken::new();
    let backbone = Backbone::new();
    let factory = fast_link_factory();

    backbone.add_client(&cancel, &TestStack::new(CLIENT), &factory, Arc::new(NoDpi));
    backbone.add_client(&cancel, &TestStack::new(CLIENT), &factory, Arc::new(NoDpi));
}

#[tokio::test]
async fn distinct_addresses_are_independently_routable() {
    let cancel = CancellationToken::new();
    let backbone = Backbone::new();
    let factory = fast_link_factory();

    let first = TestStack::new(CLIENT);
    let second = TestStack::new(SERVER);
    let third = TestStack::new(THIRD);
    backbone.add_client(&cancel, &first, &factory, Arc::new(NoDpi));
    backbone.add_client(&cancel, &second, &factory, Arc::new(NoDpi));
    backbone.add_server(&cancel, &third, &factory);

    assert_eq!(backbone.routes().len(), 3);

    first.send(udp(SocketAddrV4::new(CLIENT, 1), SocketAddrV4::new(SERVER, 1), b"to second"));
    first.send(udp(SocketAddrV4::new(CLIENT, 1), SocketAddrV4::new(THIRD, 1), b"to third"));

    let at_second = second.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(at_second.payload(), b"to second");
    let at_third = third.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(at_third.payload(), b"to third");

    // Nothing leaks to the network that wasn't addressed.
    assert!(second.recv(SILENCE).await.is_none());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn link_latency_applies_on_both_sides() {
    let cancel = CancellationToken::new();
    let impairment = LinkImpairment { latency: Duration::from_millis(50), ..Default::default() };
    let (client, server) = topology(&cancel, impairment);

    let start = Instant::now();
    client.send(udp(SocketAddrV4::new(CLIENT, 1), SocketAddrV4::new(SERVER, 1), b"slow"));

    server.recv(Duration::from_secs(1)).await.expect("datagram not delivered");
    // One link on the way out of the client network, one on the way into the server network.
    assert!(start.elapsed() >= Duration::from_millis(100));

    cancel.cancel();
}

#[tokio::test]
async fn cancellation_tears_down_topology() {
    let cancel = CancellationToken::new();
    let (client, server) = topology(&cancel, LinkImpairment::default());
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.send(udp(SocketAddrV4::new(CLIENT, 1), SocketAddrV4::new(SERVER, 1), b"too late"));
    assert!(server.recv(SILENCE).await.is_none());
}
