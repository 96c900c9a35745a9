use std::{net::SocketAddrV4, sync::Arc, time::Duration};

use netem::{
    dpi::{EndpointBlock, SniBlock, SniThrottle, ThrottleConfig},
    fast_link_factory, Backbone, DpiEngine, Protocol,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{client_hello, tcp, udp, TestStack, CLIENT, SERVER, SILENCE};

fn censored(cancel: &CancellationToken, dpi: Arc<dyn DpiEngine>) -> (TestStack, TestStack) {
    let backbone = Backbone::new();
    let factory = fast_link_factory();

    let client = TestStack::new(CLIENT);
    backbone.add_client(cancel, &client, &factory, dpi);
    let server = TestStack::new(SERVER);
    backbone.add_server(cancel, &server, &factory);

    (client, server)
}

#[tokio::test]
async fn endpoint_block_drops_matching_datagrams() {
    let _ = tracing_subscriber::fmt::try_init();
    let cancel = CancellationToken::new();
    let dpi = EndpointBlock::new(SERVER, 53, Protocol::Udp);
    let (client, server) = censored(&cancel, Arc::new(dpi));

    let source = SocketAddrV4::new(CLIENT, 5353);
    client.send(udp(source, SocketAddrV4::new(SERVER, 53), b"blocked"));
    client.send(udp(source, SocketAddrV4::new(SERVER, 5353), b"allowed"));

    // Queues are FIFO, so the first datagram to arrive is the one that got through.
    let received = server.recv(Duration::from_secs(1)).await.expect("nothing delivered");
    assert_eq!(received.payload(), b"allowed");
    assert!(server.recv(SILENCE).await.is_none());

    cancel.cancel();
}

#[tokio::test]
async fn sni_block_blackholes_the_flow() {
    let cancel = CancellationToken::new();
    let dpi = Arc::new(SniBlock::new("blocked.example"));
    let (client, server) = censored(&cancel, Arc::clone(&dpi) as Arc<dyn DpiEngine>);

    let blocked = SocketAddrV4::new(CLIENT, 40000);
    let allowed = SocketAddrV4::new(CLIENT, 40001);
    let https = SocketAddrV4::new(SERVER, 443);

    client.send(tcp(blocked, https, client_hello("blocked.example")));
    client.send(tcp(allowed, https, client_hello("allowed.example")));

    let received = server.recv(Duration::from_secs(1)).await.expect("nothing delivered");
    assert_eq!(received.source(), allowed);
    assert_eq!(received.parse_tls_server_name().unwrap(), "allowed.example");
    assert_eq!(dpi.flows().len(), 1);

    // The server's packets on the blocked flow are dropped on their way back to the client.
    server.send(tcp(https, blocked, &b"server hello"[..]));
    server.send(tcp(https, allowed, &b"server hello"[..]));
    let received = client.recv(Duration::from_secs(1)).await.expect("nothing delivered");
    assert_eq!(received.destination(), allowed);

    // So are later client packets on the blocked flow.
    client.send(tcp(blocked, https, &b"retry"[..]));
    assert!(server.recv(SILENCE).await.is_none());

    cancel.cancel();
}

#[tokio::test]
async fn server_networks_are_not_inspected() {
    let cancel = CancellationToken::new();
    let backbone = Backbone::new();
    let factory = fast_link_factory();

    // Blocking rules only apply to the network they are installed on.
    let censored = TestStack::new(CLIENT);
    let dpi = SniBlock::new("blocked.example");
    backbone.add_client(&cancel, &censored, &factory, Arc::new(dpi));
    let server = TestStack::new(SERVER);
    backbone.add_server(&cancel, &server, &factory);

    let source = SocketAddrV4::new(SERVER, 40000);
    let destination = SocketAddrV4::new(CLIENT, 443);
    server.send(tcp(source, destination, client_hello("blocked.example")));

    // The hello leaves the server network untouched, and enters the client network right to
    // left, where SNI is never inspected.
    let received = censored.recv(Duration::from_secs(1)).await.expect("hello not delivered");
    assert_eq!(received.parse_tls_server_name().unwrap(), "blocked.example");

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn sni_throttle_delays_server_replies() {
    let cancel = CancellationToken::new();
    let config = ThrottleConfig {
        bandwidth_bytes_per_sec: 1_000_000,
        latency: Duration::from_millis(300),
    };
    let dpi = SniThrottle::with_config("slow.example", config);
    let (client, server) = censored(&cancel, Arc::new(dpi));

    let slow = SocketAddrV4::new(CLIENT, 40000);
    let https = SocketAddrV4::new(SERVER, 443);

    // The ClientHello itself goes through at full speed.
    let start = Instant::now();
    client.send(tcp(slow, https, client_hello("slow.example")));
    server.recv(Duration::from_secs(1)).await.expect("hello not delivered");
    assert!(start.elapsed() < Duration::from_millis(300));

    let start = Instant::now();
    server.send(tcp(https, slow, &b"server hello"[..]));
    let reply = client.recv(Duration::from_secs(5)).await.expect("reply not delivered");
    assert_eq!(reply.payload(), b"server hello");
    assert!(start.elapsed() >= Duration::from_millis(300));

    cancel.cancel();
}
