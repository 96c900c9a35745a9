use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Arc, OnceLock},
    time::Duration,
};

use bytes::Bytes;
use netem::{DatagramBuilder, Nic, Packet, Stack};
pub use netem_wire::test_utils::client_hello;
use tokio_util::sync::CancellationToken;

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// How long to wait before concluding that a packet is not coming.
pub const SILENCE: Duration = Duration::from_millis(200);

/// A stack that does nothing on its own and lets the test drive its NIC.
#[derive(Debug)]
pub struct TestStack {
    address: Ipv4Addr,
    nic: OnceLock<Arc<Nic>>,
}

impl TestStack {
    pub fn new(address: Ipv4Addr) -> Self {
        Self { address, nic: OnceLock::new() }
    }

    pub fn nic(&self) -> &Arc<Nic> {
        self.nic.get().expect("stack is not attached")
    }

    pub fn send(&self, packet: Bytes) {
        self.nic().write_outgoing(packet).unwrap();
    }

    /// Waits for the next packet delivered to this stack.
    pub async fn recv(&self, within: Duration) -> Option<Packet> {
        let cancel = CancellationToken::new();
        let packet = tokio::time::timeout(within, self.nic().read_incoming(&cancel)).await.ok()?;
        Some(Packet::dissect(&packet.unwrap()).unwrap())
    }
}

impl Stack for TestStack {
    fn ip_address(&self) -> Ipv4Addr {
        self.address
    }

    fn attach(&self, _cancel: CancellationToken, nic: Arc<Nic>) {
        tracing::debug!(address = %self.address, nic = nic.name(), "stack attached");
        self.nic.set(nic).expect("stack attached twice");
    }
}

pub fn udp(source: SocketAddrV4, destination: SocketAddrV4, payload: &'static [u8]) -> Bytes {
    DatagramBuilder::udp(source, destination).payload(payload).build().unwrap()
}

pub fn tcp(source: SocketAddrV4, destination: SocketAddrV4, payload: impl Into<Bytes>) -> Bytes {
    DatagramBuilder::tcp(source, destination).payload(payload).build().unwrap()
}
