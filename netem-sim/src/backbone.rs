use std::{net::Ipv4Addr, sync::Arc};

use netem_wire::{packet, Packet};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    dpi::{DpiEngine, NoDpi},
    link::LinkFactory,
    nic::{Nic, NicError},
    stack::Stack,
};

/// Why the backbone dropped a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The packet is not a routable IPv4 TCP/UDP datagram.
    #[error("cannot dissect packet: {0}")]
    Dissect(#[source] packet::Error),
    /// The packet arrived with a TTL of zero.
    #[error("TTL exceeded for packet to {0}")]
    TtlExceeded(Ipv4Addr),
    /// No network is registered for the destination address.
    #[error("no route to host {0}")]
    NoRoute(Ipv4Addr),
    /// The mutated packet could not be written back.
    #[error("cannot serialize packet: {0}")]
    Serialize(#[source] packet::Error),
    /// The destination NIC refused the packet.
    #[error("cannot deliver packet to {destination}: {source}")]
    Nic {
        /// Address the packet was routed to.
        destination: Ipv4Addr,
        /// Why the NIC refused it.
        #[source]
        source: NicError,
    },
}

/// The router joining every stub network in the emulation.
///
/// Each registered network is reachable through its internet-side NIC, keyed by the IP address
/// of the stack behind it. The backbone is a single hop: a routed packet loses exactly one unit
/// of TTL.
///
/// Cloning a `Backbone` yields another handle to the same routing table.
#[derive(Debug, Clone, Default)]
pub struct Backbone {
    routes: Arc<RwLock<FxHashMap<Ipv4Addr, Arc<Nic>>>>,
}

impl Backbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a client network to the backbone, with `dpi` inspecting every packet on its link.
    ///
    /// Two NICs are created: the local one, attached to `stack`, and the internet-facing one,
    /// which the backbone routes through. Everything keeps running until `cancel` fires.
    ///
    /// # Panics
    ///
    /// If a network with the same IP address is already registered.
    pub fn add_client(
        &self,
        cancel: &CancellationToken,
        stack: &dyn Stack,
        link_factory: &LinkFactory,
        dpi: Arc<dyn DpiEngine>,
    ) {
        let address = stack.ip_address();
        let local = Arc::new(Nic::new());
        let internet = Arc::new(Nic::new());

        self.register(address, Arc::clone(&internet));

        let link = link_factory(Arc::clone(&local), Arc::clone(&internet), dpi);
        tracing::debug!(%address, ?link, "adding network");
        link.up(cancel.clone());

        stack.attach(cancel.clone(), local);

        let span = tracing::debug_span!("backbone", %address, nic = internet.name());
        tokio::spawn(self.clone().run_routing(internet, cancel.clone()).instrument(span));
    }

    /// Like [`Backbone::add_client`], but the link never inspects traffic.
    pub fn add_server(
        &self,
        cancel: &CancellationToken,
        stack: &dyn Stack,
        link_factory: &LinkFactory,
    ) {
        self.add_client(cancel, stack, link_factory, Arc::new(NoDpi));
    }

    /// Returns the addresses of all registered networks.
    pub fn routes(&self) -> Vec<Ipv4Addr> {
        let mut routes: Vec<_> = self.routes.read().keys().copied().collect();
        routes.sort_unstable();
        routes
    }

    /// Routes a single packet coming out of a registered network.
    ///
    /// The packet's TTL is decremented and the packet is written to the outgoing queue of the
    /// internet NIC registered for its destination address.
    pub fn route(&self, packet: &[u8]) -> Result<(), RouteError> {
        let mut packet = Packet::dissect(packet).map_err(RouteError::Dissect)?;
        let destination = packet.destination_ip_address();

        if packet.time_to_live() == 0 {
            return Err(RouteError::TtlExceeded(destination));
        }
        packet.decrement_time_to_live();

        let Some(nic) = self.routes.read().get(&destination).cloned() else {
            return Err(RouteError::NoRoute(destination));
        };

        let serialized = packet.serialize().map_err(RouteError::Serialize)?;
        nic.write_outgoing(serialized).map_err(|source| RouteError::Nic { destination, source })
    }

    fn register(&self, address: Ipv4Addr, nic: Arc<Nic>) {
        let mut routes = self.routes.write();
        assert!(!routes.contains_key(&address), "address {address} is already registered");
        routes.insert(address, nic);
    }

    async fn run_routing(self, internet: Arc<Nic>, cancel: CancellationToken) {
        loop {
            let packet = match internet.read_incoming(&cancel).await {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(?e, "routing stopped");
                    break;
                }
            };

            if let Err(e) = self.route(&packet) {
                tracing::debug!(%e, "dropping packet");
            }
        }
    }
}
