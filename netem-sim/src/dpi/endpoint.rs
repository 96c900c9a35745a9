use std::net::Ipv4Addr;

use netem_wire::{Packet, Protocol};

use super::{Direction, DpiEngine};
use crate::nic::Nic;

/// Blackholes every packet sent to a given server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointBlock {
    /// Only packets travelling in this direction are inspected.
    pub direction: Direction,
    /// Destination address to block.
    pub address: Ipv4Addr,
    /// Destination port to block.
    pub port: u16,
    /// Transport protocol to block.
    pub protocol: Protocol,
}

impl EndpointBlock {
    /// Blocks client-to-server traffic towards `address:port` over `protocol`.
    pub fn new(address: Ipv4Addr, port: u16, protocol: Protocol) -> Self {
        Self { direction: Direction::LeftToRight, address, port, protocol }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

impl DpiEngine for EndpointBlock {
    fn divert(&self, direction: Direction, _: &Nic, _: &Nic, packet: &[u8]) -> bool {
        if direction != self.direction {
            return false;
        }

        let packet = match Packet::dissect(packet) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!(?e, "cannot dissect packet");
                return false;
            }
        };

        let blocked = packet.match_destination(self.protocol, self.address, self.port);
        if blocked {
            tracing::debug!(
                endpoint = %self.address, port = self.port, protocol = %self.protocol,
                "dropping packet to blocked endpoint"
            );
        }
        blocked
    }
}
