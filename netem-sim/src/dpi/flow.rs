use std::{fmt, net::SocketAddrV4};

use netem_wire::{Packet, Protocol};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use super::Direction;

/// A transport-level conversation: protocol plus the two endpoints, oriented the way the packet
/// that created it was travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    /// Transport protocol of the conversation.
    pub protocol: Protocol,
    /// Endpoint that sent the packet the flow was created from.
    pub source: SocketAddrV4,
    /// Endpoint that packet was addressed to.
    pub destination: SocketAddrV4,
}

impl Flow {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            protocol: packet.transport_protocol(),
            source: packet.source(),
            destination: packet.destination(),
        }
    }

    #[inline]
    pub fn reversed(self) -> Self {
        Self { protocol: self.protocol, source: self.destination, destination: self.source }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.source, self.destination)
    }
}

/// The set of flows a DPI rule has singled out.
///
/// Flows are only ever added, never evicted. Membership is direction-agnostic: a flow recorded
/// from a client-to-server packet also matches the server's replies.
#[derive(Debug, Default)]
pub struct FlowList {
    flows: Mutex<FxHashSet<Flow>>,
}

impl FlowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `flow`. Returns `false` if it was already present.
    pub fn insert(&self, flow: Flow) -> bool {
        self.flows.lock().insert(flow)
    }

    /// Returns `true` if `packet`, seen travelling in `direction`, belongs to a recorded flow.
    ///
    /// Packets travelling right-to-left are flipped before the lookup so that they are compared
    /// in the same orientation as the left-to-right packets flows are recorded from. Both
    /// orientations of each stored flow are tried.
    pub fn contains(&self, direction: Direction, packet: &Packet) -> bool {
        let observed = Flow::from_packet(packet);
        let oriented = match direction {
            Direction::LeftToRight => observed,
            Direction::RightToLeft => observed.reversed(),
        };

        let flows = self.flows.lock();
        flows.contains(&oriented) || flows.contains(&oriented.reversed())
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }
}
