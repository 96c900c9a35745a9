//! Deep packet inspection.
//!
//! A [`Link`](crate::Link) hands every packet it forwards to its [`DpiEngine`], which decides
//! whether the packet is dropped ([`DpiEngine::divert`]) and, if not, whether delivery should be
//! held back for a while ([`DpiEngine::delay`]). The engines in this module emulate common
//! censorship techniques; test authors are expected to write their own for anything else.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::nic::Nic;

mod endpoint;
mod flow;
mod sni;

pub use endpoint::EndpointBlock;
pub use flow::{Flow, FlowList};
pub use sni::{SniBlock, SniThrottle, ThrottleConfig};

/// The direction a packet is travelling along a link.
///
/// Engines installed on a client network see client-to-internet traffic as
/// [`Direction::LeftToRight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the local NIC towards the internet NIC.
    LeftToRight,
    /// From the internet NIC towards the local NIC.
    RightToLeft,
}

impl Direction {
    #[inline]
    pub const fn reversed(self) -> Self {
        match self {
            Self::LeftToRight => Self::RightToLeft,
            Self::RightToLeft => Self::LeftToRight,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeftToRight => f.write_str("left-to-right"),
            Self::RightToLeft => f.write_str("right-to-left"),
        }
    }
}

/// A packet-inspection policy invoked by a link for every packet crossing it.
#[async_trait]
pub trait DpiEngine: Send + Sync + fmt::Debug {
    /// Returns `true` if the packet must not be forwarded.
    fn divert(&self, direction: Direction, source: &Nic, destination: &Nic, packet: &[u8])
        -> bool;

    /// Called for every packet that was not diverted, before it is forwarded. Implementations
    /// may hold up the calling forwarding task to emulate extra latency; they must return
    /// promptly once `cancel` fires.
    async fn delay(&self, _cancel: &CancellationToken, _direction: Direction, _packet: &[u8]) {}
}

/// The engine that lets everything through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDpi;

impl DpiEngine for NoDpi {
    fn divert(&self, _: Direction, _: &Nic, _: &Nic, _: &[u8]) -> bool {
        false
    }
}
