use std::time::Duration;

use async_trait::async_trait;
use netem_common::{constants::KiB, sleep_or_cancelled, transmission_time};
use netem_wire::{Packet, Protocol};
use tokio_util::sync::CancellationToken;

use super::{Direction, DpiEngine, Flow, FlowList};
use crate::nic::Nic;

/// Returns the flow of `packet` if it is a client-to-server TLS ClientHello for `sni`.
fn offending_flow(sni: &str, direction: Direction, packet: &Packet) -> Option<Flow> {
    if direction != Direction::LeftToRight || packet.transport_protocol() != Protocol::Tcp {
        return None;
    }

    match packet.parse_tls_server_name() {
        Ok(name) if name.eq_ignore_ascii_case(sni) => Some(Flow::from_packet(packet)),
        Ok(_) => None,
        Err(e) => {
            tracing::trace!(?e, "not a ClientHello");
            None
        }
    }
}

/// Drops every TLS connection whose ClientHello asks for a given server name.
///
/// Once the ClientHello is seen, the whole flow is blackholed in both directions, including
/// retransmissions of the ClientHello itself.
#[derive(Debug)]
pub struct SniBlock {
    sni: String,
    flows: FlowList,
}

impl SniBlock {
    pub fn new(sni: impl Into<String>) -> Self {
        Self { sni: sni.into(), flows: FlowList::new() }
    }

    /// The flows this rule has blocked so far.
    pub fn flows(&self) -> &FlowList {
        &self.flows
    }
}

impl DpiEngine for SniBlock {
    fn divert(&self, direction: Direction, _: &Nic, _: &Nic, packet: &[u8]) -> bool {
        let packet = match Packet::dissect(packet) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!(?e, "cannot dissect packet");
                return false;
            }
        };

        if self.flows.contains(direction, &packet) {
            tracing::trace!(%direction, "dropping packet of blocked flow");
            return true;
        }

        match offending_flow(&self.sni, direction, &packet) {
            Some(flow) => {
                tracing::debug!(%flow, sni = %self.sni, "blocking flow");
                self.flows.insert(flow);
                true
            }
            None => false,
        }
    }
}

/// Bandwidth and latency applied to throttled flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Rate at which throttled packets drain, in bytes per second.
    pub bandwidth_bytes_per_sec: u64,
    /// Constant delay added to every throttled packet.
    pub latency: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { bandwidth_bytes_per_sec: 16 * KiB, latency: Duration::from_millis(100) }
    }
}

impl ThrottleConfig {
    /// How long delivering a packet of `bytes` is held back.
    pub fn delay_for(&self, bytes: usize) -> Duration {
        transmission_time(bytes, self.bandwidth_bytes_per_sec) + self.latency
    }
}

/// Slows down TLS connections whose ClientHello asks for a given server name.
///
/// The rule never drops anything. After the ClientHello has been observed, each server-to-client
/// packet of the flow holds up the forwarding task that carries it for its transmission time at
/// [`ThrottleConfig::bandwidth_bytes_per_sec`] plus [`ThrottleConfig::latency`]. Any other flow
/// multiplexed onto the same forwarding task is held up as well.
#[derive(Debug)]
pub struct SniThrottle {
    sni: String,
    config: ThrottleConfig,
    flows: FlowList,
}

impl SniThrottle {
    pub fn new(sni: impl Into<String>) -> Self {
        Self::with_config(sni, ThrottleConfig::default())
    }

    pub fn with_config(sni: impl Into<String>, config: ThrottleConfig) -> Self {
        Self { sni: sni.into(), config, flows: FlowList::new() }
    }

    /// The flows this rule is throttling.
    pub fn flows(&self) -> &FlowList {
        &self.flows
    }
}

#[async_trait]
impl DpiEngine for SniThrottle {
    fn divert(&self, direction: Direction, _: &Nic, _: &Nic, packet: &[u8]) -> bool {
        // Only the client's first flight can carry the SNI.
        if direction != Direction::LeftToRight {
            return false;
        }

        let Ok(packet) = Packet::dissect(packet) else {
            return false;
        };

        if let Some(flow) = offending_flow(&self.sni, direction, &packet) {
            if self.flows.insert(flow) {
                tracing::debug!(%flow, sni = %self.sni, "throttling flow");
            }
        }

        false
    }

    async fn delay(&self, cancel: &CancellationToken, direction: Direction, packet: &[u8]) {
        if direction != Direction::RightToLeft || self.flows.is_empty() {
            return;
        }

        let Ok(dissected) = Packet::dissect(packet) else {
            return;
        };
        if !self.flows.contains(direction, &dissected) {
            return;
        }

        let delay = self.config.delay_for(packet.len());
        tracing::trace!(?delay, "delaying packet of throttled flow");
        sleep_or_cancelled(cancel, delay).await;
    }
}
