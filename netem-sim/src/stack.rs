use std::{net::Ipv4Addr, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::nic::Nic;

/// A userspace network stack that can be plugged into the emulated network.
///
/// The stack consumes the packets arriving on the NIC's incoming queue and emits raw IPv4
/// datagrams on its outgoing queue. How it does so is entirely up to the implementation, the
/// emulator only cares about the address it answers on.
pub trait Stack: Send + Sync {
    /// The IPv4 address this stack owns.
    fn ip_address(&self) -> Ipv4Addr;

    /// Attaches the stack to `nic`. The stack should stop using the NIC once `cancel` fires.
    fn attach(&self, cancel: CancellationToken, nic: Arc<Nic>);
}
