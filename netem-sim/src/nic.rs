use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tokio_util::sync::CancellationToken;

/// Process-wide counter used to name NICs. It only ever grows, and restarts with the process.
static NIC_ID_NEXT: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NicError {
    /// The queue is at capacity. The packet was not enqueued.
    #[error("NIC buffer full")]
    BufferFull,
    /// The cancellation token fired while waiting.
    #[error("operation cancelled")]
    Cancelled,
    /// The other end of the queue is gone.
    #[error("NIC queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, NicError>;

/// A bounded packet queue. Writers never wait: when the queue is full the packet is refused.
#[derive(Debug)]
struct Queue {
    tx: mpsc::Sender<Bytes>,
    /// `mpsc` has a single consumer; the lock lets several readers share the queue.
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Mutex::new(rx) }
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<Bytes> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NicError::Cancelled),
            packet = async { self.rx.lock().await.recv().await } => packet.ok_or(NicError::Closed),
        }
    }

    fn write(&self, packet: Bytes) -> Result<()> {
        self.tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => NicError::BufferFull,
            TrySendError::Closed(_) => NicError::Closed,
        })
    }
}

/// A virtual network interface: a named pair of bounded packet queues.
///
/// Whoever the NIC is attached to (a stack, or the backbone) writes the packets it emits to the
/// outgoing queue and reads the packets delivered to it from the incoming queue. The wire side (a
/// [`Link`](crate::Link)) does the opposite.
#[derive(Debug)]
pub struct Nic {
    name: String,
    incoming: Queue,
    outgoing: Queue,
}

impl Default for Nic {
    fn default() -> Self {
        Self::new()
    }
}

impl Nic {
    /// Number of packets each queue holds by default.
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a NIC whose queues hold at most `capacity` packets each.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "NIC capacity must be greater than zero");

        let id = NIC_ID_NEXT.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("nic{id}"),
            incoming: Queue::new(capacity),
            outgoing: Queue::new(capacity),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next packet delivered to this NIC.
    pub async fn read_incoming(&self, cancel: &CancellationToken) -> Result<Bytes> {
        self.incoming.read(cancel).await
    }

    /// Waits for the next packet emitted through this NIC.
    pub async fn read_outgoing(&self, cancel: &CancellationToken) -> Result<Bytes> {
        self.outgoing.read(cancel).await
    }

    /// Delivers a packet to this NIC, failing with [`NicError::BufferFull`] instead of waiting.
    pub fn write_incoming(&self, packet: Bytes) -> Result<()> {
        self.incoming.write(packet)
    }

    /// Emits a packet through this NIC, failing with [`NicError::BufferFull`] instead of waiting.
    pub fn write_outgoing(&self, packet: Bytes) -> Result<()> {
        self.outgoing.write(packet)
    }
}
