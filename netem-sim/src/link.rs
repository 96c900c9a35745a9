//! Links join two NICs and move packets between them, through a [`DpiEngine`] and an optional
//! bandwidth/latency/loss model.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use netem_common::{sleep_until_or_cancelled, transmission_time};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    dpi::{Direction, DpiEngine},
    nic::Nic,
};

/// A running (or ready to run) connection between two NICs.
pub trait Link: Send + Sync + fmt::Debug {
    /// Starts forwarding packets in both directions. Forwarding stops once `cancel` fires.
    fn up(&self, cancel: CancellationToken);
}

/// Builds a [`Link`] between a left and a right NIC, inspected by the given engine.
///
/// This is the seam test harnesses use to swap emulation models without touching the backbone.
pub type LinkFactory =
    Arc<dyn Fn(Arc<Nic>, Arc<Nic>, Arc<dyn DpiEngine>) -> Box<dyn Link> + Send + Sync>;

/// Returns a factory for links that forward packets as fast as possible.
pub fn fast_link_factory() -> LinkFactory {
    LinkImpairment::default().factory()
}

/// Impairments applied by an [`EmulatedLink`], independently in each direction.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use netem_sim::LinkImpairment;
///
/// // A lossy 1 MB/s link with 50ms of one-way delay.
/// let factory = LinkImpairment {
///     latency: Duration::from_millis(50),
///     bandwidth_bytes_per_sec: Some(1_000_000),
///     loss: 1.0,
///     ..Default::default()
/// }
/// .factory();
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkImpairment {
    /// One-way propagation delay added to every packet.
    pub latency: Duration,
    /// Transmission rate. `None` means unlimited.
    pub bandwidth_bytes_per_sec: Option<u64>,
    /// Packet loss percentage (0.0 to 100.0).
    pub loss: f64,
    /// Maximum number of packets in flight on the link, per direction. Packets beyond this are
    /// dropped.
    pub queue_capacity: usize,
}

impl Default for LinkImpairment {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            bandwidth_bytes_per_sec: None,
            loss: 0.0,
            queue_capacity: Nic::DEFAULT_CAPACITY,
        }
    }
}

impl LinkImpairment {
    /// Returns `true` if packets need to be scheduled rather than forwarded right away.
    pub fn is_delayed(&self) -> bool {
        !self.latency.is_zero() || self.bandwidth_bytes_per_sec.is_some()
    }

    /// Returns a [`LinkFactory`] producing [`EmulatedLink`]s with these impairments.
    pub fn factory(self) -> LinkFactory {
        Arc::new(move |left, right, dpi| Box::new(EmulatedLink::new(left, right, dpi, self)))
    }

    fn should_drop(&self) -> bool {
        self.loss > 0.0 && rand::random::<f64>() * 100.0 < self.loss
    }
}

/// Counters shared by the forwarding tasks of a link.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Packets handed to the destination NIC.
    forwarded: AtomicUsize,
    /// Packets the DPI engine suppressed.
    diverted: AtomicUsize,
    /// Packets lost to emulated loss or full queues.
    dropped: AtomicUsize,
}

impl LinkStats {
    #[inline]
    fn increment_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_diverted(&self) {
        self.diverted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn diverted(&self) -> usize {
        self.diverted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The default [`Link`] implementation.
///
/// Each direction gets its own forwarding task. For every packet read off the source NIC's
/// outgoing queue, the task asks the DPI engine whether to divert it, lets the engine delay it,
/// and then delivers it to the destination NIC's incoming queue, possibly after the emulated
/// transmission and propagation delay.
pub struct EmulatedLink {
    left: Arc<Nic>,
    right: Arc<Nic>,
    dpi: Arc<dyn DpiEngine>,
    impairment: LinkImpairment,
    stats: Arc<LinkStats>,
}

impl fmt::Debug for EmulatedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedLink")
            .field("left", &self.left.name())
            .field("right", &self.right.name())
            .field("dpi", &self.dpi)
            .field("impairment", &self.impairment)
            .finish()
    }
}

impl EmulatedLink {
    pub fn new(
        left: Arc<Nic>,
        right: Arc<Nic>,
        dpi: Arc<dyn DpiEngine>,
        impairment: LinkImpairment,
    ) -> Self {
        Self { left, right, dpi, impairment, stats: Arc::default() }
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }
}

impl Link for EmulatedLink {
    fn up(&self, cancel: CancellationToken) {
        let directions = [
            (Direction::LeftToRight, &self.left, &self.right),
            (Direction::RightToLeft, &self.right, &self.left),
        ];

        for (direction, source, destination) in directions {
            let span = tracing::debug_span!(
                "link",
                %direction,
                source = source.name(),
                destination = destination.name()
            );

            let forwarder = Forwarder {
                direction,
                source: Arc::clone(source),
                destination: Arc::clone(destination),
                dpi: Arc::clone(&self.dpi),
                impairment: self.impairment,
                stats: Arc::clone(&self.stats),
            };

            tokio::spawn(forwarder.run(cancel.clone()).instrument(span));
        }
    }
}

/// Hands `packet` to the destination NIC, dropping it if the NIC is full.
fn deliver(destination: &Nic, packet: Bytes, stats: &LinkStats) {
    match destination.write_incoming(packet) {
        Ok(()) => stats.increment_forwarded(),
        Err(e) => {
            stats.increment_dropped();
            tracing::debug!(?e, nic = destination.name(), "dropping packet");
        }
    }
}

struct Forwarder {
    direction: Direction,
    source: Arc<Nic>,
    destination: Arc<Nic>,
    dpi: Arc<dyn DpiEngine>,
    impairment: LinkImpairment,
    stats: Arc<LinkStats>,
}

impl Forwarder {
    async fn run(self, cancel: CancellationToken) {
        let mut pipe = Pipe::new(&self, &cancel);

        loop {
            let packet = match self.source.read_outgoing(&cancel).await {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(?e, "forwarding stopped");
                    break;
                }
            };

            if self.dpi.divert(self.direction, &self.source, &self.destination, &packet) {
                self.stats.increment_diverted();
                tracing::trace!(size = packet.len(), "packet diverted");
                continue;
            }

            self.dpi.delay(&cancel, self.direction, &packet).await;
            if cancel.is_cancelled() {
                break;
            }

            if self.impairment.should_drop() {
                self.stats.increment_dropped();
                tracing::trace!(size = packet.len(), "packet lost");
                continue;
            }

            pipe.push(packet);
        }
    }
}

/// The path a packet takes after it has cleared DPI.
enum Pipe {
    /// Straight into the destination NIC.
    Direct { destination: Arc<Nic>, stats: Arc<LinkStats> },
    /// Scheduled for delivery by a dedicated task, which preserves FIFO order.
    Scheduled {
        latency: Duration,
        bandwidth: Option<u64>,
        /// When the emulated transmitter finishes sending what is already queued.
        next_free: Instant,
        tx: mpsc::Sender<(Instant, Bytes)>,
        stats: Arc<LinkStats>,
    },
}

impl Pipe {
    fn new(forwarder: &Forwarder, cancel: &CancellationToken) -> Self {
        let impairment = forwarder.impairment;
        let stats = Arc::clone(&forwarder.stats);

        if !impairment.is_delayed() {
            return Self::Direct { destination: Arc::clone(&forwarder.destination), stats };
        }

        let (tx, rx) = mpsc::channel(impairment.queue_capacity.max(1));
        let destination = Arc::clone(&forwarder.destination);
        let delivery = run_delivery(rx, destination, Arc::clone(&stats), cancel.clone());
        tokio::spawn(delivery.in_current_span());

        Self::Scheduled {
            latency: impairment.latency,
            bandwidth: impairment.bandwidth_bytes_per_sec,
            next_free: Instant::now(),
            tx,
            stats,
        }
    }

    fn push(&mut self, packet: Bytes) {
        match self {
            Self::Direct { destination, stats } => deliver(destination, packet, stats),
            Self::Scheduled { latency, bandwidth, next_free, tx, stats } => {
                let now = Instant::now();
                let start = (*next_free).max(now);
                let transmission =
                    bandwidth.map_or(Duration::ZERO, |bw| transmission_time(packet.len(), bw));
                let sent = start + transmission;
                let deliver_at = sent + *latency;

                match tx.try_send((deliver_at, packet)) {
                    Ok(()) => *next_free = sent,
                    Err(e) => {
                        stats.increment_dropped();
                        tracing::debug!(?e, "link queue full, dropping packet");
                    }
                }
            }
        }
    }
}

async fn run_delivery(
    mut rx: mpsc::Receiver<(Instant, Bytes)>,
    destination: Arc<Nic>,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };

        let Some((deliver_at, packet)) = next else { break };
        if !sleep_until_or_cancelled(&cancel, deliver_at).await {
            break;
        }

        deliver(&destination, packet, &stats);
    }
}
