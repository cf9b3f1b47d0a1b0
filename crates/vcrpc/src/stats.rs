use std::sync::atomic::{AtomicU64, Ordering};

/// Connection traffic counters.
///
/// `Arc`-shared across connections and observer threads; all counters are
/// monotonic and never reset. Relaxed ordering throughout: these are
/// diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    stream_sends: AtomicU64,
    stream_recvs: AtomicU64,
    buffer_compacts: AtomicU64,
    incomplete_reads: AtomicU64,
    connections: AtomicU64,
    largest_packet_sent: AtomicU64,
    largest_packet_received: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, packet_bytes: u64) {
        self.bytes_sent.fetch_add(packet_bytes, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.largest_packet_sent
            .fetch_max(packet_bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, packet_bytes: u64) {
        self.bytes_received.fetch_add(packet_bytes, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.largest_packet_received
            .fetch_max(packet_bytes, Ordering::Relaxed);
    }

    pub(crate) fn inc_stream_sends(&self) {
        self.stream_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_stream_recvs(&self) {
        self.stream_recvs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_buffer_compacts(&self) {
        self.buffer_compacts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_incomplete_reads(&self) {
        self.incomplete_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Number of low-level stream send calls.
    pub fn stream_sends(&self) -> u64 {
        self.stream_sends.load(Ordering::Relaxed)
    }

    /// Number of low-level stream receive calls.
    pub fn stream_recvs(&self) -> u64 {
        self.stream_recvs.load(Ordering::Relaxed)
    }

    /// Number of send-buffer reallocations during packet marshaling.
    pub fn buffer_compacts(&self) -> u64 {
        self.buffer_compacts.load(Ordering::Relaxed)
    }

    /// Number of payload reads that returned fewer bytes than requested.
    pub fn incomplete_reads(&self) -> u64 {
        self.incomplete_reads.load(Ordering::Relaxed)
    }

    /// Number of connections established against these counters.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// High-water mark of outbound packet size, preamble included.
    pub fn largest_packet_sent(&self) -> u64 {
        self.largest_packet_sent.load(Ordering::Relaxed)
    }

    /// High-water mark of inbound packet size, preamble included.
    pub fn largest_packet_received(&self) -> u64 {
        self.largest_packet_received.load(Ordering::Relaxed)
    }
}
