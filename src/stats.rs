//! Error and traffic counters.
//!
//! All errors in the bridge are handled locally, so these counters are the only place where they
//! surface, apart from the log.

use portable_atomic::{AtomicU32, Ordering};

/// A wrapping event counter.
#[derive(Default)]
pub struct Counter(AtomicU32);
impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add(&self, value: u32) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Counters of the path towards the host.
pub struct TxStats {
    /// No idle node was available.
    pub enqueue_failed: u32,
    /// The bus was busy, when a drain was attempted.
    pub bus_busy: u32,
    /// Writing a frame to the bus failed, so it was dropped.
    pub send_failed: u32,
    /// Frames successfully written to the bus.
    pub sent: u32,
    /// Network frames for the host, that couldn't be queued.
    pub data_dropped: u32,
    /// Events for the host, that couldn't be queued.
    pub event_dropped: u32,
    /// Command responses, that couldn't be queued.
    pub response_dropped: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Counters of the path from the host.
pub struct RxStats {
    /// The bus reported a frame of length zero.
    pub zero_length: u32,
    /// Reading the frame payload failed.
    pub read_failed: u32,
    /// Re-arming the header read failed.
    pub header_failed: u32,
    /// The frame was too short or had an invalid data offset.
    pub malformed: u32,
    pub sequence_gaps: u32,
    pub received: u32,
    /// No receive buffer could be reserved.
    pub buffer_exhausted: u32,
    /// Frames on channels, which we don't handle.
    pub unhandled_channel: u32,
    /// The control message queue was full.
    pub command_dropped: u32,
    /// Control messages with a bad header.
    pub command_rejected: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Counters of the traffic arbiter.
pub struct ArbiterStats {
    /// The session table was full, so a flow wasn't tracked.
    pub sessions_full: u32,
    /// Frames, that couldn't be parsed.
    pub malformed: u32,
    /// Frames from the local stack, that aren't tracked.
    pub unsupported: u32,
    /// Stale sessions and ARP requests, that were evicted.
    pub evicted: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BridgeStats {
    pub tx: TxStats,
    pub rx: RxStats,
    pub arbiter: ArbiterStats,
}
