use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use inoflow_common::{RecordFs, StatsSnapshot, RING_RECORDS};

/// Byte budget of the hand-off buffer between producers and the consumer.
pub const RING_BYTES: usize = mem::size_of::<RecordFs>() * RING_RECORDS;

fn aligned_record_size() -> usize {
    (mem::size_of::<RecordFs>() + 7) & !7
}

/// Process-scoped counters, allocated once at startup and injected into the
/// state machine and consumer. Monotonic except for the capacity gauge;
/// never reset during a run.
#[derive(Default)]
pub struct Stats {
    opened: AtomicU64,
    closed: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    events: AtomicU64,
    channel_capacity: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            channel_capacity: self.channel_capacity.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the bounded multi-producer/single-consumer hand-off.
/// Submission moves one whole record and never blocks.
pub struct EmissionChannel {
    tx: Sender<RecordFs>,
    capacity: u64,
}

/// Build the channel; its record capacity is the byte budget over the
/// 8-byte-aligned record size.
pub fn emission_channel() -> (EmissionChannel, Receiver<RecordFs>) {
    let capacity = RING_BYTES / aligned_record_size();
    let (tx, rx) = bounded(capacity);
    (EmissionChannel { tx, capacity: capacity as u64 }, rx)
}

impl EmissionChannel {
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Hand a closed record to the consumer. A full (or torn-down) channel
    /// counts a drop and reports false; the record is gone either way and
    /// is never retried. The first successful hand-off latches the derived
    /// record capacity into the statistics for operators sizing the
    /// buffer.
    pub fn submit(&self, record: RecordFs, stats: &Stats) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => {
                if stats.closed.fetch_add(1, Ordering::Relaxed) == 0 {
                    stats.channel_capacity.store(self.capacity, Ordering::Relaxed);
                }
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
