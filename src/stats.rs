//! Counters for every fault the recorder absorbs instead of propagating.
//!
//! The counters are shared between the logging task, the producers and the config store, so
//! they are plain relaxed atomics. Use [`RecorderStats::snapshot`] to read a consistent-enough
//! copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct RecorderStats {
    pub samples_logged: AtomicU64,
    pub records_written: AtomicU64,
    pub pages_flushed: AtomicU64,
    pub dropped_samples: AtomicU64,
    pub invalid_samples: AtomicU64,
    pub overruns: AtomicU64,
    pub flush_retries: AtomicU64,
    pub failed_flushes: AtomicU64,
    pub checkpoints: AtomicU64,
    pub checkpoint_failures: AtomicU64,
    pub config_ambiguities: AtomicU64,
    pub corrupt_config_slots: AtomicU64,
    pub decode_errors: AtomicU64,
    pub checksum_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub samples_logged: u64,
    pub records_written: u64,
    pub pages_flushed: u64,
    pub dropped_samples: u64,
    pub invalid_samples: u64,
    pub overruns: u64,
    pub flush_retries: u64,
    pub failed_flushes: u64,
    pub checkpoints: u64,
    pub checkpoint_failures: u64,
    pub config_ambiguities: u64,
    pub corrupt_config_slots: u64,
    pub decode_errors: u64,
    pub checksum_failures: u64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RecorderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            samples_logged: get(&self.samples_logged),
            records_written: get(&self.records_written),
            pages_flushed: get(&self.pages_flushed),
            dropped_samples: get(&self.dropped_samples),
            invalid_samples: get(&self.invalid_samples),
            overruns: get(&self.overruns),
            flush_retries: get(&self.flush_retries),
            failed_flushes: get(&self.failed_flushes),
            checkpoints: get(&self.checkpoints),
            checkpoint_failures: get(&self.checkpoint_failures),
            config_ambiguities: get(&self.config_ambiguities),
            corrupt_config_slots: get(&self.corrupt_config_slots),
            decode_errors: get(&self.decode_errors),
            checksum_failures: get(&self.checksum_failures),
        }
    }
}

impl StatsSnapshot {
    /// Total number of faults that were absorbed rather than returned
    pub fn absorbed_faults(&self) -> u64 {
        self.dropped_samples
            + self.invalid_samples
            + self.overruns
            + self.flush_retries
            + self.failed_flushes
            + self.checkpoint_failures
            + self.config_ambiguities
            + self.corrupt_config_slots
            + self.decode_errors
            + self.checksum_failures
    }
}
