//! Per-port error counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::Severity;

/// Running error totals for one port.
///
/// Counters are bumped from error-reporting contexts, so they are plain atomics and never block.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    correctable: AtomicU64,
    nonfatal: AtomicU64,
    fatal: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCountersSnapshot {
    pub correctable: u64,
    pub nonfatal: u64,
    pub fatal: u64,
}

impl ErrorCountersSnapshot {
    pub fn total(&self) -> u64 {
        self.correctable + self.nonfatal + self.fatal
    }
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, severity: Severity) {
        let counter = match severity {
            Severity::Correctable => &self.correctable,
            Severity::NonFatal => &self.nonfatal,
            Severity::Fatal => &self.fatal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ErrorCountersSnapshot {
        ErrorCountersSnapshot {
            correctable: self.correctable.load(Ordering::Relaxed),
            nonfatal: self.nonfatal.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
        }
    }
}
