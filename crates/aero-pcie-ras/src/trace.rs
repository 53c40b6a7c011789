//! Error record sinks.
//!
//! Every event that the status engine classifies is handed to a [`TraceSink`]. Sinks are
//! fire-and-forget: they must not block and cannot fail the pipeline.

use std::sync::Mutex;

use tracing::{error, warn};

use crate::bdf::PciBdf;
use crate::status::{ErrorEvent, HeaderLog, Severity};

/// Flattened copy of an [`ErrorEvent`] as persisted by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub source: PciBdf,
    pub severity: Severity,
    pub status: u32,
    pub first_error: Option<u32>,
    pub header_log: Option<HeaderLog>,
}

impl From<&ErrorEvent> for TraceRecord {
    fn from(event: &ErrorEvent) -> Self {
        Self {
            source: event.source(),
            severity: event.severity(),
            status: event.status(),
            first_error: event.first_error(),
            header_log: event.header_log().cloned(),
        }
    }
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: &ErrorEvent);
}

/// Emits every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&self, event: &ErrorEvent) {
        let names = event.status_names().join("|");
        match event.severity() {
            Severity::Correctable => warn!(
                bdf = %event.source(),
                status = format_args!("{:#010x}", event.status()),
                errors = %names,
                "correctable RAS error"
            ),
            severity => error!(
                bdf = %event.source(),
                ?severity,
                status = format_args!("{:#010x}", event.status()),
                first_error = format_args!("{:#010x}", event.first_error().unwrap_or(0)),
                errors = %names,
                header_log = ?event.header_log(),
                "uncorrectable RAS error"
            ),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for RecordingSink {
    fn record(&self, event: &ErrorEvent) {
        self.records.lock().unwrap().push(TraceRecord::from(event));
    }
}
