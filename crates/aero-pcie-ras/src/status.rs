//! Read / classify / clear of the fabric RAS status registers.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;

use crate::bdf::PciBdf;
use crate::regs::{ras, RegisterBlock, DISCONNECTED_SENTINEL};
use crate::trace::TraceSink;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Correctable,
    NonFatal,
    Fatal,
}

impl Severity {
    pub const fn is_uncorrectable(self) -> bool {
        !matches!(self, Self::Correctable)
    }
}

bitflags! {
    /// Defined bits of the RAS correctable status register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CorrectableStatus: u32 {
        const CACHE_DATA_ECC = 1 << 0;
        const MEM_DATA_ECC = 1 << 1;
        const CRC_THRESHOLD = 1 << 2;
        const RETRY_THRESHOLD = 1 << 3;
        const CACHE_POISON = 1 << 4;
        const MEM_POISON = 1 << 5;
        const PHYSICAL_LAYER = 1 << 6;
    }
}

bitflags! {
    /// Defined bits of the RAS uncorrectable status register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct UncorrectableStatus: u32 {
        const CACHE_DATA_PARITY = 1 << 0;
        const CACHE_ADDR_PARITY = 1 << 1;
        const CACHE_BE_PARITY = 1 << 2;
        const CACHE_DATA_ECC = 1 << 3;
        const MEM_DATA_PARITY = 1 << 4;
        const MEM_ADDR_PARITY = 1 << 5;
        const MEM_BE_PARITY = 1 << 6;
        const MEM_DATA_ECC = 1 << 7;
        const REINIT_THRESHOLD = 1 << 8;
        const RSVD_ENCODING = 1 << 9;
        const POISON_RECEIVED = 1 << 10;
        const RECEIVER_OVERFLOW = 1 << 11;
        const INTERNAL = 1 << 14;
        const IDE_TX = 1 << 15;
        const IDE_RX = 1 << 16;
    }
}

/// Snapshot of the header log captured alongside an uncorrectable error.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderLog([u32; ras::HEADER_LOG_DWORDS]);

impl HeaderLog {
    pub fn new(dwords: [u32; ras::HEADER_LOG_DWORDS]) -> Self {
        Self(dwords)
    }

    pub fn dwords(&self) -> &[u32; ras::HEADER_LOG_DWORDS] {
        &self.0
    }
}

impl fmt::Debug for HeaderLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dw) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{dw:08x}")?;
        }
        Ok(())
    }
}

/// A classified RAS error. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    severity: Severity,
    source: PciBdf,
    status: u32,
    first_error: Option<u32>,
    header_log: Option<HeaderLog>,
}

impl ErrorEvent {
    pub(crate) fn correctable(source: PciBdf, status: u32) -> Self {
        Self {
            severity: Severity::Correctable,
            source,
            status,
            first_error: None,
            header_log: None,
        }
    }

    /// # Panics
    ///
    /// Panics if `severity` is [`Severity::Correctable`].
    pub(crate) fn uncorrectable(
        source: PciBdf,
        severity: Severity,
        status: u32,
        first_error: u32,
        header_log: HeaderLog,
    ) -> Self {
        assert!(severity.is_uncorrectable(), "uncorrectable event with correctable severity");
        Self {
            severity,
            source,
            status,
            first_error: Some(first_error),
            header_log: Some(header_log),
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn source(&self) -> PciBdf {
        self.source
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    /// Bit identifying the error the header log belongs to.
    pub fn first_error(&self) -> Option<u32> {
        self.first_error
    }

    pub fn header_log(&self) -> Option<&HeaderLog> {
        self.header_log.as_ref()
    }

    /// Names of the defined status bits that are set.
    pub fn status_names(&self) -> Vec<&'static str> {
        match self.severity {
            Severity::Correctable => CorrectableStatus::from_bits_truncate(self.status)
                .iter_names()
                .map(|(name, _)| name)
                .collect(),
            _ => UncorrectableStatus::from_bits_truncate(self.status)
                .iter_names()
                .map(|(name, _)| name)
                .collect(),
        }
    }
}

/// Outcome of an uncorrectable status pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncorrectableReport {
    pub event: Option<ErrorEvent>,
    /// Any captured uncorrectable status requires a reset at this layer.
    pub reset_required: bool,
}

impl UncorrectableReport {
    fn none() -> Self {
        Self {
            event: None,
            reset_required: false,
        }
    }
}

/// Classifies and clears RAS status for one register block at a time.
pub struct StatusEngine {
    sink: Arc<dyn TraceSink>,
    log_correctable: bool,
}

impl StatusEngine {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self {
            sink,
            log_correctable: true,
        }
    }

    /// Suppresses sink output for correctable events. Status is still cleared.
    pub fn with_correctable_logging(mut self, enabled: bool) -> Self {
        self.log_correctable = enabled;
        self
    }

    /// Handles correctable status.
    ///
    /// Only the defined bits are cleared; reserved bits are left for whoever owns them.
    pub fn handle_correctable(&self, regs: &RegisterBlock, source: PciBdf) -> Option<ErrorEvent> {
        let raw = regs.read(ras::COR_STATUS);
        if raw == DISCONNECTED_SENTINEL {
            debug!(bdf = %source, "correctable status reads all-ones; device gone");
            return None;
        }

        let status = raw & CorrectableStatus::all().bits();
        if status == 0 {
            return None;
        }

        regs.write(ras::COR_STATUS, status);

        let event = ErrorEvent::correctable(source, status);
        if self.log_correctable {
            self.sink.record(&event);
        }
        Some(event)
    }

    /// Handles uncorrectable status.
    ///
    /// The header log is only valid while the status bits are set, so it is captured and the
    /// event recorded before the status is cleared.
    pub fn handle_uncorrectable(&self, regs: &RegisterBlock, source: PciBdf) -> UncorrectableReport {
        let raw = regs.read(ras::UNCOR_STATUS);
        if raw == DISCONNECTED_SENTINEL {
            debug!(bdf = %source, "uncorrectable status reads all-ones; device gone");
            return UncorrectableReport::none();
        }

        let status = raw & UncorrectableStatus::all().bits();
        if status == 0 {
            return UncorrectableReport::none();
        }

        let first_error = if status.count_ones() > 1 {
            let ptr = regs.read(ras::CAP_CONTROL) & ras::CAP_CONTROL_FE_MASK;
            1u32.checked_shl(ptr).unwrap_or(status)
        } else {
            status
        };

        let header_log = HeaderLog::new(regs.read_dwords(ras::HEADER_LOG));

        let severity = if status & regs.read(ras::UNCOR_SEVERITY) != 0 {
            Severity::Fatal
        } else {
            Severity::NonFatal
        };

        let event = ErrorEvent::uncorrectable(source, severity, status, first_error, header_log);
        self.sink.record(&event);

        regs.write(ras::UNCOR_STATUS, status);

        UncorrectableReport {
            event: Some(event),
            reset_required: true,
        }
    }
}
