//! Generic error handler bound to root and switch ports.
//!
//! The handler reads the port's AER status. Errors in the configured "internal" class are not
//! interpreted here: they are published on the [`NotificationBus`] for whichever fabric layer
//! understands them. Everything else takes the standard path.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bdf::PciBdf;
use crate::config::PortHandlerConfig;
use crate::driver::{ChannelState, DriverBindings, ErrorHandlers, Verdict};
use crate::notify::{NotificationBus, PublishReport};
use crate::regs::{aer, RegisterAccess, DISCONNECTED_SENTINEL};
use crate::status::Severity;
use crate::topology::PortRole;

/// Which status group an interrupt was raised for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FaultClass {
    Correctable,
    Uncorrectable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortVerdict {
    /// Nothing unmasked was latched, or the device reads as disconnected.
    NoError,
    /// Internal error published on the notification bus.
    Internal {
        severity: Severity,
        status: u32,
        verdict: Verdict,
        report: PublishReport,
    },
    /// Standard error, left to the normal recovery path.
    Standard {
        severity: Severity,
        status: u32,
        verdict: Verdict,
    },
}

impl PortVerdict {
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::NoError => Verdict::CanRecover,
            Self::Internal { verdict, .. } | Self::Standard { verdict, .. } => *verdict,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            Self::NoError => None,
            Self::Internal { severity, .. } | Self::Standard { severity, .. } => Some(*severity),
        }
    }

    /// AER status bits this verdict was derived from.
    pub fn status(&self) -> u32 {
        match self {
            Self::NoError => 0,
            Self::Internal { status, .. } | Self::Standard { status, .. } => *status,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

pub struct PortErrorHandler {
    config: PortHandlerConfig,
    bus: Arc<NotificationBus>,
    bindings: Arc<DriverBindings>,
}

impl PortErrorHandler {
    pub fn new(
        config: PortHandlerConfig,
        bus: Arc<NotificationBus>,
        bindings: Arc<DriverBindings>,
    ) -> Self {
        Self {
            config,
            bus,
            bindings,
        }
    }

    pub fn config(&self) -> &PortHandlerConfig {
        &self.config
    }

    pub fn handle(
        &self,
        dev: PciBdf,
        role: PortRole,
        class: FaultClass,
        regs: &dyn RegisterAccess,
    ) -> PortVerdict {
        match class {
            FaultClass::Correctable => self.handle_correctable(dev, role, regs),
            FaultClass::Uncorrectable => self.handle_uncorrectable(dev, role, regs),
        }
    }

    /// Handles a correctable error signal.
    ///
    /// Whoever handles the error (bus subscribers or the bound driver) runs while the status
    /// is still latched; the reported bits are cleared only afterwards.
    pub fn handle_correctable(
        &self,
        dev: PciBdf,
        role: PortRole,
        regs: &dyn RegisterAccess,
    ) -> PortVerdict {
        let Some(status) = read_unmasked(regs, aer::COR_STATUS, aer::COR_MASK) else {
            return PortVerdict::NoError;
        };

        let internal =
            role.signals_internal_errors() && status & self.config.cor_internal_mask != 0;
        let verdict = if internal {
            let report = self.bus.publish(Severity::Correctable, dev);
            debug!(bdf = %dev, delivered = report.delivered, "correctable internal error published");
            PortVerdict::Internal {
                severity: Severity::Correctable,
                status,
                verdict: Verdict::CanRecover,
                report,
            }
        } else {
            if let Some(handlers) = self.bindings.get(dev) {
                handlers.cor_error_detected(dev);
            }
            PortVerdict::Standard {
                severity: Severity::Correctable,
                status,
                verdict: Verdict::CanRecover,
            }
        };

        regs.write_status(aer::COR_STATUS, status);
        debug!(bdf = %dev, status = format_args!("{status:#x}"), "cleared correctable status");
        verdict
    }

    /// Classifies an uncorrectable error signal.
    ///
    /// Status is left latched; [`PortErrorHandler::clear_uncorrectable`] is called once recovery
    /// has run.
    pub fn handle_uncorrectable(
        &self,
        dev: PciBdf,
        role: PortRole,
        regs: &dyn RegisterAccess,
    ) -> PortVerdict {
        let Some(status) = read_unmasked(regs, aer::UNCOR_STATUS, aer::UNCOR_MASK) else {
            return PortVerdict::NoError;
        };

        let severity = if status & regs.read_status(aer::UNCOR_SEVERITY) != 0 {
            Severity::Fatal
        } else {
            Severity::NonFatal
        };

        if role.signals_internal_errors() && status & self.config.uncor_internal_mask != 0 {
            let report = self.bus.publish(severity, dev);
            info!(bdf = %dev, ?severity, delivered = report.delivered, "internal error published");
            return PortVerdict::Internal {
                severity,
                status,
                verdict: Verdict::NeedReset,
                report,
            };
        }

        PortVerdict::Standard {
            severity,
            status,
            verdict: port_verdict(ChannelState::for_severity(severity)),
        }
    }

    pub fn clear_uncorrectable(&self, regs: &dyn RegisterAccess, status: u32) {
        if status != 0 {
            regs.write_status(aer::UNCOR_STATUS, status);
        }
    }
}

/// The generic port handler's part in recovery.
impl ErrorHandlers for PortErrorHandler {
    fn error_detected(&self, _dev: PciBdf, state: ChannelState) -> Verdict {
        port_verdict(state)
    }
}

fn port_verdict(state: ChannelState) -> Verdict {
    match state {
        ChannelState::Frozen | ChannelState::PermanentFailure => Verdict::NeedReset,
        ChannelState::Normal => Verdict::CanRecover,
    }
}

fn read_unmasked(regs: &dyn RegisterAccess, status_reg: u32, mask_reg: u32) -> Option<u32> {
    let raw = regs.read_status(status_reg);
    if raw == DISCONNECTED_SENTINEL {
        return None;
    }
    let status = raw & !regs.read_status(mask_reg);
    (status != 0).then_some(status)
}
