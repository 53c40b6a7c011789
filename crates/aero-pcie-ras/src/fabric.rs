//! Fabric RAS handling layered on top of the port error handler.
//!
//! Ports of the fabric repurpose their AER internal-error bits to signal that the fabric's own
//! RAS capability has latched something. [`FabricRasHandler`] subscribes to the notification
//! bus, finds the port's mapped RAS registers and runs the status engine over them.

use std::sync::Arc;

use tracing::debug;

use crate::bdf::PciBdf;
use crate::driver::Verdict;
use crate::error::{RasError, Result};
use crate::notify::{NotificationBus, SubscriptionToken};
use crate::status::{Severity, StatusEngine};
use crate::topology::{PortHandle, PortQuery, TopologyRegistry};

/// Ports whose RAS registers were mapped on behalf of a probed endpoint.
#[derive(Debug, Clone)]
pub struct ProbedPorts {
    pub root_port: PortHandle,
    /// Nearest port above the endpoint; the root port itself for directly attached endpoints.
    pub nearest: PortHandle,
}

pub struct FabricRasHandler {
    registry: Arc<TopologyRegistry>,
    engine: StatusEngine,
}

impl FabricRasHandler {
    pub fn new(registry: Arc<TopologyRegistry>, engine: StatusEngine) -> Self {
        Self { registry, engine }
    }

    /// Maps the RAS registers of the ports above `endpoint`.
    ///
    /// Endpoints below the same switch share their ancestors; ports that are already mapped are
    /// left alone.
    pub fn probe_endpoint(&self, endpoint: PciBdf) -> Result<ProbedPorts> {
        let root_port = self
            .registry
            .find_port(endpoint, PortQuery::RootPort)
            .ok_or(RasError::UnknownPort { bdf: endpoint })?;
        let nearest = self
            .registry
            .find_port(endpoint, PortQuery::NearestPort)
            .ok_or(RasError::UnknownPort { bdf: endpoint })?;

        self.registry.map_registers(&root_port)?;
        self.registry.map_registers(&nearest)?;

        Ok(ProbedPorts { root_port, nearest })
    }

    /// Handles an internal-error notification for `source`.
    ///
    /// Returns [`Verdict::NeedReset`] when uncorrectable RAS status was found.
    pub fn handle(&self, severity: Severity, source: PciBdf) -> Verdict {
        let Some(port) = self.registry.find_port(source, PortQuery::NearestPort) else {
            debug!(bdf = %source, "internal error from a port outside the fabric");
            return Verdict::CanRecover;
        };
        if let Err(err) = self.registry.map_registers(&port) {
            debug!(bdf = %source, %err, "no fabric RAS registers");
            return Verdict::CanRecover;
        }
        let Some(regs) = port.registers() else {
            return Verdict::CanRecover;
        };

        match severity {
            Severity::Correctable => {
                if let Some(event) = self.engine.handle_correctable(regs, port.bdf()) {
                    port.counters().record(event.severity());
                }
                Verdict::CanRecover
            }
            Severity::NonFatal | Severity::Fatal => {
                let report = self.engine.handle_uncorrectable(regs, port.bdf());
                if let Some(event) = &report.event {
                    port.counters().record(event.severity());
                }
                if report.reset_required {
                    Verdict::NeedReset
                } else {
                    Verdict::CanRecover
                }
            }
        }
    }

    /// Subscribes this handler to `bus`.
    pub fn attach(self: &Arc<Self>, bus: &NotificationBus) -> SubscriptionToken {
        let this = Arc::clone(self);
        bus.subscribe(move |severity, source| this.handle(severity, source))
    }
}
