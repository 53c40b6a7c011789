//! Top-level RAS subsystem: the entry point that wires topology, notification and recovery.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::bdf::PciBdf;
use crate::config::RasConfig;
use crate::driver::{ChannelState, DriverBindings};
use crate::error::{RasError, Result};
use crate::fabric::{FabricRasHandler, ProbedPorts};
use crate::notify::{NotificationBus, SubscriptionToken};
use crate::port::{FaultClass, PortErrorHandler, PortVerdict};
use crate::recovery::{LinkReset, RecoveryOrchestrator, RecoveryOutcome};
use crate::regs::RegisterAccess;
use crate::status::StatusEngine;
use crate::topology::{RegisterMapper, TopologyRegistry};
use crate::trace::TraceSink;

/// Result of [`RasSubsystem::handle_fault`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaultOutcome {
    pub port: PortVerdict,
    /// Set when the fault was uncorrectable and recovery ran (or was coalesced).
    pub recovery: Option<RecoveryOutcome>,
}

/// Owns every component of the error pipeline and wires them together.
///
/// A platform creates one subsystem, registers its ports through [`RasSubsystem::registry`],
/// binds drivers through [`RasSubsystem::bindings`] and then feeds dispatched error interrupts
/// into [`RasSubsystem::handle_fault`].
pub struct RasSubsystem {
    config: RasConfig,
    bus: Arc<NotificationBus>,
    registry: Arc<TopologyRegistry>,
    bindings: Arc<DriverBindings>,
    port_handler: Arc<PortErrorHandler>,
    orchestrator: RecoveryOrchestrator,
    fabric: Arc<FabricRasHandler>,
    fabric_token: Mutex<Option<SubscriptionToken>>,
}

impl RasSubsystem {
    pub fn new(
        config: RasConfig,
        mapper: Box<dyn RegisterMapper>,
        reset: Box<dyn LinkReset>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        let bus = Arc::new(NotificationBus::new());
        let registry = Arc::new(TopologyRegistry::new(mapper));
        let bindings = Arc::new(DriverBindings::new());
        let port_handler = Arc::new(PortErrorHandler::new(
            config.port,
            bus.clone(),
            bindings.clone(),
        ));
        let orchestrator = RecoveryOrchestrator::new(
            registry.clone(),
            bindings.clone(),
            port_handler.clone(),
            reset,
        );
        let engine = StatusEngine::new(sink).with_correctable_logging(config.log_correctable);
        let fabric = Arc::new(FabricRasHandler::new(registry.clone(), engine));

        Self {
            config,
            bus,
            registry,
            bindings,
            port_handler,
            orchestrator,
            fabric,
            fabric_token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RasConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    pub fn bindings(&self) -> &Arc<DriverBindings> {
        &self.bindings
    }

    pub fn orchestrator(&self) -> &RecoveryOrchestrator {
        &self.orchestrator
    }

    /// Subscribes the fabric RAS handler to internal-error notifications.
    ///
    /// Attaching twice keeps the first subscription.
    pub fn attach_fabric_handler(&self) -> SubscriptionToken {
        let mut token = self.fabric_token.lock().unwrap();
        *token.get_or_insert_with(|| {
            info!("fabric RAS handler attached");
            self.fabric.attach(&self.bus)
        })
    }

    /// Returns `false` if the fabric handler was not attached.
    pub fn detach_fabric_handler(&self) -> bool {
        match self.fabric_token.lock().unwrap().take() {
            Some(token) => self.bus.unsubscribe(token),
            None => false,
        }
    }

    /// Maps the fabric RAS registers of the ports above a newly probed endpoint.
    pub fn probe_endpoint(&self, endpoint: PciBdf) -> Result<ProbedPorts> {
        self.fabric.probe_endpoint(endpoint)
    }

    /// Entry point for an error interrupt dispatched to `port`.
    ///
    /// `regs` is the port's AER status group. Correctable faults are handled and cleared
    /// immediately. Uncorrectable faults run recovery on the port's root; the port's
    /// uncorrectable status is cleared once recovery has returned.
    pub fn handle_fault(
        &self,
        port: PciBdf,
        class: FaultClass,
        regs: &dyn RegisterAccess,
    ) -> Result<FaultOutcome> {
        let record = self
            .registry
            .get(port)
            .ok_or(RasError::UnknownPort { bdf: port })?;

        let verdict = self.port_handler.handle(port, record.role(), class, regs);
        if let PortVerdict::Standard { severity, .. } = verdict {
            record.counters().record(severity);
        }

        let severity = match verdict.severity() {
            Some(severity) if severity.is_uncorrectable() => severity,
            _ => {
                debug!(bdf = %port, ?class, ?verdict, "fault handled without recovery");
                return Ok(FaultOutcome {
                    port: verdict,
                    recovery: None,
                });
            }
        };

        let recovery = self.orchestrator.recover(
            port,
            ChannelState::for_severity(severity),
            verdict.verdict(),
        );
        self.port_handler.clear_uncorrectable(regs, verdict.status());

        Ok(FaultOutcome {
            port: verdict,
            recovery: Some(recovery?),
        })
    }
}
