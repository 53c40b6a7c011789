mod common;

use std::sync::{Arc, Mutex};

use aero_pcie_ras::regs::{aer, ras};
use aero_pcie_ras::{
    ChannelState, ErrorHandlers, FaultClass, NotificationBus, PciBdf, PortHandlerConfig,
    PortQuery, PortVerdict, PublishReport, RasConfig, RecoveryState, RegisterAccess,
    RegisterBlock, Severity, StatusEngine, Verdict,
};

use common::{SimFabric, DSP, EP_A, EP_B, RP, SWITCH, USP};

/// Driver stub returning a fixed detection verdict and logging the callbacks it receives.
struct ScriptedDriver {
    detected: Verdict,
    calls: Arc<Mutex<Vec<(PciBdf, &'static str)>>>,
}

impl ErrorHandlers for ScriptedDriver {
    fn error_detected(&self, dev: PciBdf, _state: ChannelState) -> Verdict {
        self.calls.lock().unwrap().push((dev, "error_detected"));
        self.detected
    }

    fn mmio_enabled(&self, dev: PciBdf) -> Verdict {
        self.calls.lock().unwrap().push((dev, "mmio_enabled"));
        Verdict::CanRecover
    }

    fn slot_reset(&self, dev: PciBdf) -> Verdict {
        self.calls.lock().unwrap().push((dev, "slot_reset"));
        Verdict::CanRecover
    }

    fn resume(&self, dev: PciBdf) {
        self.calls.lock().unwrap().push((dev, "resume"));
    }
}

/// Driver that samples its correctable status from inside the callback.
struct StatusSampler {
    regs: Arc<aero_pcie_ras::MmioRegisters>,
    seen: Mutex<Vec<u32>>,
}

impl ErrorHandlers for StatusSampler {
    fn error_detected(&self, _dev: PciBdf, _state: ChannelState) -> Verdict {
        Verdict::CanRecover
    }

    fn cor_error_detected(&self, _dev: PciBdf) {
        let status = self.regs.read_status(aer::COR_STATUS);
        self.seen.lock().unwrap().push(status);
    }
}

/// Port configuration where the fabric claims the low status bits as its internal-error class.
fn fabric_internal_config() -> RasConfig {
    RasConfig {
        port: PortHandlerConfig {
            cor_internal_mask: 0x1,
            uncor_internal_mask: 0x4000,
        },
        ..RasConfig::default()
    }
}

#[test]
fn mapping_twice_yields_one_register_block() {
    let fabric = SimFabric::new();
    let registry = fabric.registry();
    let dsp = registry.get(DSP).unwrap();

    registry.map_registers(&dsp).unwrap();
    let first: *const RegisterBlock = dsp.registers().unwrap();
    registry.map_registers(&dsp).unwrap();

    assert_eq!(fabric.map_calls(), 1);
    assert!(std::ptr::eq(first, dsp.registers().unwrap()));
}

#[test]
fn sibling_endpoints_share_their_ancestor_block() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());

    let a = subsystem.probe_endpoint(EP_A).unwrap();
    let b = subsystem.probe_endpoint(EP_B).unwrap();

    assert!(Arc::ptr_eq(&a.nearest, &b.nearest));
    assert!(Arc::ptr_eq(&a.root_port, &b.root_port));
    assert_eq!(a.nearest.bdf(), DSP);
    assert!(std::ptr::eq(
        a.nearest.registers().unwrap(),
        b.nearest.registers().unwrap()
    ));
    // Root port and downstream port, each once.
    assert_eq!(fabric.map_calls(), 2);
}

#[test]
fn upward_queries_resolve_expected_ports() {
    let fabric = SimFabric::new();
    let registry = fabric.registry();

    let root = registry.find_port(EP_B, PortQuery::RootPort).unwrap();
    assert_eq!(root.bdf(), RP);
    let usp = registry
        .find_port(EP_B, PortQuery::UpstreamPortOwnedBy(SWITCH))
        .unwrap();
    assert_eq!(usp.bdf(), USP);
    assert!(registry
        .find_port(EP_B, PortQuery::UpstreamPortOwnedBy(PciBdf::new(9, 0, 0)))
        .is_none());
    assert!(registry.find_port(PciBdf::new(9, 0, 0), PortQuery::RootPort).is_none());
}

#[test]
fn driver_sees_correctable_status_before_it_is_cleared() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());
    let sampler = Arc::new(StatusSampler {
        regs: fabric.aer(EP_A).clone(),
        seen: Mutex::new(Vec::new()),
    });
    subsystem.bindings().bind(EP_A, sampler.clone());

    // Receiver error and bad TLP.
    let status = (1 << 0) | (1 << 6);
    fabric.aer(EP_A).latch(aer::COR_STATUS, status);

    let outcome = subsystem
        .handle_fault(EP_A, FaultClass::Correctable, &**fabric.aer(EP_A))
        .unwrap();

    assert_eq!(*sampler.seen.lock().unwrap(), vec![status]);
    assert_eq!(fabric.aer(EP_A).read_status(aer::COR_STATUS), 0);
    assert!(outcome.recovery.is_none());
    assert_eq!(
        subsystem.registry().get(EP_A).unwrap().counters().snapshot().correctable,
        1
    );
}

#[test]
fn only_reported_correctable_bits_are_cleared() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());
    let regs = fabric.aer(EP_B);
    regs.latch(aer::COR_STATUS, 0b11);
    // Bit 1 is masked, so it is neither reported nor cleared.
    regs.poke(aer::COR_MASK, 0b10);

    let outcome = subsystem
        .handle_fault(EP_B, FaultClass::Correctable, &**regs)
        .unwrap();

    assert_eq!(outcome.port.status(), 0b01);
    assert_eq!(regs.read_status(aer::COR_STATUS), 0b10);
}

#[test]
fn all_ones_status_produces_no_event_and_no_write() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());
    subsystem.attach_fabric_handler();

    let aer_regs = fabric.aer(RP);
    aer_regs.poke(aer::UNCOR_STATUS, 0xffff_ffff);
    let outcome = subsystem
        .handle_fault(RP, FaultClass::Uncorrectable, &**aer_regs)
        .unwrap();
    assert_eq!(outcome.port, PortVerdict::NoError);
    assert!(outcome.recovery.is_none());
    assert_eq!(aer_regs.write_count(), 0);

    let ras_regs = fabric.ras(DSP);
    ras_regs.poke(ras::COR_STATUS, 0xffff_ffff);
    ras_regs.poke(ras::UNCOR_STATUS, 0xffff_ffff);
    let block = RegisterBlock::new(0, Box::new(ras_regs.clone()));
    let engine = StatusEngine::new(fabric.sink.clone());
    assert!(engine.handle_correctable(&block, DSP).is_none());
    assert!(engine.handle_uncorrectable(&block, DSP).event.is_none());
    assert_eq!(ras_regs.write_count(), 0);
    assert!(fabric.sink.is_empty());
}

#[test]
fn one_reset_request_drives_full_recovery() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());
    let calls = Arc::new(Mutex::new(Vec::new()));
    for (dev, detected) in [
        (USP, Verdict::CanRecover),
        (EP_A, Verdict::NeedReset),
        (EP_B, Verdict::CanRecover),
    ] {
        subsystem.bindings().bind(
            dev,
            Arc::new(ScriptedDriver {
                detected,
                calls: calls.clone(),
            }),
        );
    }

    let outcome = subsystem
        .orchestrator()
        .recover(EP_A, ChannelState::Normal, Verdict::CanRecover)
        .unwrap();
    let report = outcome.report().unwrap();

    assert_eq!(
        report.path,
        vec![
            RecoveryState::Detecting,
            RecoveryState::ResetRequired,
            RecoveryState::SlotReset,
            RecoveryState::MmioReenable,
            RecoveryState::Resuming,
            RecoveryState::Done,
        ]
    );
    assert_eq!(report.verdict, Verdict::NeedReset);
    assert_eq!(report.visited, 5);
    assert_eq!(fabric.resets(), 1);

    // Every stage reaches every bound driver before the next stage starts.
    let stages: Vec<_> = calls.lock().unwrap().iter().map(|(_, stage)| *stage).collect();
    assert_eq!(
        stages,
        [
            ["error_detected"; 3],
            ["slot_reset"; 3],
            ["mmio_enabled"; 3],
            ["resume"; 3]
        ]
        .concat()
    );
}

#[test]
fn recoverable_subtree_is_not_reset() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());
    let calls = Arc::new(Mutex::new(Vec::new()));
    for dev in [EP_A, EP_B] {
        subsystem.bindings().bind(
            dev,
            Arc::new(ScriptedDriver {
                detected: Verdict::CanRecover,
                calls: calls.clone(),
            }),
        );
    }

    let outcome = subsystem
        .orchestrator()
        .recover(EP_B, ChannelState::Normal, Verdict::CanRecover)
        .unwrap();

    assert_eq!(
        outcome.report().unwrap().path,
        vec![RecoveryState::Detecting, RecoveryState::Done]
    );
    assert_eq!(fabric.resets(), 0);
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn failing_subscriber_does_not_starve_the_rest() {
    let bus = NotificationBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    bus.subscribe(move |_, _| {
        s.lock().unwrap().push("first");
        Verdict::CanRecover
    });
    bus.subscribe(|_, _| panic!("subscriber failure"));
    let s = seen.clone();
    bus.subscribe(move |_, _| {
        s.lock().unwrap().push("third");
        Verdict::CanRecover
    });

    let report = bus.publish(Severity::Fatal, RP);

    assert_eq!(report, PublishReport { delivered: 2, failed: 1 });
    assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);

    // The bus is still usable afterwards.
    assert_eq!(bus.publish(Severity::Correctable, RP).delivered, 2);
}

#[test]
fn correctable_internal_error_on_downstream_port_is_cleared_by_fabric_handler() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(fabric_internal_config());
    subsystem.attach_fabric_handler();

    fabric.aer(DSP).latch(aer::COR_STATUS, 0x1);
    fabric.ras(DSP).latch(ras::COR_STATUS, 0x1);

    let outcome = subsystem
        .handle_fault(DSP, FaultClass::Correctable, &**fabric.aer(DSP))
        .unwrap();

    match outcome.port {
        PortVerdict::Internal {
            severity, report, ..
        } => {
            assert_eq!(severity, Severity::Correctable);
            assert_eq!(report.delivered, 1);
        }
        other => panic!("expected internal error, got {other:?}"),
    }
    assert!(outcome.recovery.is_none());
    assert_eq!(fabric.ras(DSP).read_status(ras::COR_STATUS), 0);
    assert_eq!(fabric.aer(DSP).read_status(aer::COR_STATUS), 0);

    let records = fabric.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source, DSP);
    assert_eq!(records[0].severity, Severity::Correctable);
    assert_eq!(records[0].status, 0x1);
    assert_eq!(
        subsystem.registry().get(DSP).unwrap().counters().snapshot().correctable,
        1
    );
    assert_eq!(fabric.map_calls(), 1);
}

#[test]
fn uncorrectable_internal_error_on_root_port_resets_the_link() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(fabric_internal_config());
    subsystem.attach_fabric_handler();
    let published = Arc::new(Mutex::new(Vec::new()));
    let p = published.clone();
    subsystem.bus().subscribe(move |severity, source| {
        p.lock().unwrap().push((severity, source));
        Verdict::CanRecover
    });

    let aer_regs = fabric.aer(RP);
    aer_regs.latch(aer::UNCOR_STATUS, 0x4000);
    aer_regs.poke(aer::UNCOR_SEVERITY, 0x4000);
    fabric.ras(RP).latch(ras::UNCOR_STATUS, 0x4000);

    let outcome = subsystem
        .handle_fault(RP, FaultClass::Uncorrectable, &**aer_regs)
        .unwrap();

    assert_eq!(*published.lock().unwrap(), vec![(Severity::Fatal, RP)]);
    assert!(outcome.port.is_internal());
    assert_eq!(outcome.port.verdict(), Verdict::NeedReset);

    let recovery = outcome.recovery.unwrap();
    let report = recovery.report().unwrap();
    assert_eq!(
        report.path,
        vec![
            RecoveryState::Detecting,
            RecoveryState::ResetRequired,
            RecoveryState::SlotReset,
            RecoveryState::MmioReenable,
            RecoveryState::Resuming,
            RecoveryState::Done,
        ]
    );
    assert!(report.reset_performed);
    assert!(!recovery.is_unusable());
    assert_eq!(fabric.resets(), 1);

    assert_eq!(aer_regs.read_status(aer::UNCOR_STATUS), 0);
    assert_eq!(fabric.ras(RP).read_status(ras::UNCOR_STATUS), 0);
    let records = fabric.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].first_error, Some(0x4000));
    assert!(!subsystem.orchestrator().is_active(RP));
}

#[test]
fn default_config_uses_aer_internal_error_bits() {
    let fabric = SimFabric::new();
    let subsystem = fabric.subsystem(RasConfig::default());
    subsystem.attach_fabric_handler();

    let aer_regs = fabric.aer(USP);
    aer_regs.latch(aer::UNCOR_STATUS, aer::UNCOR_INTERNAL);

    let outcome = subsystem
        .handle_fault(USP, FaultClass::Uncorrectable, &**aer_regs)
        .unwrap();

    assert_eq!(outcome.port.severity(), Some(Severity::NonFatal));
    assert!(outcome.port.is_internal());
    assert!(outcome.recovery.unwrap().report().unwrap().reset_performed);
    // No RAS status latched: the fabric handler looked but found nothing to log.
    assert!(fabric.sink.is_empty());
    assert_eq!(aer_regs.read_status(aer::UNCOR_STATUS), 0);
}

#[test]
fn unregistering_a_switch_drops_its_subtree() {
    let fabric = SimFabric::new();
    let registry = fabric.registry();
    let dsp = registry.get(DSP).unwrap();
    registry.map_registers(&dsp).unwrap();
    drop(dsp);

    assert_eq!(registry.unregister_port(USP).unwrap(), 4);
    assert_eq!(registry.len(), 1);
    assert!(registry.find_port(EP_A, PortQuery::NearestPort).is_none());
    assert!(registry.get(RP).unwrap().children().is_empty());
}
