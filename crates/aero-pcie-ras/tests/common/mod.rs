//! Shared helpers for `aero-pcie-ras` integration tests.
//!
//! [`SimFabric`] models a small hierarchy with in-memory register files:
//!
//! ```text
//! 00:01.0 root port
//! └── 01:00.0 switch upstream port
//!     └── 02:00.0 switch downstream port
//!         ├── 03:00.0 endpoint
//!         └── 03:00.1 endpoint
//! ```
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aero_pcie_ras::{
    LinkReset, MmioRegisters, PciBdf, PortDescriptor, PortRecord, PortRole, RasConfig, RasError,
    RasSubsystem, RecordingSink, RegisterBlock, RegisterMapper, Result, TopologyRegistry,
};

pub const RP: PciBdf = PciBdf::new(0, 1, 0);
pub const USP: PciBdf = PciBdf::new(1, 0, 0);
pub const DSP: PciBdf = PciBdf::new(2, 0, 0);
pub const EP_A: PciBdf = PciBdf::new(3, 0, 0);
pub const EP_B: PciBdf = PciBdf::new(3, 0, 1);

/// Device the switch ports belong to.
pub const SWITCH: PciBdf = PciBdf::new(1, 0, 0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct SimFabric {
    ras: BTreeMap<PciBdf, Arc<MmioRegisters>>,
    aer: BTreeMap<PciBdf, Arc<MmioRegisters>>,
    pub map_calls: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
    pub sink: Arc<RecordingSink>,
}

impl SimFabric {
    pub fn new() -> Self {
        init_tracing();

        let ras = [RP, USP, DSP]
            .into_iter()
            .map(|bdf| (bdf, Arc::new(MmioRegisters::ras())))
            .collect();
        let aer = [RP, USP, DSP, EP_A, EP_B]
            .into_iter()
            .map(|bdf| (bdf, Arc::new(MmioRegisters::aer())))
            .collect();

        Self {
            ras,
            aer,
            map_calls: Arc::new(AtomicUsize::new(0)),
            resets: Arc::new(AtomicUsize::new(0)),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    /// Fabric RAS register file of a port.
    pub fn ras(&self, bdf: PciBdf) -> &Arc<MmioRegisters> {
        &self.ras[&bdf]
    }

    /// AER register file of any device.
    pub fn aer(&self, bdf: PciBdf) -> &Arc<MmioRegisters> {
        &self.aer[&bdf]
    }

    /// Mapper that hands out the port's RAS register file and counts invocations.
    pub fn mapper(&self) -> Box<dyn RegisterMapper> {
        let files = self.ras.clone();
        let calls = self.map_calls.clone();
        Box::new(move |port: &PortRecord| -> Result<RegisterBlock> {
            calls.fetch_add(1, Ordering::SeqCst);
            let regs = files
                .get(&port.bdf())
                .cloned()
                .ok_or(RasError::NotPresent { bdf: port.bdf() })?;
            let base = 0xfe00_0000 + u64::from(port.bdf().pack_u16()) * 0x1000;
            Ok(RegisterBlock::new(base, Box::new(regs)))
        })
    }

    pub fn link_reset(&self) -> Box<dyn LinkReset> {
        let resets = self.resets.clone();
        Box::new(move |_root: PciBdf| -> Result<()> {
            resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    pub fn registry(&self) -> TopologyRegistry {
        let registry = TopologyRegistry::new(self.mapper());
        register_topology(&registry);
        registry
    }

    pub fn subsystem(&self, config: RasConfig) -> RasSubsystem {
        let subsystem = RasSubsystem::new(
            config,
            self.mapper(),
            self.link_reset(),
            self.sink.clone(),
        );
        register_topology(subsystem.registry());
        subsystem
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

pub fn register_topology(registry: &TopologyRegistry) {
    registry.register_port(RP, PortRole::RootPort, None).unwrap();
    registry
        .register(
            PortDescriptor::new(USP, PortRole::UpstreamSwitchPort)
                .parent(RP)
                .owner(SWITCH),
        )
        .unwrap();
    registry
        .register(
            PortDescriptor::new(DSP, PortRole::DownstreamSwitchPort)
                .parent(USP)
                .owner(SWITCH),
        )
        .unwrap();
    registry
        .register_port(EP_A, PortRole::Endpoint, Some(DSP))
        .unwrap();
    registry
        .register_port(EP_B, PortRole::Endpoint, Some(DSP))
        .unwrap();
}
