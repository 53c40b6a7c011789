//! PCIe error detection, classification and recovery for Aero's port topology.
//!
//! The pipeline runs from a dispatched error interrupt to a recovery outcome:
//!
//! 1. [`port::PortErrorHandler`] reads the port's own status and decides whether the fault is a
//!    standard error or an "internal" error.
//! 2. Internal errors are published on the [`notify::NotificationBus`]; subscribers such as
//!    [`fabric::FabricRasHandler`] look up the port in the [`topology::TopologyRegistry`] and run
//!    the [`status::StatusEngine`] against its mapped [`regs::RegisterBlock`].
//! 3. Uncorrectable faults drive the [`recovery::RecoveryOrchestrator`] across the subtree of the
//!    failing root port.
//!
//! [`subsystem::RasSubsystem`] owns all of the above and is the usual entry point.

#![forbid(unsafe_code)]

pub mod bdf;
pub mod config;
pub mod driver;
pub mod error;
pub mod fabric;
pub mod notify;
pub mod port;
pub mod recovery;
pub mod regs;
pub mod stats;
pub mod status;
pub mod subsystem;
pub mod topology;
pub mod trace;

pub use bdf::PciBdf;
pub use config::{PortHandlerConfig, RasConfig};
pub use driver::{ChannelState, DriverBindings, ErrorHandlers, Verdict};
pub use error::{RasError, Result};
pub use fabric::{FabricRasHandler, ProbedPorts};
pub use notify::{NotificationBus, PublishReport, SubscriptionToken};
pub use port::{FaultClass, PortErrorHandler, PortVerdict};
pub use recovery::{
    LinkReset, RecoveryOrchestrator, RecoveryOutcome, RecoveryReport, RecoveryState,
};
pub use regs::{MmioRegisters, RegisterAccess, RegisterBlock};
pub use stats::{ErrorCounters, ErrorCountersSnapshot};
pub use status::{ErrorEvent, HeaderLog, Severity, StatusEngine, UncorrectableReport};
pub use subsystem::{FaultOutcome, RasSubsystem};
pub use topology::{
    PortDescriptor, PortHandle, PortQuery, PortRecord, PortRole, RegisterMapper, TopologyRegistry,
};
pub use trace::{RecordingSink, TraceRecord, TraceSink, TracingSink};
