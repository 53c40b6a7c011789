//! Recovery of the subtree below a failing root port.
//!
//! A session walks `Detecting -> ResetRequired -> SlotReset -> MmioReenable -> Resuming -> Done`,
//! or goes straight from `Detecting` to `Done` when nobody asks for a reset. At most one session
//! runs per root port; faults reported while it runs are folded into it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{error, info, warn};

use crate::bdf::PciBdf;
use crate::driver::{ChannelState, DriverBindings, ErrorHandlers, Verdict};
use crate::error::{RasError, Result};
use crate::port::PortErrorHandler;
use crate::topology::{PortHandle, PortQuery, TopologyRegistry};

/// Passes a single session may run before giving up on a subtree that keeps faulting.
const MAX_PASSES: u32 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RecoveryState {
    Detecting,
    ResetRequired,
    SlotReset,
    MmioReenable,
    Resuming,
    Done,
}

/// Resets the link below a root port (secondary bus reset or equivalent).
pub trait LinkReset: Send + Sync {
    fn reset_subordinates(&self, root: PciBdf) -> Result<()>;
}

impl<F> LinkReset for F
where
    F: Fn(PciBdf) -> Result<()> + Send + Sync,
{
    fn reset_subordinates(&self, root: PciBdf) -> Result<()> {
        self(root)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecoveryReport {
    pub root: PciBdf,
    /// Every state entered, in order, across all passes.
    pub path: Vec<RecoveryState>,
    /// Worst verdict the session acted on.
    pub verdict: Verdict,
    pub reset_performed: bool,
    /// Most devices consulted by any single detection pass.
    pub visited: usize,
    pub passes: u32,
}

impl RecoveryReport {
    pub fn final_state(&self) -> RecoveryState {
        self.path.last().copied().unwrap_or(RecoveryState::Detecting)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryOutcome {
    Finished(RecoveryReport),
    /// A session was already running for `root`; the fault was merged into it.
    Coalesced { root: PciBdf },
}

impl RecoveryOutcome {
    pub fn report(&self) -> Option<&RecoveryReport> {
        match self {
            Self::Finished(report) => Some(report),
            Self::Coalesced { .. } => None,
        }
    }

    /// The subtree ended disconnected and must not be used until it is re-enumerated.
    pub fn is_unusable(&self) -> bool {
        self.report()
            .is_some_and(|report| report.verdict == Verdict::Disconnect)
    }
}

pub struct RecoveryOrchestrator {
    registry: Arc<TopologyRegistry>,
    bindings: Arc<DriverBindings>,
    port_handler: Arc<PortErrorHandler>,
    reset: Box<dyn LinkReset>,
    // Active sessions by root port, holding verdicts merged in from coalesced faults.
    sessions: Mutex<BTreeMap<PciBdf, Verdict>>,
    unusable: Mutex<BTreeSet<PciBdf>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        registry: Arc<TopologyRegistry>,
        bindings: Arc<DriverBindings>,
        port_handler: Arc<PortErrorHandler>,
        reset: Box<dyn LinkReset>,
    ) -> Self {
        Self {
            registry,
            bindings,
            port_handler,
            reset,
            sessions: Mutex::new(BTreeMap::new()),
            unusable: Mutex::new(BTreeSet::new()),
        }
    }

    /// Recovers the subtree of the root port above `source`.
    ///
    /// `hint` is an extra verdict from whoever classified the fault (e.g. an internal error that
    /// always needs a reset); it is merged into the detection result.
    pub fn recover(
        &self,
        source: PciBdf,
        state: ChannelState,
        hint: Verdict,
    ) -> Result<RecoveryOutcome> {
        let root = self
            .registry
            .find_port(source, PortQuery::RootPort)
            .ok_or(RasError::UnknownPort { bdf: source })?;
        let root_bdf = root.bdf();

        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(absorbed) = sessions.get_mut(&root_bdf) {
                *absorbed = absorbed.merge(state.initial_verdict()).merge(hint);
                info!(root = %root_bdf, bdf = %source, "fault coalesced into active recovery");
                return Ok(RecoveryOutcome::Coalesced { root: root_bdf });
            }
            sessions.insert(root_bdf, Verdict::CanRecover);
        }

        info!(root = %root_bdf, bdf = %source, ?state, "starting recovery");
        let _session = SessionGuard {
            orchestrator: self,
            root: root_bdf,
        };
        let report = self.run_session(&root, state, hint);
        Ok(RecoveryOutcome::Finished(report))
    }

    pub fn is_active(&self, root: PciBdf) -> bool {
        self.sessions.lock().unwrap().contains_key(&root)
    }

    pub fn is_unusable(&self, root: PciBdf) -> bool {
        self.unusable.lock().unwrap().contains(&root)
    }

    /// Forgets that `root` was disconnected, e.g. after the subtree has been re-enumerated.
    pub fn clear_unusable(&self, root: PciBdf) -> bool {
        self.unusable.lock().unwrap().remove(&root)
    }

    fn run_session(&self, root: &PortHandle, state: ChannelState, hint: Verdict) -> RecoveryReport {
        let mut report = RecoveryReport {
            root: root.bdf(),
            path: Vec::new(),
            verdict: Verdict::CanRecover,
            reset_performed: false,
            visited: 0,
            passes: 0,
        };
        let mut state = state;
        let mut hint = hint;

        loop {
            report.passes += 1;
            let verdict = self.run_pass(root, state, hint, &mut report);
            report.verdict = report.verdict.merge(verdict);

            // Close the session unless a coalesced fault still needs acting on.
            let mut sessions = self.sessions.lock().unwrap();
            let absorbed = sessions.get(&root.bdf()).copied().unwrap_or_default();
            let rerun = verdict != Verdict::Disconnect && absorbed != Verdict::CanRecover;
            if rerun && report.passes < MAX_PASSES {
                sessions.insert(root.bdf(), Verdict::CanRecover);
                drop(sessions);
                info!(root = %root.bdf(), ?absorbed, "re-running recovery for coalesced fault");
                state = match absorbed {
                    Verdict::Disconnect => ChannelState::PermanentFailure,
                    _ => ChannelState::Frozen,
                };
                hint = absorbed;
                continue;
            }
            sessions.remove(&root.bdf());
            drop(sessions);

            if rerun {
                error!(
                    root = %root.bdf(),
                    passes = report.passes,
                    "subtree keeps faulting; disconnecting"
                );
                report.verdict = Verdict::Disconnect;
                self.unusable.lock().unwrap().insert(root.bdf());
            }
            break;
        }

        info!(
            root = %root.bdf(),
            verdict = ?report.verdict,
            reset = report.reset_performed,
            passes = report.passes,
            "recovery finished"
        );
        report
    }

    fn run_pass(
        &self,
        root: &PortHandle,
        state: ChannelState,
        hint: Verdict,
        report: &mut RecoveryReport,
    ) -> Verdict {
        report.path.push(RecoveryState::Detecting);
        let devices = self.registry.subtree(root);
        report.visited = report.visited.max(devices.len());

        let detected = self.broadcast(&devices, |h, dev| h.error_detected(dev, state));
        let mut verdict = detected.merge(hint);
        {
            // Faults coalesced while detecting count towards this pass.
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(absorbed) = sessions.get_mut(&root.bdf()) {
                verdict = verdict.merge(std::mem::take(absorbed));
            }
        }

        match verdict {
            Verdict::CanRecover => {}
            Verdict::Disconnect => self.mark_unusable(root),
            Verdict::NeedReset => {
                report.path.push(RecoveryState::ResetRequired);
                if let Err(err) = self.reset.reset_subordinates(root.bdf()) {
                    warn!(root = %root.bdf(), %err, "link reset failed");
                    self.mark_unusable(root);
                    report.path.push(RecoveryState::Done);
                    return Verdict::Disconnect;
                }
                report.reset_performed = true;

                report.path.push(RecoveryState::SlotReset);
                if self.broadcast(&devices, |h, dev| h.slot_reset(dev)) == Verdict::Disconnect {
                    self.mark_unusable(root);
                    report.path.push(RecoveryState::Done);
                    return Verdict::Disconnect;
                }

                report.path.push(RecoveryState::MmioReenable);
                if self.broadcast(&devices, |h, dev| h.mmio_enabled(dev)) == Verdict::Disconnect {
                    self.mark_unusable(root);
                    report.path.push(RecoveryState::Done);
                    return Verdict::Disconnect;
                }

                report.path.push(RecoveryState::Resuming);
                self.broadcast(&devices, |h, dev| {
                    h.resume(dev);
                    Verdict::CanRecover
                });
            }
        }

        report.path.push(RecoveryState::Done);
        verdict
    }

    /// Invokes `f` on every device's bound handlers, and on the generic port handler for roles
    /// that bind it, returning the worst verdict.
    fn broadcast<F>(&self, devices: &[PortHandle], f: F) -> Verdict
    where
        F: Fn(&dyn ErrorHandlers, PciBdf) -> Verdict,
    {
        let mut verdict = Verdict::CanRecover;
        for dev in devices {
            if let Some(handlers) = self.bindings.get(dev.bdf()) {
                verdict = verdict.merge(f(handlers.as_ref(), dev.bdf()));
            }
            if dev.role().binds_port_handler() {
                verdict = verdict.merge(f(self.port_handler.as_ref(), dev.bdf()));
            }
        }
        verdict
    }

    fn mark_unusable(&self, root: &PortHandle) {
        warn!(root = %root.bdf(), "subtree disconnected");
        self.unusable.lock().unwrap().insert(root.bdf());
    }
}

/// Releases a session whose driver callbacks unwound, so later faults on the root are not
/// coalesced into a session that no longer runs. The subtree's state is unknown afterwards and
/// it is marked unusable.
struct SessionGuard<'a> {
    orchestrator: &'a RecoveryOrchestrator,
    root: PciBdf,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        error!(root = %self.root, "recovery aborted by a panicking handler; disconnecting");
        self.orchestrator
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.root);
        self.orchestrator
            .unusable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.root);
    }
}
