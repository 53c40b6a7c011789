//! Driver-side error callbacks and the verdicts they return.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::bdf::PciBdf;
use crate::status::Severity;

/// A device's answer to an error callback.
///
/// Ordered by severity so aggregation is just `max`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Verdict {
    #[default]
    CanRecover,
    NeedReset,
    Disconnect,
}

impl Verdict {
    /// The more severe of the two.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }

    /// Folds a sequence of verdicts; an empty sequence can recover.
    pub fn aggregate(verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        verdicts.into_iter().fold(Self::CanRecover, Self::merge)
    }
}

/// State of the I/O channel to a device when an error is reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelState {
    /// I/O still works.
    Normal,
    /// I/O is blocked until the link is reset.
    Frozen,
    /// The device is gone.
    PermanentFailure,
}

impl ChannelState {
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Correctable | Severity::NonFatal => Self::Normal,
            Severity::Fatal => Self::Frozen,
        }
    }

    /// Verdict reported to recovery when a fault arrives with this channel state but nobody has
    /// looked at the devices yet.
    pub fn initial_verdict(self) -> Verdict {
        match self {
            Self::Normal => Verdict::CanRecover,
            Self::Frozen => Verdict::NeedReset,
            Self::PermanentFailure => Verdict::Disconnect,
        }
    }
}

/// Error callbacks a device driver may implement.
///
/// Only `error_detected` is mandatory; the rest default to "nothing to do".
pub trait ErrorHandlers: Send + Sync {
    fn error_detected(&self, dev: PciBdf, state: ChannelState) -> Verdict;

    fn mmio_enabled(&self, _dev: PciBdf) -> Verdict {
        Verdict::CanRecover
    }

    fn slot_reset(&self, _dev: PciBdf) -> Verdict {
        Verdict::CanRecover
    }

    fn resume(&self, _dev: PciBdf) {}

    /// Called for correctable errors while the device's correctable status is still latched.
    fn cor_error_detected(&self, _dev: PciBdf) {}
}

/// Which driver callbacks are bound to which device.
#[derive(Default)]
pub struct DriverBindings {
    bound: Mutex<BTreeMap<PciBdf, Arc<dyn ErrorHandlers>>>,
}

impl DriverBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handlers` to `dev`, returning whatever was bound before.
    pub fn bind(
        &self,
        dev: PciBdf,
        handlers: Arc<dyn ErrorHandlers>,
    ) -> Option<Arc<dyn ErrorHandlers>> {
        self.bound.lock().unwrap().insert(dev, handlers)
    }

    pub fn unbind(&self, dev: PciBdf) -> Option<Arc<dyn ErrorHandlers>> {
        self.bound.lock().unwrap().remove(&dev)
    }

    pub fn get(&self, dev: PciBdf) -> Option<Arc<dyn ErrorHandlers>> {
        self.bound.lock().unwrap().get(&dev).cloned()
    }
}
