//! Internal-error notification bus.
//!
//! The port error handler publishes internal errors here without knowing who consumes them. A
//! bus is created with the RAS subsystem; consumers subscribe during their own init and
//! unsubscribe on teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::bdf::PciBdf;
use crate::driver::Verdict;
use crate::status::Severity;

/// Subscriber callback. The returned verdict is a hint for the subscriber's own bookkeeping; the
/// bus does not combine hints across subscribers.
pub type Subscriber = Arc<dyn Fn(Severity, PciBdf) -> Verdict + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Callbacks that panicked. The remaining callbacks still ran.
    pub failed: usize,
}

#[derive(Default)]
struct Subscribers {
    next_token: u64,
    list: Vec<(SubscriptionToken, Subscriber)>,
}

/// Ordered list of subscribers receiving `(severity, source)` notifications.
///
/// Delivery and (un)subscription exclude each other: a publish sees exactly the subscribers
/// registered before it started. Callbacks run with the bus locked and therefore must not call
/// back into the bus.
#[derive(Default)]
pub struct NotificationBus {
    subscribers: Mutex<Subscribers>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(Severity, PciBdf) -> Verdict + Send + Sync + 'static,
    {
        let mut subs = self.subscribers.lock().unwrap();
        let token = SubscriptionToken(subs.next_token);
        subs.next_token += 1;
        subs.list.push((token, Arc::new(callback)));
        debug!(?token, subscribers = subs.list.len(), "subscribed to internal errors");
        token
    }

    /// Returns `false` if `token` was not subscribed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.subscribers.lock().unwrap();
        let before = subs.list.len();
        subs.list.retain(|(t, _)| *t != token);
        let removed = subs.list.len() != before;
        debug!(?token, removed, "unsubscribed from internal errors");
        removed
    }

    /// Synchronously invokes every subscriber in registration order.
    pub fn publish(&self, severity: Severity, source: PciBdf) -> PublishReport {
        let subs = self.subscribers.lock().unwrap();
        let mut report = PublishReport::default();

        for (token, callback) in subs.list.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback(severity, source))) {
                Ok(hint) => {
                    report.delivered += 1;
                    debug!(?token, bdf = %source, ?severity, ?hint, "internal error delivered");
                }
                Err(_) => {
                    report.failed += 1;
                    error!(?token, bdf = %source, ?severity, "internal error subscriber panicked");
                }
            }
        }

        report
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
