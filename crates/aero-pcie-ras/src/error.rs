use thiserror::Error;

use crate::bdf::PciBdf;
use crate::topology::PortRole;

pub type Result<T> = std::result::Result<T, RasError>;

/// Errors surfaced by the RAS pipeline.
///
/// Register access failures are not represented here: a bad mapping is an invariant violation and
/// panics at the access site.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RasError {
    #[error("no fault capability registers present for {bdf}")]
    NotPresent { bdf: PciBdf },

    #[error("port {bdf} is not registered")]
    UnknownPort { bdf: PciBdf },

    #[error("port {bdf} already registered as {existing:?}, refusing to re-register as {requested:?}")]
    DuplicatePort {
        bdf: PciBdf,
        existing: PortRole,
        requested: PortRole,
    },

    #[error("secondary bus reset below {root} failed: {reason}")]
    ResetFailed { root: PciBdf, reason: String },
}
