use crate::regs::aer;

/// Which port status bits form the "internal error" class.
///
/// Internal-error bits are left to the fabric layered on top of the port; the port error handler
/// only detects them and hands them off to the notification bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortHandlerConfig {
    pub cor_internal_mask: u32,
    pub uncor_internal_mask: u32,
}

impl Default for PortHandlerConfig {
    fn default() -> Self {
        Self {
            cor_internal_mask: aer::COR_INTERNAL,
            uncor_internal_mask: aer::UNCOR_INTERNAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RasConfig {
    pub port: PortHandlerConfig,
    /// Whether correctable events are sent to the trace sink. Counters are kept regardless.
    pub log_correctable: bool,
}

impl Default for RasConfig {
    fn default() -> Self {
        Self {
            port: PortHandlerConfig::default(),
            log_correctable: true,
        }
    }
}
