//! Port topology registry.
//!
//! Every port and device that can report errors gets a [`PortRecord`]. Records are owned by the
//! [`TopologyRegistry`]; parent and child links between records are weak and only used for
//! walking the tree. A record's fabric RAS [`RegisterBlock`] is mapped lazily and at most once,
//! no matter how many leaf devices below the port are probed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::debug;

use crate::bdf::PciBdf;
use crate::error::{RasError, Result};
use crate::regs::RegisterBlock;
use crate::stats::ErrorCounters;

/// Position of a device in the PCIe hierarchy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PortRole {
    RootPort,
    DownstreamSwitchPort,
    UpstreamSwitchPort,
    Endpoint,
}

impl PortRole {
    /// Whether a device in this role may repurpose its internal-error status bits for fabric
    /// signalling. Endpoints report through their own driver instead.
    pub const fn signals_internal_errors(self) -> bool {
        !matches!(self, Self::Endpoint)
    }

    /// Whether the generic port error handler is bound to this role and takes part in recovery
    /// alongside the device's own handlers.
    pub const fn binds_port_handler(self) -> bool {
        matches!(self, Self::RootPort | Self::DownstreamSwitchPort)
    }
}

/// Upward lookup performed by [`TopologyRegistry::find_port`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortQuery {
    /// The root port the device sits under.
    RootPort,
    /// The nearest port of any non-endpoint role.
    NearestPort,
    /// The upstream switch port whose owning device is `owner`.
    UpstreamPortOwnedBy(PciBdf),
}

impl PortQuery {
    fn matches(self, record: &PortRecord) -> bool {
        match self {
            Self::RootPort => record.role == PortRole::RootPort,
            Self::NearestPort => record.role != PortRole::Endpoint,
            Self::UpstreamPortOwnedBy(owner) => {
                record.role == PortRole::UpstreamSwitchPort && record.owner == Some(owner)
            }
        }
    }
}

pub struct PortRecord {
    bdf: PciBdf,
    role: PortRole,
    owner: Option<PciBdf>,
    parent: Option<Weak<PortRecord>>,
    children: Mutex<Vec<Weak<PortRecord>>>,
    regs: OnceLock<RegisterBlock>,
    counters: ErrorCounters,
}

pub type PortHandle = Arc<PortRecord>;

impl PortRecord {
    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn role(&self) -> PortRole {
        self.role
    }

    /// Device that exposes this port (e.g. the switch an upstream port belongs to).
    pub fn owner(&self) -> Option<PciBdf> {
        self.owner
    }

    pub fn parent(&self) -> Option<PortHandle> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<PortHandle> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The mapped fabric RAS registers, if [`TopologyRegistry::map_registers`] has succeeded.
    pub fn registers(&self) -> Option<&RegisterBlock> {
        self.regs.get()
    }

    pub fn counters(&self) -> &ErrorCounters {
        &self.counters
    }
}

impl fmt::Debug for PortRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRecord")
            .field("bdf", &self.bdf)
            .field("role", &self.role)
            .field("owner", &self.owner)
            .field("parent", &self.parent().map(|p| p.bdf))
            .field("mapped", &self.regs.get().is_some())
            .finish()
    }
}

/// Maps the fabric RAS capability of a port into a [`RegisterBlock`].
///
/// Capability discovery and address translation live behind this trait.
pub trait RegisterMapper: Send + Sync {
    /// Returns [`RasError::NotPresent`] when the port exposes no RAS capability.
    fn map(&self, port: &PortRecord) -> Result<RegisterBlock>;
}

impl<F> RegisterMapper for F
where
    F: Fn(&PortRecord) -> Result<RegisterBlock> + Send + Sync,
{
    fn map(&self, port: &PortRecord) -> Result<RegisterBlock> {
        self(port)
    }
}

/// Description of a port handed to [`TopologyRegistry::register`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortDescriptor {
    pub bdf: PciBdf,
    pub role: PortRole,
    pub parent: Option<PciBdf>,
    pub owner: Option<PciBdf>,
}

impl PortDescriptor {
    pub fn new(bdf: PciBdf, role: PortRole) -> Self {
        Self {
            bdf,
            role,
            parent: None,
            owner: None,
        }
    }

    pub fn parent(mut self, parent: PciBdf) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn owner(mut self, owner: PciBdf) -> Self {
        self.owner = Some(owner);
        self
    }
}

pub struct TopologyRegistry {
    ports: Mutex<BTreeMap<PciBdf, PortHandle>>,
    // Serializes presence-check + map so sibling faults can't both map the same port.
    map_lock: Mutex<()>,
    mapper: Box<dyn RegisterMapper>,
}

impl TopologyRegistry {
    pub fn new(mapper: Box<dyn RegisterMapper>) -> Self {
        Self {
            ports: Mutex::new(BTreeMap::new()),
            map_lock: Mutex::new(()),
            mapper,
        }
    }

    /// Registers a port, or returns the existing record for `bdf`.
    pub fn register_port(
        &self,
        bdf: PciBdf,
        role: PortRole,
        parent: Option<PciBdf>,
    ) -> Result<PortHandle> {
        let mut desc = PortDescriptor::new(bdf, role);
        desc.parent = parent;
        self.register(desc)
    }

    /// Registers a port described by `desc`.
    ///
    /// Registration is idempotent: a second call for the same BDF and role returns the original
    /// record unchanged. Re-registering with a different role is rejected.
    pub fn register(&self, desc: PortDescriptor) -> Result<PortHandle> {
        let mut ports = self.ports.lock().unwrap();

        if let Some(existing) = ports.get(&desc.bdf) {
            if existing.role != desc.role {
                return Err(RasError::DuplicatePort {
                    bdf: desc.bdf,
                    existing: existing.role,
                    requested: desc.role,
                });
            }
            return Ok(existing.clone());
        }

        let parent = match desc.parent {
            Some(parent) => Some(
                ports
                    .get(&parent)
                    .cloned()
                    .ok_or(RasError::UnknownPort { bdf: parent })?,
            ),
            None => None,
        };

        let record = Arc::new(PortRecord {
            bdf: desc.bdf,
            role: desc.role,
            owner: desc.owner,
            parent: parent.as_ref().map(Arc::downgrade),
            children: Mutex::new(Vec::new()),
            regs: OnceLock::new(),
            counters: ErrorCounters::new(),
        });
        if let Some(parent) = &parent {
            parent.children.lock().unwrap().push(Arc::downgrade(&record));
        }
        ports.insert(desc.bdf, record.clone());

        debug!(bdf = %desc.bdf, role = ?desc.role, parent = ?desc.parent, "registered port");
        Ok(record)
    }

    /// Maps the port's RAS registers unless they are already mapped.
    ///
    /// Calling this again on a mapped port is a successful no-op; the mapper is never invoked
    /// twice for the same record.
    pub fn map_registers(&self, handle: &PortHandle) -> Result<()> {
        if handle.regs.get().is_some() {
            return Ok(());
        }

        let _guard = self.map_lock.lock().unwrap();
        if handle.regs.get().is_some() {
            return Ok(());
        }

        let block = self.mapper.map(handle)?;
        debug!(bdf = %handle.bdf, base = format_args!("{:#x}", block.base()), "mapped RAS registers");
        if handle.regs.set(block).is_err() {
            unreachable!("RAS registers for {} mapped twice", handle.bdf);
        }
        Ok(())
    }

    pub fn get(&self, bdf: PciBdf) -> Option<PortHandle> {
        self.ports.lock().unwrap().get(&bdf).cloned()
    }

    /// Walks from `device` towards the root and returns the first record matching `query`.
    ///
    /// The walk includes `device` itself, so a port asking for [`PortQuery::NearestPort`]
    /// resolves to its own record.
    pub fn find_port(&self, device: PciBdf, query: PortQuery) -> Option<PortHandle> {
        let mut cursor = self.get(device);
        while let Some(record) = cursor {
            if query.matches(&record) {
                return Some(record);
            }
            cursor = record.parent();
        }
        None
    }

    /// Depth-first list of `root` and everything registered below it, `root` first.
    pub fn subtree(&self, root: &PortHandle) -> Vec<PortHandle> {
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(record) = stack.pop() {
            let mut children = record.children();
            // Reverse so the first-registered child is visited first.
            children.reverse();
            stack.extend(children);
            out.push(record);
        }
        out
    }

    /// Removes `bdf` and everything below it, releasing their register blocks.
    ///
    /// Returns the number of records removed.
    pub fn unregister_port(&self, bdf: PciBdf) -> Result<usize> {
        // Held throughout so a concurrent registration cannot attach below a record being removed.
        let mut ports = self.ports.lock().unwrap();
        let record = ports
            .get(&bdf)
            .cloned()
            .ok_or(RasError::UnknownPort { bdf })?;
        let doomed = self.subtree(&record);

        for victim in &doomed {
            ports.remove(&victim.bdf);
        }
        if let Some(parent) = record.parent() {
            parent
                .children
                .lock()
                .unwrap()
                .retain(|child| !std::ptr::eq(child.as_ptr(), Arc::as_ptr(&record)));
        }
        drop(ports);

        debug!(bdf = %bdf, removed = doomed.len(), "unregistered port subtree");
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.ports.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
