//! Fault-status register access.
//!
//! Two register groups matter to the pipeline:
//! - the port's own AER-style status group ([`aer`]), read by the port error handler, and
//! - the fabric RAS capability group ([`ras`]), mapped per port into a [`RegisterBlock`] and read
//!   by the status engine.
//!
//! Both are plain 32-bit registers addressed by byte offset. Status registers are
//! write-one-to-clear.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Value returned by a read from a device that has dropped off the link.
pub const DISCONNECTED_SENTINEL: u32 = 0xFFFF_FFFF;

/// Offsets within the port's AER extended capability.
pub mod aer {
    pub const UNCOR_STATUS: u32 = 0x04;
    pub const UNCOR_MASK: u32 = 0x08;
    pub const UNCOR_SEVERITY: u32 = 0x0c;
    pub const COR_STATUS: u32 = 0x10;
    pub const COR_MASK: u32 = 0x14;
    pub const CAP_CONTROL: u32 = 0x18;
    pub const HEADER_LOG: u32 = 0x1c;
    pub const HEADER_LOG_DWORDS: usize = 4;

    /// Correctable Internal Error (CIE).
    pub const COR_INTERNAL: u32 = 1 << 14;
    /// Uncorrectable Internal Error (UIE).
    pub const UNCOR_INTERNAL: u32 = 1 << 22;

    pub const LEN: usize = HEADER_LOG as usize + HEADER_LOG_DWORDS * 4;
    pub const STATUS_REGS: [u32; 2] = [UNCOR_STATUS, COR_STATUS];
}

/// Offsets within the fabric RAS capability.
pub mod ras {
    pub const UNCOR_STATUS: u32 = 0x00;
    pub const UNCOR_MASK: u32 = 0x04;
    pub const UNCOR_SEVERITY: u32 = 0x08;
    pub const COR_STATUS: u32 = 0x0c;
    pub const COR_MASK: u32 = 0x10;
    pub const CAP_CONTROL: u32 = 0x14;
    pub const HEADER_LOG: u32 = 0x18;
    pub const HEADER_LOG_DWORDS: usize = 16;

    /// First Error Pointer, bits 5:0 of the capability/control register.
    pub const CAP_CONTROL_FE_MASK: u32 = 0x3f;

    pub const LEN: usize = HEADER_LOG as usize + HEADER_LOG_DWORDS * 4;
    pub const STATUS_REGS: [u32; 2] = [UNCOR_STATUS, COR_STATUS];
}

/// Synchronous, bounded-latency access to a device's status/control registers.
///
/// Implementations must not reorder accesses and must not block. An out-of-range offset means
/// the mapping was wrong, which is an invariant violation: implementations panic rather than
/// report it.
pub trait RegisterAccess: Send + Sync {
    fn read_status(&self, offset: u32) -> u32;
    fn write_status(&self, offset: u32, value: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for Arc<T> {
    fn read_status(&self, offset: u32) -> u32 {
        (**self).read_status(offset)
    }

    fn write_status(&self, offset: u32, value: u32) {
        (**self).write_status(offset, value)
    }
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for Box<T> {
    fn read_status(&self, offset: u32) -> u32 {
        (**self).read_status(offset)
    }

    fn write_status(&self, offset: u32, value: u32) {
        (**self).write_status(offset, value)
    }
}

/// A mapped fabric RAS register group belonging to exactly one port record.
pub struct RegisterBlock {
    base: u64,
    regs: Box<dyn RegisterAccess>,
}

impl RegisterBlock {
    pub fn new(base: u64, regs: Box<dyn RegisterAccess>) -> Self {
        Self { base, regs }
    }

    /// Physical base address of the mapped region (diagnostics only).
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn read(&self, offset: u32) -> u32 {
        self.regs.read_status(offset)
    }

    pub fn write(&self, offset: u32, value: u32) {
        self.regs.write_status(offset, value)
    }

    /// Copies `N` consecutive dwords starting at `offset`.
    pub fn read_dwords<const N: usize>(&self, offset: u32) -> [u32; N] {
        core::array::from_fn(|i| self.read(offset + (i as u32) * 4))
    }
}

impl RegisterAccess for RegisterBlock {
    fn read_status(&self, offset: u32) -> u32 {
        self.read(offset)
    }

    fn write_status(&self, offset: u32, value: u32) {
        self.write(offset, value)
    }
}

impl fmt::Debug for RegisterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterBlock")
            .field("base", &format_args!("{:#x}", self.base))
            .finish_non_exhaustive()
    }
}

struct MmioState {
    words: Vec<u32>,
    writes: u64,
}

/// In-memory register file with write-one-to-clear status registers.
///
/// Backs host-side simulation of a port's register groups. The "hardware" side uses
/// [`MmioRegisters::latch`] and [`MmioRegisters::poke`]; software goes through
/// [`RegisterAccess`], which is also what [`MmioRegisters::write_count`] counts.
pub struct MmioRegisters {
    state: Mutex<MmioState>,
    rw1c: Vec<u32>,
}

impl MmioRegisters {
    pub fn new(len_bytes: usize, rw1c: &[u32]) -> Self {
        assert!(len_bytes % 4 == 0, "register file length must be dword aligned");
        Self {
            state: Mutex::new(MmioState {
                words: vec![0; len_bytes / 4],
                writes: 0,
            }),
            rw1c: rw1c.to_vec(),
        }
    }

    /// Register file laid out as a port's AER capability.
    pub fn aer() -> Self {
        Self::new(aer::LEN, &aer::STATUS_REGS)
    }

    /// Register file laid out as a fabric RAS capability.
    pub fn ras() -> Self {
        Self::new(ras::LEN, &ras::STATUS_REGS)
    }

    /// Sets status bits as the device would when it detects an error.
    pub fn latch(&self, offset: u32, bits: u32) {
        let mut state = self.state.lock().unwrap();
        let idx = word_index(&state.words, offset);
        state.words[idx] |= bits;
    }

    /// Overwrites a register as the device would, bypassing write-one-to-clear semantics.
    pub fn poke(&self, offset: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        let idx = word_index(&state.words, offset);
        state.words[idx] = value;
    }

    /// Number of software writes observed through [`RegisterAccess::write_status`].
    pub fn write_count(&self) -> u64 {
        self.state.lock().unwrap().writes
    }
}

impl RegisterAccess for MmioRegisters {
    fn read_status(&self, offset: u32) -> u32 {
        let state = self.state.lock().unwrap();
        state.words[word_index(&state.words, offset)]
    }

    fn write_status(&self, offset: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        let idx = word_index(&state.words, offset);
        state.writes += 1;
        if self.rw1c.contains(&offset) {
            state.words[idx] &= !value;
        } else {
            state.words[idx] = value;
        }
    }
}

fn word_index(words: &[u32], offset: u32) -> usize {
    assert!(offset % 4 == 0, "unaligned register offset {offset:#x}");
    let idx = (offset / 4) as usize;
    assert!(
        idx < words.len(),
        "register offset {offset:#x} outside mapped region of {} bytes",
        words.len() * 4
    );
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_registers_are_write_one_to_clear() {
        let regs = MmioRegisters::ras();
        regs.latch(ras::COR_STATUS, 0b101);

        regs.write_status(ras::COR_STATUS, 0b001);
        assert_eq!(regs.read_status(ras::COR_STATUS), 0b100);

        // Writing zero bits leaves status untouched.
        regs.write_status(ras::COR_STATUS, 0);
        assert_eq!(regs.read_status(ras::COR_STATUS), 0b100);
        assert_eq!(regs.write_count(), 2);
    }

    #[test]
    fn control_registers_take_written_value() {
        let regs = MmioRegisters::ras();
        regs.write_status(ras::UNCOR_SEVERITY, 0x4000);
        assert_eq!(regs.read_status(ras::UNCOR_SEVERITY), 0x4000);
    }

    #[test]
    fn block_reads_consecutive_dwords() {
        let regs = Arc::new(MmioRegisters::ras());
        for i in 0..ras::HEADER_LOG_DWORDS as u32 {
            regs.poke(ras::HEADER_LOG + i * 4, 0x100 + i);
        }
        let block = RegisterBlock::new(0xfe00_0000, Box::new(regs.clone()));
        let log: [u32; ras::HEADER_LOG_DWORDS] = block.read_dwords(ras::HEADER_LOG);
        assert_eq!(log[0], 0x100);
        assert_eq!(log[15], 0x10f);
        assert_eq!(block.base(), 0xfe00_0000);
    }

    #[test]
    #[should_panic(expected = "outside mapped region")]
    fn out_of_range_access_fails_fast() {
        let regs = MmioRegisters::aer();
        regs.read_status(0x400);
    }
}
