//! Simulated physical memory
//!
//! The memory model follows section 1.4 of the RISC-V unprivileged
//! reference: a flat byte-addressable physical address space. The
//! store is sparse (absent bytes read as zero), so a full 32-bit or
//! 64-bit address space can be modelled without allocating it.
//!
//! The page-table walker does not depend on the concrete store; it
//! consumes the [`Bus`] trait, so a simulator with its own memory
//! system (devices, PMP checks, backing files) can plug in directly.
//! [`Memory`] implements [`Bus`] with exactly the accesses the walker
//! performs: whole-word reads and writes of page table entries.

use std::collections::HashMap;

/// The register and address-space width in RISC-V
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Xlen {
    #[default]
    Xlen32,
    Xlen64,
}

/// Physical memory interface consumed by the page-table walker
///
/// Page table entries are fetched and written back through this
/// trait. A failed read returns `None`; a failed write returns
/// `false`. The walker turns either failure into a page fault of the
/// access kind that triggered the walk.
///
/// Writes carry the index of the hart performing the access so that
/// an implementation can attribute stores (e.g. for memory-consistency
/// checking); implementations that do not care may ignore it.
pub trait Bus {
    /// Read the 32-bit word at addr
    fn read_u32(&self, addr: u64) -> Option<u32>;

    /// Read the 64-bit word at addr
    fn read_u64(&self, addr: u64) -> Option<u64>;

    /// Write a 32-bit word on behalf of hart hart_ix
    fn write_u32(&mut self, hart_ix: usize, addr: u64, value: u32) -> bool;

    /// Write a 64-bit word on behalf of hart hart_ix
    fn write_u64(&mut self, hart_ix: usize, addr: u64, value: u64) -> bool;
}

/// Sparse byte-granular memory
///
/// By default, memory is initialised for 32-bit mode (xlen == 32):
/// accesses starting above 0xffff_ffff fail. A multi-byte access that
/// straddles the top of the address space wraps around, matching
/// hardware behaviour.
#[derive(Debug, Default)]
pub struct Memory {
    xlen: Xlen,
    data: HashMap<u64, u8>,
}

impl Memory {
    pub fn new(xlen: Xlen) -> Self {
        Self {
            xlen,
            ..Default::default()
        }
    }

    fn wrap(&self, addr: u64) -> u64 {
        match self.xlen {
            Xlen::Xlen32 => 0xffff_ffff & addr,
            Xlen::Xlen64 => addr,
        }
    }

    fn in_range(&self, addr: u64) -> bool {
        self.xlen == Xlen::Xlen64 || addr <= 0xffff_ffff
    }

    fn read_word(&self, addr: u64, num_bytes: u64) -> u64 {
        let mut value = 0;
        for n in 0..num_bytes {
            let byte_addr = self.wrap(addr.wrapping_add(n));
            let byte_n = u64::from(*self.data.get(&byte_addr).unwrap_or(&0));
            value |= byte_n << (8 * n);
        }
        value
    }

    fn write_word(&mut self, addr: u64, num_bytes: u64, value: u64) {
        for n in 0..num_bytes {
            let byte_addr = self.wrap(addr.wrapping_add(n));
            let byte_n = (0xff & (value >> (8 * n))) as u8;
            // Keep the map sparse
            if byte_n == 0 {
                self.data.remove(&byte_addr);
            } else {
                self.data.insert(byte_addr, byte_n);
            }
        }
    }
}

impl Bus for Memory {
    fn read_u32(&self, addr: u64) -> Option<u32> {
        if !self.in_range(addr) {
            return None;
        }
        Some(self.read_word(addr, 4) as u32)
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        if !self.in_range(addr) {
            return None;
        }
        Some(self.read_word(addr, 8))
    }

    fn write_u32(&mut self, _hart_ix: usize, addr: u64, value: u32) -> bool {
        if !self.in_range(addr) {
            return false;
        }
        self.write_word(addr, 4, value.into());
        true
    }

    fn write_u64(&mut self, _hart_ix: usize, addr: u64, value: u64) -> bool {
        if !self.in_range(addr) {
            return false;
        }
        self.write_word(addr, 8, value);
        true
    }
}
