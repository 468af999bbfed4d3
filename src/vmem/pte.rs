//! Page table entries
//!
//! Bit-exact decodings of the Sv32, Sv39 and Sv48 page table entry
//! formats (sections 4.3, 4.4 and 4.5 of the RISC-V privileged
//! specification, version 20211203). The flag bits V/R/W/X/U/G/A/D
//! occupy bits 0 to 7 in all three formats; the formats differ in
//! width, level count and the split of the physical page number.
//!
//! The walker is generic over the [`Pte`] trait, so the same walk
//! loop serves all three translation modes.

use crate::memory::Bus;
use crate::utils::{bit, extract_field};

/// Decoded view of a page table entry
///
/// `ppn_component(i)` and `pa_ppn_shift(i)` are only defined for
/// `i < LEVELS`; the walker never asks for anything else.
pub trait Pte: Sized {
    /// Number of levels in the page-table tree
    const LEVELS: usize;

    /// Size of an entry in bytes
    const SIZE: u64;

    /// Fetch the entry at addr, or None if the bus rejects the read
    fn fetch(mem: &impl Bus, addr: u64) -> Option<Self>;

    /// Write the entry back to addr (after an A/D update)
    fn write_back(&self, mem: &mut impl Bus, hart_ix: usize, addr: u64) -> bool;

    /// The raw entry
    fn data(&self) -> u64;

    fn valid(&self) -> bool;
    fn read(&self) -> bool;
    fn write(&self) -> bool;
    fn exec(&self) -> bool;
    fn user(&self) -> bool;
    fn global(&self) -> bool;
    fn accessed(&self) -> bool;
    fn dirty(&self) -> bool;

    fn set_accessed(&mut self);
    fn set_dirty(&mut self);

    /// The full physical page number
    fn ppn(&self) -> u64;

    /// Component i of the physical page number
    fn ppn_component(&self, i: usize) -> u64;

    /// Bit position of ppn component i within a physical address
    fn pa_ppn_shift(i: usize) -> u32;
}

/// Flag accessors shared by all three entry formats
macro_rules! pte_flags {
    () => {
        fn valid(&self) -> bool {
            bit(self.0, 0)
        }

        fn read(&self) -> bool {
            bit(self.0, 1)
        }

        fn write(&self) -> bool {
            bit(self.0, 2)
        }

        fn exec(&self) -> bool {
            bit(self.0, 3)
        }

        fn user(&self) -> bool {
            bit(self.0, 4)
        }

        fn global(&self) -> bool {
            bit(self.0, 5)
        }

        fn accessed(&self) -> bool {
            bit(self.0, 6)
        }

        fn dirty(&self) -> bool {
            bit(self.0, 7)
        }

        fn set_accessed(&mut self) {
            self.0 |= 1 << 6;
        }

        fn set_dirty(&mut self) {
            self.0 |= 1 << 7;
        }
    };
}

/// Sv32 page table entry: 32 bits, two levels
///
/// ppn0 is 10 bits at bit 10, ppn1 is 12 bits at bit 20.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte32(pub u32);

impl Pte for Pte32 {
    const LEVELS: usize = 2;
    const SIZE: u64 = 4;

    fn fetch(mem: &impl Bus, addr: u64) -> Option<Self> {
        mem.read_u32(addr).map(Self)
    }

    fn write_back(&self, mem: &mut impl Bus, hart_ix: usize, addr: u64) -> bool {
        mem.write_u32(hart_ix, addr, self.0)
    }

    fn data(&self) -> u64 {
        self.0.into()
    }

    pte_flags!();

    fn ppn(&self) -> u64 {
        extract_field(self.0, 31, 10).into()
    }

    fn ppn_component(&self, i: usize) -> u64 {
        match i {
            0 => extract_field(self.0, 19, 10).into(),
            1 => extract_field(self.0, 31, 20).into(),
            _ => unreachable!("sv32 has two ppn components"),
        }
    }

    fn pa_ppn_shift(i: usize) -> u32 {
        match i {
            0 => 12,
            1 => 22,
            _ => unreachable!("sv32 has two ppn components"),
        }
    }
}

/// Sv39 page table entry: 64 bits, three levels
///
/// ppn0 and ppn1 are 9 bits at bits 10 and 19; ppn2 is 26 bits at
/// bit 28. Bits 54 and up are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte39(pub u64);

impl Pte for Pte39 {
    const LEVELS: usize = 3;
    const SIZE: u64 = 8;

    fn fetch(mem: &impl Bus, addr: u64) -> Option<Self> {
        mem.read_u64(addr).map(Self)
    }

    fn write_back(&self, mem: &mut impl Bus, hart_ix: usize, addr: u64) -> bool {
        mem.write_u64(hart_ix, addr, self.0)
    }

    fn data(&self) -> u64 {
        self.0
    }

    pte_flags!();

    fn ppn(&self) -> u64 {
        extract_field(self.0, 53, 10)
    }

    fn ppn_component(&self, i: usize) -> u64 {
        match i {
            0 => extract_field(self.0, 18, 10),
            1 => extract_field(self.0, 27, 19),
            2 => extract_field(self.0, 53, 28),
            _ => unreachable!("sv39 has three ppn components"),
        }
    }

    fn pa_ppn_shift(i: usize) -> u32 {
        match i {
            0 => 12,
            1 => 21,
            2 => 30,
            _ => unreachable!("sv39 has three ppn components"),
        }
    }
}

/// Sv48 page table entry: 64 bits, four levels
///
/// ppn0..ppn2 are 9 bits at bits 10, 19 and 28; ppn3 is 17 bits at
/// bit 37. Bits 54 and up are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte48(pub u64);

impl Pte for Pte48 {
    const LEVELS: usize = 4;
    const SIZE: u64 = 8;

    fn fetch(mem: &impl Bus, addr: u64) -> Option<Self> {
        mem.read_u64(addr).map(Self)
    }

    fn write_back(&self, mem: &mut impl Bus, hart_ix: usize, addr: u64) -> bool {
        mem.write_u64(hart_ix, addr, self.0)
    }

    fn data(&self) -> u64 {
        self.0
    }

    pte_flags!();

    fn ppn(&self) -> u64 {
        extract_field(self.0, 53, 10)
    }

    fn ppn_component(&self, i: usize) -> u64 {
        match i {
            0 => extract_field(self.0, 18, 10),
            1 => extract_field(self.0, 27, 19),
            2 => extract_field(self.0, 36, 28),
            3 => extract_field(self.0, 53, 37),
            _ => unreachable!("sv48 has four ppn components"),
        }
    }

    fn pa_ppn_shift(i: usize) -> u32 {
        match i {
            0 => 12,
            1 => 21,
            2 => 30,
            3 => 39,
            _ => unreachable!("sv48 has four ppn components"),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_sv32_fields() {
        // ppn1 = 0xfff, ppn0 = 0x3, D A G U X W R V set
        let pte = Pte32(0xfff0_0cdf);
        assert!(pte.valid() && pte.read() && pte.write() && pte.exec());
        assert!(pte.user() && pte.global() && pte.accessed() && pte.dirty());
        assert_eq!(pte.ppn_component(0), 0x3);
        assert_eq!(pte.ppn_component(1), 0xfff);
        assert_eq!(pte.ppn(), 0xfff << 10 | 0x3);
    }

    #[test]
    fn check_sv39_fields() {
        let pte = Pte39((0x5 << 28) | (0x1ff << 19) | (0x21 << 10) | 0x01);
        assert!(pte.valid());
        assert!(!pte.read() && !pte.write() && !pte.exec());
        assert_eq!(pte.ppn_component(0), 0x21);
        assert_eq!(pte.ppn_component(1), 0x1ff);
        assert_eq!(pte.ppn_component(2), 0x5);
        assert_eq!(pte.ppn(), (0x5 << 18) | (0x1ff << 9) | 0x21);
    }

    #[test]
    fn check_sv48_fields() {
        let pte = Pte48((0x1ffff_u64 << 37) | (0x7 << 28) | 0xcf);
        assert_eq!(pte.ppn_component(3), 0x1ffff);
        assert_eq!(pte.ppn_component(2), 0x7);
        assert_eq!(pte.ppn_component(1), 0);
        assert!(pte.accessed() && pte.dirty());
        // Reserved bits above 53 do not leak into the ppn
        let pte = Pte48(0xffc0_0000_0000_0000);
        assert_eq!(pte.ppn(), 0);
    }

    #[test]
    fn check_accessed_dirty_update() {
        let mut pte = Pte32(0x0000_0c0f);
        assert!(!pte.accessed() && !pte.dirty());
        pte.set_accessed();
        pte.set_dirty();
        assert!(pte.accessed() && pte.dirty());
        assert_eq!(pte.0, 0x0000_0ccf);
    }
}
