//! Virtual addresses
//!
//! Field decodings of Sv32, Sv39 and Sv48 virtual addresses: a 12-bit
//! page offset followed by 10-bit (Sv32) or 9-bit (Sv39/Sv48) virtual
//! page number components, one per page-table level.

use crate::utils::extract_field;

/// Decoded view of a virtual address
///
/// `vpn(i)` is only defined for `i < LEVELS`.
pub trait Va {
    /// Number of vpn components (same as the page-table level count)
    const LEVELS: usize;

    fn new(addr: u64) -> Self;

    /// The 12-bit page offset
    fn offset(&self) -> u64;

    /// Virtual page number component i
    fn vpn(&self, i: usize) -> u64;
}

/// Sv32 virtual address: two 10-bit vpn components
#[derive(Debug, Clone, Copy)]
pub struct Va32(u32);

impl Va for Va32 {
    const LEVELS: usize = 2;

    fn new(addr: u64) -> Self {
        // An sv32 virtual address is 32 bits
        Self(addr as u32)
    }

    fn offset(&self) -> u64 {
        extract_field(self.0, 11, 0).into()
    }

    fn vpn(&self, i: usize) -> u64 {
        match i {
            0 => extract_field(self.0, 21, 12).into(),
            1 => extract_field(self.0, 31, 22).into(),
            _ => unreachable!("sv32 has two vpn components"),
        }
    }
}

/// Sv39 virtual address: three 9-bit vpn components
#[derive(Debug, Clone, Copy)]
pub struct Va39(u64);

impl Va for Va39 {
    const LEVELS: usize = 3;

    fn new(addr: u64) -> Self {
        Self(addr)
    }

    fn offset(&self) -> u64 {
        extract_field(self.0, 11, 0)
    }

    fn vpn(&self, i: usize) -> u64 {
        match i {
            0 => extract_field(self.0, 20, 12),
            1 => extract_field(self.0, 29, 21),
            2 => extract_field(self.0, 38, 30),
            _ => unreachable!("sv39 has three vpn components"),
        }
    }
}

/// Sv48 virtual address: four 9-bit vpn components
#[derive(Debug, Clone, Copy)]
pub struct Va48(u64);

impl Va for Va48 {
    const LEVELS: usize = 4;

    fn new(addr: u64) -> Self {
        Self(addr)
    }

    fn offset(&self) -> u64 {
        extract_field(self.0, 11, 0)
    }

    fn vpn(&self, i: usize) -> u64 {
        match i {
            0 => extract_field(self.0, 20, 12),
            1 => extract_field(self.0, 29, 21),
            2 => extract_field(self.0, 38, 30),
            3 => extract_field(self.0, 47, 39),
            _ => unreachable!("sv48 has four vpn components"),
        }
    }
}
