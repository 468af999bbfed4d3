//! Virtual memory translation
//!
//! Implements the Sv32, Sv39 and Sv48 virtual-address translation
//! protocol from section 4.3.2 of the RISC-V privileged specification
//! (version 20211203): a multi-level page-table walk with permission
//! checking, superpage alignment checking, accessed/dirty bookkeeping
//! and a TLB in front of it.
//!
//! One [`VirtMem`] exists per hart. The processor model pushes the
//! relevant satp/mstatus state into it (translation mode, root page
//! number, ASID, the MXR and SUM bits) and then calls
//! [`VirtMem::translate`] for every fetch, load and store. Page
//! tables live in physical memory and are accessed through the
//! [`Bus`] trait, so the walker itself holds no reference to the
//! memory system.
//!
//! A failed translation reports a page fault chosen by the kind of
//! access that was requested, never by the step of the walk that
//! failed; this matches the trap causes the privileged specification
//! assigns to translation.

use thiserror::Error;

use crate::memory::Bus;

use self::pte::{Pte, Pte32, Pte39, Pte48};
use self::tlb::{Tlb, TlbEntry};
use self::va::{Va, Va32, Va39, Va48};

pub mod pte;
pub mod tlb;
pub mod va;

/// Address translation modes, with their satp.MODE encodings
///
/// Sv57 and Sv64 are recognised encodings but translation for them is
/// not implemented; [`VirtMem::set_mode`] rejects them.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Bare = 0,
    Sv32 = 1,
    Sv39 = 8,
    Sv48 = 9,
    Sv57 = 10,
    Sv64 = 11,
}

/// Privilege level of the hart issuing an access
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

/// Page faults that a translation can raise
///
/// The variant is chosen by the access kind (fetch, load or store)
/// that requested the translation.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionCause {
    #[error("instruction page fault")]
    InstPageFault,
    #[error("load page fault")]
    LoadPageFault,
    #[error("store/AMO page fault")]
    StorePageFault,
}

impl ExceptionCause {
    /// The RISC-V exception code, as written to mcause
    pub fn cause(&self) -> u32 {
        match self {
            Self::InstPageFault => 12,
            Self::LoadPageFault => 13,
            Self::StorePageFault => 15,
        }
    }
}

/// The page fault for the given access kind
fn page_fault_type(read: bool, write: bool, exec: bool) -> ExceptionCause {
    if exec {
        return ExceptionCause::InstPageFault;
    }
    if read {
        return ExceptionCause::LoadPageFault;
    }
    debug_assert!(write);
    ExceptionCause::StorePageFault
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VirtMemError {
    #[error("page size {0} is not a power of two of at least 64")]
    InvalidPageSize(u64),
    #[error("page size {0} is not valid for the current translation mode")]
    UnsupportedPageSize(u64),
    #[error("translation mode {0:?} is not supported")]
    UnsupportedMode(Mode),
}

/// Per-hart virtual memory translator
///
/// Holds the translation configuration (mode, page-table root, ASID,
/// cached mstatus bits) and the hart's TLB.
#[derive(Debug)]
pub struct VirtMem {
    hart_ix: usize,
    page_table_root: u64,
    mode: Mode,
    asid: u32,
    page_size: u64,
    page_bits: u32,
    page_mask: u64,
    /// Cached mstatus.MXR: make executable pages readable
    exec_readable: bool,
    /// Cached mstatus.SUM: permit supervisor access to user pages
    supervisor_ok: bool,
    /// Fault instead of hardware-updating the A/D bits
    fault_on_first_access: bool,
    tlb: Tlb,
}

impl VirtMem {
    pub fn new(hart_ix: usize, page_size: u64, tlb_size: usize) -> Result<Self, VirtMemError> {
        if page_size < 64 || !page_size.is_power_of_two() {
            return Err(VirtMemError::InvalidPageSize(page_size));
        }
        Ok(Self {
            hart_ix,
            page_table_root: 0,
            mode: Mode::Bare,
            asid: 0,
            page_size,
            page_bits: page_size.trailing_zeros(),
            page_mask: page_size - 1,
            exec_readable: false,
            supervisor_ok: false,
            fault_on_first_access: false,
            tlb: Tlb::new(tlb_size),
        })
    }

    /// Set the translation mode. Flushes the TLB.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), VirtMemError> {
        match mode {
            Mode::Sv57 | Mode::Sv64 => Err(VirtMemError::UnsupportedMode(mode)),
            _ => {
                self.mode = mode;
                self.tlb.flush();
                Ok(())
            }
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Set the physical page number of the root page table (the PPN
    /// field of satp). Flushes the TLB, as a satp write does.
    pub fn set_page_table_root(&mut self, root: u64) {
        self.page_table_root = root;
        self.tlb.flush();
    }

    /// Set the address space id. Does not flush: TLB entries are
    /// tagged with their ASID precisely so a context switch can avoid
    /// the flush.
    pub fn set_address_space(&mut self, asid: u32) {
        self.asid = asid;
    }

    /// Set the cached mstatus.MXR bit
    pub fn set_exec_readable(&mut self, flag: bool) {
        self.exec_readable = flag;
    }

    /// Set the cached mstatus.SUM bit
    pub fn set_supervisor_access_user(&mut self, flag: bool) {
        self.supervisor_ok = flag;
    }

    /// Select between faulting on a clear accessed/dirty bit and
    /// hardware-updating it (the Svade/Svadu choice)
    pub fn set_fault_on_first_access(&mut self, flag: bool) {
        self.fault_on_first_access = flag;
    }

    /// Invalidate TLB entries; the operands mirror SFENCE.VMA
    pub fn sfence_vma(&mut self, vpn: Option<u64>, asid: Option<u32>) {
        self.tlb.invalidate(vpn, asid);
    }

    /// Drop every TLB entry
    pub fn flush_tlb(&mut self) {
        self.tlb.flush();
    }

    /// Set the page size
    ///
    /// The size must be a power of two of at least 64, and one the
    /// current translation mode supports: 4 KiB for Sv32; 4 KiB,
    /// 2 MiB or 1 GiB for Sv39; those or 512 GiB for Sv48. Bare mode
    /// accepts any power of two. Flushes the TLB, since cached page
    /// numbers are relative to the page size.
    pub fn set_page_size(&mut self, size: u64) -> Result<(), VirtMemError> {
        if size < 64 || !size.is_power_of_two() {
            return Err(VirtMemError::InvalidPageSize(size));
        }

        const K4: u64 = 4096;
        const M2: u64 = 2 * 1024 * 1024;
        const G1: u64 = 1024 * 1024 * 1024;
        const G512: u64 = 512 * G1;

        let ok = match self.mode {
            Mode::Bare => true,
            Mode::Sv32 => size == K4,
            Mode::Sv39 => matches!(size, K4 | M2 | G1),
            Mode::Sv48 => matches!(size, K4 | M2 | G1 | G512),
            Mode::Sv57 | Mode::Sv64 => false,
        };
        if !ok {
            return Err(VirtMemError::UnsupportedPageSize(size));
        }

        self.page_bits = size.trailing_zeros();
        self.page_size = size;
        self.page_mask = size - 1;
        self.tlb.flush();
        Ok(())
    }

    /// Translate a virtual address to a physical address
    ///
    /// Exactly one of read/write/exec must be true, naming the kind
    /// of access being performed. On failure the returned page fault
    /// is determined by that access kind alone.
    ///
    /// A TLB hit and a fresh walk of the same mapping produce the
    /// same physical address and the same fault classification; they
    /// differ only in that a hit updates the A/D bits on the cached
    /// entry without touching the in-memory page table entry.
    pub fn translate<M: Bus>(
        &mut self,
        va: u64,
        priv_mode: PrivilegeMode,
        read: bool,
        write: bool,
        exec: bool,
        mem: &mut M,
    ) -> Result<u64, ExceptionCause> {
        debug_assert_eq!(
            u32::from(read) + u32::from(write) + u32::from(exec),
            1,
            "exactly one access kind per translation"
        );

        if self.mode == Mode::Bare {
            return Ok(va);
        }

        let pf = page_fault_type(read, write, exec);

        // Look up the virtual page number in the TLB
        let vpn = va >> self.page_bits;
        if let Some(entry) = self.tlb.find(vpn, self.asid) {
            if priv_mode == PrivilegeMode::User && !entry.user {
                return Err(pf);
            }
            if priv_mode == PrivilegeMode::Supervisor && entry.user && !self.supervisor_ok {
                return Err(pf);
            }
            let entry_read = entry.read || (self.exec_readable && entry.exec);
            if (read && !entry_read) || (write && !entry.write) || (exec && !entry.exec) {
                return Err(pf);
            }
            if !entry.accessed || (write && !entry.dirty) {
                if self.fault_on_first_access {
                    return Err(pf);
                }
                entry.accessed = true;
                if write {
                    entry.dirty = true;
                }
            }
            return Ok((entry.phys_page_num << self.page_bits) | (va & self.page_mask));
        }

        // Miss: walk the page tables and cache the result
        let (pa, entry) = match self.mode {
            Mode::Sv32 => self.page_table_walk::<Pte32, Va32, M>(va, priv_mode, read, write, exec, mem)?,
            Mode::Sv39 => {
                // Bits 63:39 must equal bit 38 (sign extension of the
                // 39-bit virtual address)
                let ext = if (va >> 38) & 1 != 0 { 0x1ff_ffff } else { 0 };
                if (va >> 39) != ext {
                    return Err(pf);
                }
                self.page_table_walk::<Pte39, Va39, M>(va, priv_mode, read, write, exec, mem)?
            }
            Mode::Sv48 => {
                // Bits 63:48 must equal bit 47
                let ext = if (va >> 47) & 1 != 0 { 0xffff } else { 0 };
                if (va >> 48) != ext {
                    return Err(pf);
                }
                self.page_table_walk::<Pte48, Va48, M>(va, priv_mode, read, write, exec, mem)?
            }
            Mode::Bare | Mode::Sv57 | Mode::Sv64 => {
                unreachable!("bare handled above; sv57/sv64 rejected by set_mode")
            }
        };
        self.tlb.insert(entry);
        Ok(pa)
    }

    /// Walk the page tables for one virtual address
    ///
    /// This is the loop of section 4.3.2, generic over the entry and
    /// address formats of the three translation modes. On success it
    /// returns the physical address and the TLB entry describing the
    /// mapping, for the caller to install.
    fn page_table_walk<P: Pte, V: Va, M: Bus>(
        &self,
        address: u64,
        priv_mode: PrivilegeMode,
        read: bool,
        write: bool,
        exec: bool,
        mem: &mut M,
    ) -> Result<(u64, TlbEntry), ExceptionCause> {
        let pf = page_fault_type(read, write, exec);
        let va = V::new(address);

        // "a" in the privileged-spec algorithm: the table under
        // inspection, starting at the root
        let mut table = self.page_table_root.wrapping_mul(self.page_size);
        let mut level = P::LEVELS - 1;

        let (mut pte, pte_addr) = loop {
            let pte_addr = table.wrapping_add(va.vpn(level).wrapping_mul(P::SIZE));

            // A PMP check on pte_addr belongs here when physical
            // memory protection is modelled.
            let pte = P::fetch(&*mem, pte_addr).ok_or(pf)?;

            if !pte.valid() || (!pte.read() && pte.write()) {
                // Invalid, or the reserved R=0,W=1 encoding
                return Err(pf);
            }

            if !pte.read() && !pte.exec() {
                // Pointer to the next level of the tree
                if level == 0 {
                    return Err(pf);
                }
                level -= 1;
                table = pte.ppn().wrapping_mul(self.page_size);
                continue;
            }

            break (pte, pte_addr);
        };

        // Leaf entry: check permissions
        if priv_mode == PrivilegeMode::User && !pte.user() {
            return Err(pf);
        }
        if priv_mode == PrivilegeMode::Supervisor && pte.user() && !self.supervisor_ok {
            return Err(pf);
        }
        let pte_read = pte.read() || (self.exec_readable && pte.exec());
        if (read && !pte_read) || (write && !pte.write()) || (exec && !pte.exec()) {
            return Err(pf);
        }

        // A superpage leaf must be aligned: the ppn components below
        // its level must be zero
        for j in 0..level {
            if pte.ppn_component(j) != 0 {
                return Err(pf);
            }
        }

        // Accessed/dirty update: fault, or hardware-update and write
        // the entry back
        if !pte.accessed() || (write && !pte.dirty()) {
            if self.fault_on_first_access {
                return Err(pf);
            }
            pte.set_accessed();
            if write {
                pte.set_dirty();
            }
            // A PMP check on pte_addr belongs here as well.
            if !pte.write_back(mem, self.hart_ix, pte_addr) {
                return Err(pf);
            }
        }

        // Compose the physical address. For a superpage the vpn
        // components below the leaf level pass through from the
        // virtual address.
        let mut pa = va.offset();
        for j in 0..level {
            pa |= va.vpn(j) << P::pa_ppn_shift(j);
        }
        for j in level..P::LEVELS {
            pa |= pte.ppn_component(j) << P::pa_ppn_shift(j);
        }

        let entry = TlbEntry {
            virt_page_num: address >> self.page_bits,
            phys_page_num: pa >> self.page_bits,
            time: 0,
            asid: self.asid,
            valid: true,
            global: pte.global(),
            user: pte.user(),
            read: pte.read(),
            write: pte.write(),
            exec: pte.exec(),
            accessed: pte.accessed(),
            dirty: pte.dirty(),
        };

        Ok((pa, entry))
    }
}
