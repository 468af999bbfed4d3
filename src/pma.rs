//! Physical memory attributes
//!
//! Every physical address carries a set of attributes describing what
//! the hardware allows there: whether loads, stores and fetches are
//! legal, whether atomics are supported, whether the region is
//! idempotent (reads have no side effects), cacheable, or holds
//! memory-mapped registers, and whether it belongs to a closely
//! coupled memory (ICCM/DCCM).
//!
//! [`PmaManager`] keeps one attribute per page in a dense table.
//! Attributes are expected to be applied to a small number of large
//! regions, but can be set with word granularity: when a region update
//! does not cover a whole page, the page is fractured and its
//! attribute demoted to a per-word table. Lookup stays O(1) either
//! way.
//!
//! One manager serves the whole memory and is shared between harts.
//! None of the mutating operations take a lock; the simulator must
//! serialise attribute updates against concurrent lookups itself.

use std::collections::HashMap;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Attribute set for a physical memory region
    ///
    /// ICCM and DCCM are mutually exclusive within a single value. A
    /// memory-mapped register region is not expected to carry ATOMIC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PmaFlags: u16 {
        const EXEC = 0x1;
        const READ = 0x2;
        const WRITE = 0x4;
        const IDEMPOTENT = 0x8;
        const ATOMIC = 0x10;
        const ICCM = 0x20;
        const DCCM = 0x40;
        const MEM_MAPPED = 0x80;
        const CACHED = 0x100;
        const ALIGNED = 0x400;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const MAPPED = Self::EXEC.bits() | Self::READ.bits() | Self::WRITE.bits();
        const DEFAULT = Self::MAPPED.bits() | Self::IDEMPOTENT.bits() | Self::ATOMIC.bits();
    }
}

/// Physical memory attribute
///
/// An instance of this is usually associated with a memory page. For
/// sub-page attribution, an instance is associated with a word-aligned
/// memory word. The default value carries no attributes (unmapped).
///
/// Equality compares the attribute bits only; the word-granularity
/// marker is an internal routing hint of the manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pma {
    attrib: PmaFlags,
    word: bool, // true if word granularity, otherwise page
}

impl Pma {
    /// Make a page-granular attribute value
    ///
    /// Every attribute the manager stores is built here, so the
    /// ICCM/DCCM exclusivity check covers attributes however they
    /// were combined.
    pub fn new(attrib: PmaFlags) -> Self {
        debug_assert!(
            !attrib.contains(PmaFlags::ICCM | PmaFlags::DCCM),
            "iccm and dccm are mutually exclusive"
        );
        Self {
            attrib,
            word: false,
        }
    }

    /// The raw attribute bits
    pub fn attrib(&self) -> PmaFlags {
        self.attrib
    }

    /// Return true if mapped (any of exec/read/write allowed)
    pub fn is_mapped(&self) -> bool {
        self.attrib.intersects(PmaFlags::MAPPED)
    }

    /// Return true if in readable (load instructions allowed) region
    pub fn is_read(&self) -> bool {
        self.attrib.contains(PmaFlags::READ)
    }

    /// Return true if in writeable (store instructions allowed) region
    pub fn is_write(&self) -> bool {
        self.attrib.contains(PmaFlags::WRITE)
    }

    /// Return true if in executable (fetch allowed) region
    pub fn is_exec(&self) -> bool {
        self.attrib.contains(PmaFlags::EXEC)
    }

    /// Return true if in idempotent region
    pub fn is_idempotent(&self) -> bool {
        self.attrib.contains(PmaFlags::IDEMPOTENT)
    }

    /// Return true in region where atomic instructions are allowed
    pub fn is_atomic(&self) -> bool {
        self.attrib.contains(PmaFlags::ATOMIC)
    }

    /// Return true if in ICCM region (instruction closely coupled memory)
    pub fn is_iccm(&self) -> bool {
        self.attrib.contains(PmaFlags::ICCM)
    }

    /// Return true if in DCCM region (data closely coupled memory)
    pub fn is_dccm(&self) -> bool {
        self.attrib.contains(PmaFlags::DCCM)
    }

    /// Return true if in memory-mapped-register region
    pub fn is_mem_mapped_reg(&self) -> bool {
        self.attrib.contains(PmaFlags::MEM_MAPPED)
    }

    /// Return true if in cacheable region
    pub fn is_cached(&self) -> bool {
        self.attrib.contains(PmaFlags::CACHED)
    }

    /// Return true in region where accesses must be aligned
    pub fn is_aligned(&self) -> bool {
        self.attrib.contains(PmaFlags::ALIGNED)
    }
}

impl PartialEq for Pma {
    fn eq(&self, other: &Self) -> bool {
        self.attrib == other.attrib
    }
}

impl Eq for Pma {}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PmaError {
    #[error("page size {0} is not a non-zero power of two")]
    InvalidPageSize(u64),
}

/// Physical memory attribute manager
///
/// One per memory, shared between cores and harts. Attributes are kept
/// per page until a sub-page update fractures the page into per-word
/// entries. Also keeps the write masks of memory-mapped registers.
#[derive(Debug)]
pub struct PmaManager {
    page_pmas: Vec<Pma>,
    word_pmas: HashMap<u64, Pma>, // word index to pma, fractured pages only
    mem_mapped_masks: HashMap<u64, u32>, // word-aligned address to write mask
    mem_size: u64,
    page_size: u64,
    page_shift: u32,
}

impl PmaManager {
    pub fn new(memory_size: u64, page_size: u64) -> Result<Self, PmaError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(PmaError::InvalidPageSize(page_size));
        }
        let page_shift = page_size.trailing_zeros();
        let num_pages = (memory_size + page_size - 1) / page_size;
        Ok(Self {
            page_pmas: vec![Pma::default(); num_pages as usize],
            word_pmas: HashMap::new(),
            mem_mapped_masks: HashMap::new(),
            mem_size: memory_size,
            page_size,
            page_shift,
        })
    }

    fn page_ix(&self, addr: u64) -> u64 {
        addr >> self.page_shift
    }

    /// Return the attribute of the word-aligned word containing addr
    ///
    /// Returns the unmapped attribute if the address is outside the
    /// configured memory. For a fractured page, the per-word table is
    /// consulted instead of the page table.
    pub fn pma(&self, addr: u64) -> Pma {
        let ix = self.page_ix(addr);
        if ix >= self.page_pmas.len() as u64 {
            return Pma::default();
        }
        let pma = self.page_pmas[ix as usize];
        if pma.word {
            return self
                .word_pmas
                .get(&(addr >> 2))
                .copied()
                .unwrap_or_default();
        }
        pma
    }

    /// Enable the given attribute bits in all word-aligned words
    /// overlapping the region [addr0, addr1]
    pub fn enable(&mut self, addr0: u64, addr1: u64, attrib: PmaFlags) {
        self.update(addr0, addr1, false, |a| a | attrib);
    }

    /// Disable the given attribute bits in all word-aligned words
    /// overlapping the region [addr0, addr1]
    pub fn disable(&mut self, addr0: u64, addr1: u64, attrib: PmaFlags) {
        self.update(addr0, addr1, false, |a| a - attrib);
    }

    /// Replace the attribute of all word-aligned words overlapping the
    /// region [addr0, addr1]
    pub fn set_attribute(&mut self, addr0: u64, addr1: u64, attrib: PmaFlags) {
        self.update(addr0, addr1, true, |_| attrib);
    }

    /// Apply f to every word in the region, page-at-a-time
    ///
    /// A span that covers a whole page updates the page entry in place.
    /// When replace is set, a whole-page span also heals a previously
    /// fractured page back to a single page entry. Any partial span
    /// fractures its page first and updates the word entries.
    fn update<F>(&mut self, addr0: u64, addr1: u64, replace: bool, f: F)
    where
        F: Fn(PmaFlags) -> PmaFlags,
    {
        if self.mem_size == 0 {
            return;
        }
        let hi = addr1.min(self.mem_size - 1);
        let mut addr = addr0 & !3;
        while addr <= hi {
            let page_start = self.page_start_addr(addr);
            let page_end = page_start.saturating_add(self.page_size - 1);
            let ix = self.page_ix(addr) as usize;
            let covers_page = addr == page_start && hi >= page_end;
            if covers_page && (!self.page_pmas[ix].word || replace) {
                if self.page_pmas[ix].word {
                    // Heal: page becomes homogeneous again
                    let first_word = page_start >> 2;
                    for w in 0..self.page_size / 4 {
                        self.word_pmas.remove(&(first_word + w));
                    }
                }
                let attrib = f(self.page_pmas[ix].attrib);
                self.page_pmas[ix] = Pma::new(attrib);
            } else {
                self.fracture(addr);
                let last_word = (hi.min(page_end) & !3) >> 2;
                for w in (addr >> 2)..=last_word {
                    let entry = self.word_pmas.entry(w).or_default();
                    let attrib = f(entry.attrib);
                    *entry = Pma::new(attrib);
                }
            }
            addr = match page_end.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
    }

    /// Fracture the attribute of the page overlapping the given address
    /// into word attributes
    fn fracture(&mut self, addr: u64) {
        let ix = self.page_ix(addr) as usize;
        let pma = self.page_pmas[ix];
        if pma.word {
            return;
        }
        self.page_pmas[ix].word = true;

        let words = self.page_size / 4;
        let mut word_ix = self.page_start_addr(addr) >> 2;
        for _ in 0..words {
            self.word_pmas.insert(word_ix, Pma::new(pma.attrib));
            word_ix += 1;
        }
    }

    /// Return the start address of the page containing addr
    pub fn page_start_addr(&self, addr: u64) -> u64 {
        (addr >> self.page_shift) << self.page_shift
    }

    /// Associate a write mask with the word-aligned word at addr
    pub fn set_mem_mapped_mask(&mut self, addr: u64, mask: u32) {
        self.mem_mapped_masks.insert(addr & !3, mask);
    }

    /// Return the mask associated with the word-aligned word at addr,
    /// or 0xffff_ffff if no mask was ever associated with it
    pub fn mem_mapped_mask(&self, addr: u64) -> u32 {
        self.mem_mapped_masks
            .get(&(addr & !3))
            .copied()
            .unwrap_or(0xffff_ffff)
    }

    /// Reset (to zero) all memory-mapped registers in the given memory
    /// image. Masks are retained.
    pub fn reset_mem_mapped(&self, data: &mut [u8]) {
        for &addr in self.mem_mapped_masks.keys() {
            let addr = addr as usize;
            if let Some(word) = data.get_mut(addr..addr + 4) {
                word.fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn manager() -> PmaManager {
        // 16 pages of 4 KiB
        PmaManager::new(16 * 4096, 4096).unwrap()
    }

    #[test]
    fn check_rejects_bad_page_size() {
        assert_eq!(
            PmaManager::new(1 << 20, 0).err(),
            Some(PmaError::InvalidPageSize(0))
        );
        assert!(PmaManager::new(1 << 20, 3000).is_err());
        assert!(PmaManager::new(1 << 20, 4096).is_ok());
    }

    #[test]
    fn check_unconfigured_memory_is_unmapped() {
        let pmas = manager();
        assert!(!pmas.pma(0).is_mapped());
        assert_eq!(pmas.pma(0x3ffc), Pma::default());
    }

    #[test]
    fn check_out_of_range_is_unmapped() {
        let mut pmas = manager();
        pmas.set_attribute(0, 16 * 4096 - 1, PmaFlags::DEFAULT);
        assert!(pmas.pma(0x0).is_mapped());
        assert!(!pmas.pma(16 * 4096).is_mapped());
        assert!(!pmas.pma(u64::MAX).is_mapped());
    }

    #[test]
    fn check_whole_page_attributes() {
        let mut pmas = manager();
        pmas.set_attribute(0x1000, 0x2fff, PmaFlags::DEFAULT);
        assert!(!pmas.pma(0xffc).is_mapped());
        assert!(pmas.pma(0x1000).is_read());
        assert!(pmas.pma(0x1000).is_atomic());
        assert!(pmas.pma(0x2ffc).is_exec());
        assert!(!pmas.pma(0x3000).is_mapped());
    }

    #[test]
    fn check_mapped_tracks_exec_read_write() {
        let mut pmas = manager();
        pmas.set_attribute(0x0, 0xfff, PmaFlags::IDEMPOTENT | PmaFlags::ATOMIC);
        assert!(!pmas.pma(0x0).is_mapped());
        pmas.enable(0x0, 0xfff, PmaFlags::WRITE);
        assert!(pmas.pma(0x0).is_mapped());
    }

    /// Sub-page update: only the words inside the range change
    #[test]
    fn check_fracture_boundaries() {
        let mut pmas = manager();
        pmas.set_attribute(0x0000, 0x0fff, PmaFlags::DEFAULT);
        pmas.set_attribute(0x0100, 0x0103, PmaFlags::DEFAULT | PmaFlags::CACHED);
        assert!(pmas.pma(0x0100).is_cached());
        assert!(!pmas.pma(0x00fc).is_cached());
        assert!(!pmas.pma(0x0104).is_cached());
        // The rest of the page kept its attributes through the fracture
        assert!(pmas.pma(0x00fc).is_read());
        assert!(pmas.pma(0x0ffc).is_exec());
    }

    #[test]
    fn check_enable_disable_round_trip() {
        let mut pmas = manager();
        pmas.set_attribute(0x0000, 0x1fff, PmaFlags::DEFAULT);
        let before: Vec<Pma> = (0..0x2000).step_by(4).map(|a| pmas.pma(a)).collect();
        pmas.enable(0x0480, 0x05ff, PmaFlags::CACHED);
        assert!(pmas.pma(0x0480).is_cached());
        pmas.disable(0x0480, 0x05ff, PmaFlags::CACHED);
        let after: Vec<Pma> = (0..0x2000).step_by(4).map(|a| pmas.pma(a)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn check_enable_covering_fractured_page() {
        let mut pmas = manager();
        pmas.set_attribute(0x0000, 0x0fff, PmaFlags::READ_WRITE);
        pmas.enable(0x0010, 0x0013, PmaFlags::CACHED);
        // Whole-page enable must reach every word of the fractured page
        pmas.enable(0x0000, 0x0fff, PmaFlags::EXEC);
        assert!(pmas.pma(0x0010).is_exec());
        assert!(pmas.pma(0x0010).is_cached());
        assert!(pmas.pma(0x0ffc).is_exec());
        assert!(!pmas.pma(0x0ffc).is_cached());
    }

    /// A whole-page set_attribute heals a fractured page: the result is
    /// observationally identical to a page that was never fractured
    #[test]
    fn check_whole_page_set_heals_fracture() {
        let mut pmas = manager();
        pmas.set_attribute(0x0000, 0x0fff, PmaFlags::DEFAULT);
        pmas.set_attribute(0x0200, 0x02ff, PmaFlags::READ_WRITE);
        pmas.set_attribute(0x0000, 0x0fff, PmaFlags::DEFAULT);
        for addr in (0..0x1000).step_by(4) {
            assert_eq!(pmas.pma(addr), Pma::new(PmaFlags::DEFAULT));
        }
        // A later sub-page update still works on the healed page
        pmas.set_attribute(0x0f00, 0x0f03, PmaFlags::DEFAULT | PmaFlags::ALIGNED);
        assert!(pmas.pma(0x0f00).is_aligned());
        assert!(!pmas.pma(0x0efc).is_aligned());
    }

    #[test]
    fn check_misaligned_range_is_word_rounded() {
        let mut pmas = manager();
        // Range interior to one word: the whole word is attributed
        pmas.set_attribute(0x0101, 0x0102, PmaFlags::DEFAULT);
        assert!(pmas.pma(0x0100).is_mapped());
        assert!(!pmas.pma(0x0104).is_mapped());
    }

    #[test]
    fn check_page_start_addr() {
        let pmas = manager();
        assert_eq!(pmas.page_start_addr(0x0), 0x0);
        assert_eq!(pmas.page_start_addr(0x1234), 0x1000);
        assert_eq!(pmas.page_start_addr(0x1fff), 0x1000);
    }

    #[test]
    fn check_mem_mapped_masks() {
        let mut pmas = manager();
        assert_eq!(pmas.mem_mapped_mask(0x100), 0xffff_ffff);
        pmas.set_mem_mapped_mask(0x102, 0x0000_ffff);
        // Mask is keyed by the word-aligned address
        assert_eq!(pmas.mem_mapped_mask(0x100), 0x0000_ffff);
        assert_eq!(pmas.mem_mapped_mask(0x103), 0x0000_ffff);
        assert_eq!(pmas.mem_mapped_mask(0x104), 0xffff_ffff);
    }

    #[test]
    fn check_reset_mem_mapped() {
        let mut pmas = manager();
        pmas.set_mem_mapped_mask(0x100, 0x0000_ffff);
        let mut data = vec![0u8; 0x200];
        data[0x100..0x104].copy_from_slice(&0xdead_beef_u32.to_le_bytes());
        data[0x104] = 0x55;
        pmas.reset_mem_mapped(&mut data);
        assert_eq!(&data[0x100..0x104], &[0, 0, 0, 0]);
        // Neighbouring bytes and the mask itself are untouched
        assert_eq!(data[0x104], 0x55);
        assert_eq!(pmas.mem_mapped_mask(0x100), 0x0000_ffff);
    }

    #[test]
    fn check_reset_mem_mapped_ignores_out_of_buffer_masks() {
        let mut pmas = manager();
        pmas.set_mem_mapped_mask(0x1000, 0xff);
        let mut data = vec![0xaau8; 0x10];
        pmas.reset_mem_mapped(&mut data);
        assert!(data.iter().all(|&b| b == 0xaa));
    }
}
