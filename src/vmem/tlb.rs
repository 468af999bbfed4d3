//! Translation lookaside buffer
//!
//! A functional model of a TLB: a fixed-capacity cache from
//! (virtual page number, address space id) to a completed translation.
//! Associativity and replacement hardware are not modelled; eviction
//! is least-recently-used by a per-entry timestamp, which makes the
//! contents deterministic for a fixed access trace.
//!
//! Each hart owns one TLB (inside its translator); TLBs are never
//! shared across harts.

/// Cached translation of one virtual page
///
/// The permission and A/D bits of the originating leaf page table
/// entry are kept so that a hit can replay the full permission check
/// without walking the tables again.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlbEntry {
    pub virt_page_num: u64,
    pub phys_page_num: u64,
    /// Timestamp of last use, for replacement
    pub time: u64,
    pub asid: u32,
    pub valid: bool,
    pub global: bool,
    pub user: bool,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub accessed: bool,
    pub dirty: bool,
}

#[derive(Debug)]
pub struct Tlb {
    entries: Vec<TlbEntry>,
    time: u64,
}

impl Tlb {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![TlbEntry::default(); size],
            time: 0,
        }
    }

    /// Find the valid entry matching the given virtual page number in
    /// the given address space. Global entries match every address
    /// space. Marks the entry used.
    pub fn find(&mut self, vpn: u64, asid: u32) -> Option<&mut TlbEntry> {
        self.time += 1;
        let time = self.time;
        self.entries
            .iter_mut()
            .find(|e| e.valid && e.virt_page_num == vpn && (e.asid == asid || e.global))
            .map(|e| {
                e.time = time;
                e
            })
    }

    /// Install a translation
    ///
    /// An existing entry for the same (vpn, asid) is replaced in
    /// place; otherwise a free slot is used, and when the table is
    /// full the least-recently-used entry is evicted.
    pub fn insert(&mut self, mut entry: TlbEntry) {
        if self.entries.is_empty() {
            return;
        }
        self.time += 1;
        entry.time = self.time;
        entry.valid = true;
        let slot = self
            .entries
            .iter()
            .position(|e| {
                e.valid && e.virt_page_num == entry.virt_page_num && e.asid == entry.asid
            })
            .or_else(|| self.entries.iter().position(|e| !e.valid))
            .unwrap_or_else(|| {
                // Evict: oldest timestamp, lowest index on a tie
                self.entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.time)
                    .map(|(ix, _)| ix)
                    .expect("table is non-empty, so a minimum exists")
            });
        self.entries[slot] = entry;
    }

    /// Invalidate entries, mirroring the SFENCE.VMA operand forms
    ///
    /// * `(None, None)`: drop everything
    /// * `(Some(vpn), None)`: drop that page in every address space
    /// * `(None, Some(asid))`: drop that address space, sparing
    ///   global entries
    /// * `(Some(vpn), Some(asid))`: drop that page in that address
    ///   space, sparing global entries
    pub fn invalidate(&mut self, vpn: Option<u64>, asid: Option<u32>) {
        for e in &mut self.entries {
            if !e.valid {
                continue;
            }
            let matches = match (vpn, asid) {
                (None, None) => true,
                (Some(v), None) => e.virt_page_num == v,
                (None, Some(a)) => e.asid == a && !e.global,
                (Some(v), Some(a)) => e.virt_page_num == v && e.asid == a && !e.global,
            };
            if matches {
                e.valid = false;
            }
        }
    }

    /// Drop every entry
    pub fn flush(&mut self) {
        for e in &mut self.entries {
            e.valid = false;
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn entry(vpn: u64, asid: u32) -> TlbEntry {
        TlbEntry {
            virt_page_num: vpn,
            phys_page_num: vpn + 100,
            asid,
            valid: true,
            ..TlbEntry::default()
        }
    }

    #[test]
    fn check_find_miss_on_empty() {
        let mut tlb = Tlb::new(4);
        assert!(tlb.find(1, 0).is_none());
    }

    #[test]
    fn check_insert_then_find() {
        let mut tlb = Tlb::new(4);
        tlb.insert(entry(7, 1));
        let found = tlb.find(7, 1).unwrap();
        assert_eq!(found.phys_page_num, 107);
        assert!(tlb.find(7, 2).is_none());
        assert!(tlb.find(8, 1).is_none());
    }

    #[test]
    fn check_global_entry_matches_any_asid() {
        let mut tlb = Tlb::new(4);
        let mut e = entry(7, 1);
        e.global = true;
        tlb.insert(e);
        assert!(tlb.find(7, 2).is_some());
    }

    #[test]
    fn check_reinsert_replaces_in_place() {
        let mut tlb = Tlb::new(2);
        tlb.insert(entry(7, 1));
        let mut e = entry(7, 1);
        e.phys_page_num = 999;
        tlb.insert(e);
        tlb.insert(entry(8, 1));
        // Both fit: the re-insert did not consume the second slot
        assert_eq!(tlb.find(7, 1).unwrap().phys_page_num, 999);
        assert!(tlb.find(8, 1).is_some());
    }

    #[test]
    fn check_lru_eviction() {
        let mut tlb = Tlb::new(2);
        tlb.insert(entry(1, 0));
        tlb.insert(entry(2, 0));
        // Touch 1 so that 2 becomes the eviction candidate
        assert!(tlb.find(1, 0).is_some());
        tlb.insert(entry(3, 0));
        assert!(tlb.find(1, 0).is_some());
        assert!(tlb.find(2, 0).is_none());
        assert!(tlb.find(3, 0).is_some());
    }

    #[test]
    fn check_invalidate_all() {
        let mut tlb = Tlb::new(4);
        tlb.insert(entry(1, 0));
        tlb.insert(entry(2, 1));
        tlb.invalidate(None, None);
        assert!(tlb.find(1, 0).is_none());
        assert!(tlb.find(2, 1).is_none());
    }

    #[test]
    fn check_invalidate_by_vpn() {
        let mut tlb = Tlb::new(4);
        tlb.insert(entry(1, 0));
        tlb.insert(entry(1, 5));
        tlb.insert(entry(2, 0));
        tlb.invalidate(Some(1), None);
        assert!(tlb.find(1, 0).is_none());
        assert!(tlb.find(1, 5).is_none());
        assert!(tlb.find(2, 0).is_some());
    }

    #[test]
    fn check_invalidate_by_asid_spares_global() {
        let mut tlb = Tlb::new(4);
        tlb.insert(entry(1, 5));
        let mut g = entry(2, 5);
        g.global = true;
        tlb.insert(g);
        tlb.insert(entry(3, 6));
        tlb.invalidate(None, Some(5));
        assert!(tlb.find(1, 5).is_none());
        assert!(tlb.find(2, 5).is_some());
        assert!(tlb.find(3, 6).is_some());
    }

    #[test]
    fn check_invalidate_by_vpn_and_asid() {
        let mut tlb = Tlb::new(4);
        tlb.insert(entry(1, 5));
        tlb.insert(entry(1, 6));
        tlb.invalidate(Some(1), Some(5));
        assert!(tlb.find(1, 5).is_none());
        assert!(tlb.find(1, 6).is_some());
    }

    #[test]
    fn check_zero_capacity_tlb() {
        let mut tlb = Tlb::new(0);
        tlb.insert(entry(1, 0));
        assert!(tlb.find(1, 0).is_none());
    }
}
