/// Virtual address spaces
///
/// A process address space is an ordered, disjoint set of regions plus
/// the software page table. A one-slot cache remembers the last region
/// found so repeated faults in the same region skip the tree walk.
/// Region mutation takes the write side of the per-address-space lock;
/// lookups share the read side.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

use crate::error::{KernelError, Result};
use super::page::{is_page_aligned, page_align_down, page_align_up, Pfn, PAGE_SHIFT};
use super::pagetable::{PageTable, Pte, PteFlags};

/// User address space layout
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;
pub const USER_HEAP_START: u64 = 0x0000_5555_5600_0000;
pub const USER_MMAP_BASE: u64 = 0x0000_7000_0000_0000;
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

static NEXT_ASPACE_ID: AtomicU64 = AtomicU64::new(1);
const CACHE_EMPTY: u64 = u64::MAX;

bitflags::bitflags! {
    /// Region protection bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// mmap request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Map exactly at the given address, replacing what was there
        const FIXED = 1 << 0;
        /// Writes are visible to every mapper; never COW
        const SHARED = 1 << 1;
        /// Stack-style region
        const GROWSDOWN = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Region state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const SHARED = 1 << 0;
        const COW = 1 << 1;
        const GROWSDOWN = 1 << 2;
    }
}

/// What a region's pages come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled on first touch; swap-backed once written out
    Anon,
    /// File handle + byte offset (faults in as zero-fill here; the
    /// filesystem itself is outside the core)
    File { handle: u64, offset: u64 },
}

/// RSS bucket a mapped page counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RssClass {
    Anon,
    File,
    Shmem,
}

/// One contiguous mapping: [start, end), page aligned, start < end.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub prot: Prot,
    pub flags: RegionFlags,
    pub backing: Backing,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn pages(&self) -> usize {
        (self.len() >> PAGE_SHIFT) as usize
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn rss_class(&self) -> RssClass {
        if self.flags.contains(RegionFlags::SHARED) {
            match self.backing {
                Backing::File { .. } => RssClass::File,
                Backing::Anon => RssClass::Shmem,
            }
        } else {
            match self.backing {
                Backing::File { .. } => RssClass::File,
                Backing::Anon => RssClass::Anon,
            }
        }
    }
}

/// Address-space accounting, in pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmCounters {
    pub total_vm: usize,
    pub data_vm: usize,
    pub exec_vm: usize,
    pub stack_vm: usize,
    pub anon_rss: usize,
    pub file_rss: usize,
    pub shmem_rss: usize,
}

impl VmCounters {
    pub fn rss(&self) -> usize {
        self.anon_rss + self.file_rss + self.shmem_rss
    }

    fn rss_slot(&mut self, class: RssClass) -> &mut usize {
        match class {
            RssClass::Anon => &mut self.anon_rss,
            RssClass::File => &mut self.file_rss,
            RssClass::Shmem => &mut self.shmem_rss,
        }
    }
}

/// A page-table entry removed while tearing down part of a mapping.
/// The caller releases the frame or swap slot it still references.
#[derive(Debug)]
pub struct ZappedPage {
    pub vaddr: u64,
    pub pte: Pte,
    pub class: RssClass,
}

pub struct AspaceInner {
    pub regions: BTreeMap<u64, Region>,
    pub pt: PageTable,
    pub brk_start: u64,
    pub brk: u64,
    pub mmap_base: u64,
    pub stack_top: u64,
    pub vm: VmCounters,
}

/// One process's virtual mappings.
pub struct AddressSpace {
    pub id: u64,
    /// Start address of the last region found, or CACHE_EMPTY
    region_cache: AtomicU64,
    pub(crate) inner: RwLock<AspaceInner>,
}

impl AddressSpace {
    /// Create an empty address space over a pre-allocated table root.
    pub fn new(root_pfn: Pfn) -> Self {
        Self {
            id: NEXT_ASPACE_ID.fetch_add(1, Ordering::Relaxed),
            region_cache: AtomicU64::new(CACHE_EMPTY),
            inner: RwLock::new(AspaceInner {
                regions: BTreeMap::new(),
                pt: PageTable::new(root_pfn),
                brk_start: USER_HEAP_START,
                brk: USER_HEAP_START,
                mmap_base: USER_MMAP_BASE,
                stack_top: USER_STACK_TOP,
                vm: VmCounters::default(),
            }),
        }
    }

    pub fn root_pfn(&self) -> Pfn {
        self.inner.read().pt.root_pfn
    }

    pub fn counters(&self) -> VmCounters {
        self.inner.read().vm
    }

    fn invalidate_cache(&self) {
        self.region_cache.store(CACHE_EMPTY, Ordering::Release);
    }

    /// Find the region containing `addr`. `addr >= region.end` is a miss.
    pub fn find_region(&self, addr: u64) -> Option<Region> {
        let inner = self.inner.read();
        let cached = self.region_cache.load(Ordering::Acquire);
        if cached != CACHE_EMPTY {
            if let Some(region) = inner.regions.get(&cached) {
                if region.contains(addr) {
                    return Some(*region);
                }
            }
        }
        let region = inner.find_region(addr)?;
        self.region_cache.store(region.start, Ordering::Release);
        Some(*region)
    }

    /// Establish a new mapping. With FIXED the caller must already have
    /// cleared the target range; without it the first gap at or above
    /// `mmap_base` that fits is used.
    pub fn map_region(
        &self,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        backing: Backing,
    ) -> Result<u64> {
        if len == 0 {
            return Err(KernelError::Invalid);
        }
        let len = page_align_up(len);
        let mut inner = self.inner.write();

        let start = if flags.contains(MapFlags::FIXED) {
            if !is_page_aligned(addr) {
                return Err(KernelError::BadAlignment);
            }
            if addr == 0 || addr.checked_add(len).map_or(true, |end| end > USER_SPACE_END) {
                return Err(KernelError::Invalid);
            }
            addr
        } else if addr != 0
            && is_page_aligned(addr)
            && addr.checked_add(len).is_some_and(|end| end <= USER_SPACE_END)
            && !inner.overlaps(addr, addr + len)
        {
            addr
        } else {
            let base = inner.mmap_base;
            inner.find_gap(len, base)?
        };

        let mut region_flags = RegionFlags::empty();
        if flags.contains(MapFlags::SHARED) {
            region_flags |= RegionFlags::SHARED;
        }
        if flags.contains(MapFlags::GROWSDOWN) {
            region_flags |= RegionFlags::GROWSDOWN;
        }

        inner.insert_region(Region {
            start,
            end: start + len,
            prot,
            flags: region_flags,
            backing,
        })?;
        drop(inner);
        self.invalidate_cache();
        Ok(start)
    }

    /// Remove every mapping intersecting [addr, addr+len), trimming or
    /// splitting partially covered regions. Returns the zapped entries
    /// for the caller to release.
    pub fn remove_range(&self, addr: u64, len: u64) -> Result<Vec<ZappedPage>> {
        if len == 0 {
            return Err(KernelError::Invalid);
        }
        let start = page_align_down(addr);
        let end = page_align_up(addr.checked_add(len).ok_or(KernelError::Overflow)?);
        let mut inner = self.inner.write();
        let zapped = inner.remove_range(start, end);
        drop(inner);
        self.invalidate_cache();
        Ok(zapped)
    }

    /// Rewrite protection over [addr, addr+len), splitting regions at the
    /// boundaries. Present PTEs in the range are downgraded to match.
    pub fn protect_range(&self, addr: u64, len: u64, prot: Prot) -> Result<()> {
        if len == 0 {
            return Err(KernelError::Invalid);
        }
        if !is_page_aligned(addr) {
            return Err(KernelError::BadAlignment);
        }
        let end = page_align_up(addr + len);
        let mut inner = self.inner.write();
        inner.protect_range(addr, end, prot)?;
        drop(inner);
        self.invalidate_cache();
        Ok(())
    }

    /// Move the program break. Growth that would run into another region
    /// fails; shrinking returns the zapped tail for release.
    pub fn brk(&self, new_brk: u64) -> Result<(u64, Vec<ZappedPage>)> {
        let mut inner = self.inner.write();
        let result = inner.do_brk(new_brk);
        drop(inner);
        self.invalidate_cache();
        result
    }

    pub fn pte(&self, vaddr: u64) -> Option<Pte> {
        self.inner.read().pt.get(vaddr)
    }

    pub fn set_pte(&self, vaddr: u64, pte: Pte) {
        self.inner.write().pt.set(vaddr, pte);
    }

    pub fn clear_pte(&self, vaddr: u64) -> Option<Pte> {
        self.inner.write().pt.clear(vaddr)
    }

    pub fn update_pte(&self, vaddr: u64, f: impl FnOnce(&mut Pte)) -> bool {
        let mut inner = self.inner.write();
        match inner.pt.get(vaddr) {
            Some(mut pte) => {
                f(&mut pte);
                inner.pt.set(vaddr, pte);
                true
            }
            None => false,
        }
    }

    pub fn rss_add(&self, class: RssClass, pages: usize) {
        let mut inner = self.inner.write();
        *inner.vm.rss_slot(class) += pages;
    }

    pub fn rss_sub(&self, class: RssClass, pages: usize) {
        let mut inner = self.inner.write();
        let slot = inner.vm.rss_slot(class);
        *slot = slot.saturating_sub(pages);
    }

    /// Check region ordering/disjointness and cache coherence.
    pub fn verify(&self) -> bool {
        let inner = self.inner.read();
        let mut prev_end = 0;
        for (start, region) in &inner.regions {
            if *start != region.start
                || region.start >= region.end
                || !is_page_aligned(region.start)
                || !is_page_aligned(region.end)
                || region.start < prev_end
            {
                return false;
            }
            prev_end = region.end;
        }
        let cached = self.region_cache.load(Ordering::Acquire);
        cached == CACHE_EMPTY || inner.regions.contains_key(&cached)
    }
}

impl AspaceInner {
    pub fn find_region(&self, addr: u64) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr).next_back()?;
        region.contains(addr).then_some(region)
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        if let Some((_, region)) = self.regions.range(..end).next_back() {
            if region.end > start {
                return true;
            }
        }
        false
    }

    fn insert_region(&mut self, region: Region) -> Result<()> {
        if self.overlaps(region.start, region.end) {
            return Err(KernelError::Overlap);
        }
        self.regions.insert(region.start, region);
        self.recount();
        Ok(())
    }

    /// First gap of at least `len` bytes at or above `from`.
    fn find_gap(&self, len: u64, from: u64) -> Result<u64> {
        let mut addr = from;
        if let Some(covering) = self.find_region(addr) {
            addr = covering.end;
        }
        for (_, region) in self.regions.range(addr..) {
            if region.start.saturating_sub(addr) >= len {
                return Ok(addr);
            }
            addr = addr.max(region.end);
        }
        if USER_SPACE_END.saturating_sub(addr) >= len {
            Ok(addr)
        } else {
            Err(KernelError::NoMemory)
        }
    }

    /// Split the region containing `addr` at `addr`; no-op at boundaries.
    fn split_at(&mut self, addr: u64) {
        let key = match self.find_region(addr) {
            Some(region) if region.start < addr => region.start,
            _ => return,
        };
        if let Some(mut region) = self.regions.remove(&key) {
            let upper = Region {
                start: addr,
                ..region
            };
            region.end = addr;
            self.regions.insert(region.start, region);
            self.regions.insert(upper.start, upper);
        }
    }

    fn remove_range(&mut self, start: u64, end: u64) -> Vec<ZappedPage> {
        self.split_at(start);
        self.split_at(end);

        let doomed: Vec<u64> = self
            .regions
            .range(start..end)
            .map(|(key, _)| *key)
            .collect();

        let mut zapped = Vec::new();
        for key in doomed {
            if let Some(region) = self.regions.remove(&key) {
                let class = region.rss_class();
                let ptes: Vec<(u64, Pte)> = self.pt.range(region.start, region.end).collect();
                for (vaddr, pte) in ptes {
                    self.pt.clear(vaddr);
                    if pte.is_present() {
                        let slot = self.vm.rss_slot(class);
                        *slot = slot.saturating_sub(1);
                    }
                    zapped.push(ZappedPage { vaddr, pte, class });
                }
            }
        }
        self.recount();
        zapped
    }

    fn protect_range(&mut self, start: u64, end: u64, prot: Prot) -> Result<()> {
        // The whole range must be mapped
        let mut addr = start;
        while addr < end {
            let region = self.find_region(addr).ok_or(KernelError::NotMapped)?;
            addr = region.end;
        }

        self.split_at(start);
        self.split_at(end);
        let keys: Vec<u64> = self.regions.range(start..end).map(|(k, _)| *k).collect();
        for key in keys {
            if let Some(region) = self.regions.get_mut(&key) {
                region.prot = prot;
                let ptes: Vec<(u64, Pte)> = self.pt.range(key, end.min(region.end)).collect();
                for (vaddr, mut pte) in ptes {
                    if !pte.is_present() {
                        continue;
                    }
                    if !prot.contains(Prot::WRITE) {
                        pte.remove_flags(PteFlags::WRITE);
                    }
                    if prot.contains(Prot::EXEC) {
                        pte.insert_flags(PteFlags::EXEC);
                    } else {
                        pte.remove_flags(PteFlags::EXEC);
                    }
                    self.pt.set(vaddr, pte);
                }
            }
        }
        self.recount();
        Ok(())
    }

    fn do_brk(&mut self, new_brk: u64) -> Result<(u64, Vec<ZappedPage>)> {
        if new_brk < self.brk_start {
            return Err(KernelError::Invalid);
        }
        let old_end = page_align_up(self.brk);
        let new_end = page_align_up(new_brk);

        if new_end > old_end {
            if self.overlaps(old_end, new_end) {
                return Err(KernelError::NoMemory);
            }
            let grown = match self.regions.get_mut(&self.brk_start) {
                Some(region) if region.end == old_end => {
                    region.end = new_end;
                    true
                }
                _ => false,
            };
            if !grown {
                self.insert_region(Region {
                    start: self.brk_start,
                    end: new_end,
                    prot: Prot::READ | Prot::WRITE,
                    flags: RegionFlags::empty(),
                    backing: Backing::Anon,
                })?;
            }
            self.brk = new_brk;
            self.recount();
            return Ok((self.brk, Vec::new()));
        }

        let zapped = if new_end < old_end {
            self.remove_range(new_end, old_end)
        } else {
            Vec::new()
        };
        self.brk = new_brk;
        self.recount();
        Ok((self.brk, zapped))
    }

    fn recount(&mut self) {
        let mut total = 0;
        let mut data = 0;
        let mut exec = 0;
        let mut stack = 0;
        for region in self.regions.values() {
            let pages = region.pages();
            total += pages;
            if region.flags.contains(RegionFlags::GROWSDOWN) {
                stack += pages;
            } else if region.prot.contains(Prot::EXEC) {
                exec += pages;
            } else {
                data += pages;
            }
        }
        self.vm.total_vm = total;
        self.vm.data_vm = data;
        self.vm.exec_vm = exec;
        self.vm.stack_vm = stack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aspace() -> AddressSpace {
        AddressSpace::new(0)
    }

    fn anon_rw(asp: &AddressSpace, addr: u64, pages: u64) -> u64 {
        asp.map_region(
            addr,
            pages * 4096,
            Prot::READ | Prot::WRITE,
            if addr != 0 { MapFlags::FIXED } else { MapFlags::empty() },
            Backing::Anon,
        )
        .unwrap()
    }

    #[test]
    fn mmap_zero_len_fails() {
        let asp = aspace();
        assert_eq!(
            asp.map_region(0, 0, Prot::READ, MapFlags::empty(), Backing::Anon)
                .unwrap_err(),
            KernelError::Invalid
        );
    }

    #[test]
    fn fixed_unaligned_fails() {
        let asp = aspace();
        assert_eq!(
            asp.map_region(0x400001, 4096, Prot::READ, MapFlags::FIXED, Backing::Anon)
                .unwrap_err(),
            KernelError::BadAlignment
        );
    }

    #[test]
    fn non_fixed_uses_mmap_base_gap() {
        let asp = aspace();
        let a = anon_rw(&asp, 0, 4);
        let b = anon_rw(&asp, 0, 2);
        assert_eq!(a, USER_MMAP_BASE);
        assert_eq!(b, USER_MMAP_BASE + 4 * 4096);
        assert!(asp.verify());
    }

    #[test]
    fn mmap_munmap_round_trip() {
        let asp = aspace();
        let addr = anon_rw(&asp, 0x40_0000, 4);
        assert!(asp.find_region(addr + 4096).is_some());
        let zapped = asp.remove_range(addr, 4 * 4096).unwrap();
        assert!(zapped.is_empty());
        assert!(asp.find_region(addr).is_none());
        assert_eq!(asp.counters().total_vm, 0);
        assert!(asp.verify());
    }

    #[test]
    fn partial_munmap_splits() {
        let asp = aspace();
        let addr = anon_rw(&asp, 0x40_0000, 4);
        asp.remove_range(addr + 4096, 4096).unwrap();
        assert!(asp.find_region(addr).is_some());
        assert!(asp.find_region(addr + 4096).is_none());
        assert!(asp.find_region(addr + 2 * 4096).is_some());
        assert_eq!(asp.counters().total_vm, 3);
        assert!(asp.verify());
    }

    #[test]
    fn find_region_end_is_exclusive() {
        let asp = aspace();
        let addr = anon_rw(&asp, 0x40_0000, 1);
        assert!(asp.find_region(addr).is_some());
        assert!(asp.find_region(addr + 4095).is_some());
        assert!(asp.find_region(addr + 4096).is_none());
    }

    #[test]
    fn region_cache_tracks_lookups() {
        let asp = aspace();
        let addr = anon_rw(&asp, 0x40_0000, 2);
        let _ = asp.find_region(addr);
        let _ = asp.find_region(addr + 4096);
        assert!(asp.verify());
        asp.remove_range(addr, 2 * 4096).unwrap();
        assert!(asp.verify());
    }

    #[test]
    fn mprotect_splits_and_rewrites() {
        let asp = aspace();
        let addr = anon_rw(&asp, 0x40_0000, 3);
        asp.set_pte(addr + 4096, Pte::new_frame(7, PteFlags::USER | PteFlags::WRITE));
        asp.protect_range(addr + 4096, 4096, Prot::READ).unwrap();
        let middle = asp.find_region(addr + 4096).unwrap();
        assert_eq!(middle.prot, Prot::READ);
        assert_eq!(middle.len(), 4096);
        assert!(!asp.pte(addr + 4096).unwrap().is_writable());
        // Outer pieces keep their protection
        assert!(asp.find_region(addr).unwrap().prot.contains(Prot::WRITE));
        assert!(asp.verify());
    }

    #[test]
    fn mprotect_unmapped_fails() {
        let asp = aspace();
        assert_eq!(
            asp.protect_range(0x40_0000, 4096, Prot::READ).unwrap_err(),
            KernelError::NotMapped
        );
    }

    #[test]
    fn brk_grows_and_shrinks() {
        let asp = aspace();
        let (brk, _) = asp.brk(USER_HEAP_START + 3 * 4096).unwrap();
        assert_eq!(brk, USER_HEAP_START + 3 * 4096);
        assert_eq!(asp.counters().total_vm, 3);
        let (_, zapped) = asp.brk(USER_HEAP_START + 4096).unwrap();
        assert!(zapped.is_empty());
        assert_eq!(asp.counters().total_vm, 1);
        assert_eq!(
            asp.brk(USER_HEAP_START - 1).unwrap_err(),
            KernelError::Invalid
        );
    }

    #[test]
    fn counters_classify_regions() {
        let asp = aspace();
        anon_rw(&asp, 0x40_0000, 2);
        asp.map_region(
            0x50_0000,
            4096,
            Prot::READ | Prot::EXEC,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        asp.map_region(
            0x60_0000,
            2 * 4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED | MapFlags::GROWSDOWN,
            Backing::Anon,
        )
        .unwrap();
        let vm = asp.counters();
        assert_eq!(vm.total_vm, 5);
        assert_eq!(vm.data_vm, 2);
        assert_eq!(vm.exec_vm, 1);
        assert_eq!(vm.stack_vm, 2);
    }
}
