/// Memory management subsystem
///
/// Composition of the tiered physical allocator (zoned frames, buddy,
/// slab), the per-process virtual memory manager and the demand-paging
/// path (fault handling, replacement, swap). `MemorySystem` owns the
/// shared state and orchestrates the pieces; the per-module types hold
/// the mechanics.

pub mod address_space;
pub mod buddy;
pub mod fault;
pub mod page;
pub mod pagetable;
pub mod reclaim;
pub mod slab;
pub mod swap;
pub mod zone;

pub use address_space::{
    AddressSpace, Backing, MapFlags, Prot, Region, RegionFlags, RssClass, VmCounters,
    USER_HEAP_START, USER_MMAP_BASE, USER_SPACE_END, USER_STACK_SIZE, USER_STACK_TOP,
};
pub use buddy::AllocFlags;
pub use fault::{FaultError, FaultKind};
pub use page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, FrameOwner, FrameState, PageFlags, Pfn,
    PhysAddr, PAGE_SHIFT, PAGE_SIZE,
};
pub use pagetable::{PageTable, Pte, PteFlags};
pub use reclaim::{ReclaimState, ReplacementPolicy};
pub use slab::{ObjectCtor, SlabCache, SlabStats, MAX_OBJECT_SIZE};
pub use swap::{SwapTable, MAX_SWAP_FILES};
pub use zone::{AllocStats, FrameTable, WatermarkRatios, Zone, ZoneKind, MAX_ORDER};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use address_space::ZappedPage;

/// How many pages a reclaim pass targets.
const RECLAIM_GENTLE: usize = 4;
const RECLAIM_AGGRESSIVE: usize = 16;

/// Paging statistics counters.
#[derive(Default)]
pub(crate) struct PagingCounters {
    minor_faults: AtomicU64,
    major_faults: AtomicU64,
    cow_faults: AtomicU64,
    cow_copies: AtomicU64,
    swap_ins: AtomicU64,
    swap_outs: AtomicU64,
    pages_reclaimed: AtomicU64,
}

impl PagingCounters {
    pub fn minor_fault(&self) {
        self.minor_faults.fetch_add(1, Ordering::Relaxed);
    }
    pub fn major_fault(&self) {
        self.major_faults.fetch_add(1, Ordering::Relaxed);
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }
    pub fn cow_fault(&self) {
        self.cow_faults.fetch_add(1, Ordering::Relaxed);
    }
    pub fn cow_copy(&self) {
        self.cow_copies.fetch_add(1, Ordering::Relaxed);
    }
    pub fn swap_out(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }
    pub fn page_reclaimed(&self) {
        self.pages_reclaimed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Paging statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingStats {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub cow_faults: u64,
    pub cow_copies: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub pages_reclaimed: u64,
}

/// The memory subsystem.
pub struct MemorySystem {
    pub(crate) frames: Arc<FrameTable>,
    pub(crate) swap: SwapTable,
    pub(crate) reclaim: Mutex<ReclaimState>,
    pub(crate) stats: PagingCounters,
    caches: Mutex<Vec<Arc<SlabCache>>>,
    next_cache_id: AtomicU32,
    cpus: usize,
    magazine_limit: usize,
    reclaim_low_percent: usize,
    reclaim_high_percent: usize,
}

impl MemorySystem {
    pub fn new(config: &KernelConfig) -> Result<Self> {
        let frames = Arc::new(FrameTable::new(&config.mem, config.watermarks)?);
        let swap = SwapTable::new(&config.swap_files)?;
        Ok(Self {
            frames,
            swap,
            reclaim: Mutex::new(ReclaimState::new(config.repl_policy)),
            stats: PagingCounters::default(),
            caches: Mutex::new(Vec::new()),
            next_cache_id: AtomicU32::new(1),
            cpus: config.cpus.max(1),
            magazine_limit: config.magazine_limit,
            reclaim_low_percent: config.reclaim_low_percent,
            reclaim_high_percent: config.reclaim_high_percent,
        })
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn swap_table(&self) -> &SwapTable {
        &self.swap
    }

    pub fn stats(&self) -> PagingStats {
        PagingStats {
            minor_faults: self.stats.minor_faults.load(Ordering::Relaxed),
            major_faults: self.stats.major_faults.load(Ordering::Relaxed),
            cow_faults: self.stats.cow_faults.load(Ordering::Relaxed),
            cow_copies: self.stats.cow_copies.load(Ordering::Relaxed),
            swap_ins: self.stats.swap_ins.load(Ordering::Relaxed),
            swap_outs: self.stats.swap_outs.load(Ordering::Relaxed),
            pages_reclaimed: self.stats.pages_reclaimed.load(Ordering::Relaxed),
        }
    }

    pub fn set_replacement_policy(&self, policy: ReplacementPolicy) {
        self.reclaim.lock().set_policy(policy);
    }

    // ---- slab caches ----

    pub fn cache_create(
        &self,
        name: &str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
    ) -> Result<Arc<SlabCache>> {
        let id = self.next_cache_id.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::new(SlabCache::new(
            self.frames.clone(),
            id,
            name,
            size,
            align,
            self.cpus,
            self.magazine_limit,
            ctor,
        )?);
        self.caches.lock().push(cache.clone());
        Ok(cache)
    }

    pub fn caches(&self) -> Vec<Arc<SlabCache>> {
        self.caches.lock().clone()
    }

    // ---- address spaces ----

    /// Allocate a fresh address space with its page-table root frame.
    pub fn create_aspace(&self) -> Result<Arc<AddressSpace>> {
        let root = self.frames.alloc_page(AllocFlags::ZERO)?;
        if let Some(frame) = self.frames.frame(root) {
            frame.update(|info| info.owner = FrameOwner::Kernel);
        }
        Ok(Arc::new(AddressSpace::new(root)))
    }

    /// Tear down every mapping and release the table root. Called when
    /// the last task reference drops.
    pub fn release_aspace(&self, aspace: &Arc<AddressSpace>) {
        if let Ok(zapped) = aspace.remove_range(0, USER_SPACE_END) {
            self.release_zapped(aspace.id, &zapped);
        }
        self.reclaim.lock().remove_aspace(aspace.id);
        self.frames.free_page(aspace.root_pfn());
        log::debug!("mm: released address space {}", aspace.id);
    }

    /// Map a region. FIXED requests implicitly unmap what was there.
    pub fn mmap(
        &self,
        aspace: &Arc<AddressSpace>,
        addr: u64,
        len: u64,
        prot: Prot,
        flags: MapFlags,
        backing: Backing,
    ) -> Result<u64> {
        if flags.contains(MapFlags::FIXED) && len > 0 && page::is_page_aligned(addr) {
            let zapped = aspace.remove_range(addr, len)?;
            self.release_zapped(aspace.id, &zapped);
        }
        aspace.map_region(addr, len, prot, flags, backing)
    }

    pub fn munmap(&self, aspace: &Arc<AddressSpace>, addr: u64, len: u64) -> Result<()> {
        let zapped = aspace.remove_range(addr, len)?;
        self.release_zapped(aspace.id, &zapped);
        Ok(())
    }

    pub fn mprotect(&self, aspace: &Arc<AddressSpace>, addr: u64, len: u64, prot: Prot) -> Result<()> {
        aspace.protect_range(addr, len, prot)
    }

    pub fn brk(&self, aspace: &Arc<AddressSpace>, new_brk: u64) -> Result<u64> {
        let (brk, zapped) = aspace.brk(new_brk)?;
        self.release_zapped(aspace.id, &zapped);
        Ok(brk)
    }

    fn release_zapped(&self, aspace_id: u64, zapped: &[ZappedPage]) {
        for z in zapped {
            if z.pte.is_present() {
                self.reclaim.lock().remove(aspace_id, z.vaddr);
                self.frames.free_page(z.pte.pfn());
            } else if z.pte.is_swap() {
                let (file, slot) = z.pte.swap_entry();
                if let Err(e) = self.swap.free_slot(file, slot) {
                    log::warn!("mm: stale swap entry ({}, {}): {}", file, slot, e);
                }
            }
        }
    }

    // ---- fork support ----

    /// Clone an address space for fork. Writable private regions become
    /// COW on both sides and their present translations lose write
    /// permission; swapped-out pages are duplicated into fresh slots so
    /// each side keeps a private copy.
    pub fn clone_aspace(&self, parent: &Arc<AddressSpace>) -> Result<Arc<AddressSpace>> {
        let child = self.create_aspace()?;
        let mut tracked = Vec::new();

        let result = (|| -> Result<()> {
            let mut p = parent.inner.write();
            let mut c = child.inner.write();
            c.brk_start = p.brk_start;
            c.brk = p.brk;
            c.mmap_base = p.mmap_base;
            c.stack_top = p.stack_top;
            c.vm = p.vm;

            for (start, region) in p.regions.iter_mut() {
                let mut cloned = *region;
                if region.prot.contains(Prot::WRITE)
                    && !region.flags.contains(RegionFlags::SHARED)
                {
                    region.flags |= RegionFlags::COW;
                    cloned.flags |= RegionFlags::COW;
                }
                c.regions.insert(*start, cloned);
            }

            let entries: Vec<(u64, Pte)> = p.pt.iter().collect();
            for (va, pte) in entries {
                if pte.is_present() {
                    let cow = {
                        let region = c.find_region(va);
                        region
                            .map(|r| r.flags.contains(RegionFlags::COW))
                            .unwrap_or(false)
                    };
                    let mut shared_pte = pte;
                    if cow {
                        shared_pte.remove_flags(PteFlags::WRITE);
                        shared_pte.insert_flags(PteFlags::COW);
                        p.pt.set(va, shared_pte);
                    }
                    c.pt.set(va, shared_pte);
                    if let Some(frame) = self.frames.frame(pte.pfn()) {
                        frame.get();
                    }
                    tracked.push((va, pte.pfn()));
                } else if pte.is_swap() {
                    let (file, slot) = pte.swap_entry();
                    let (new_file, new_slot) = self.swap.alloc_slot()?;
                    let mut buf = [0u8; PAGE_SIZE];
                    self.swap.read_slot(file, slot, &mut buf)?;
                    self.swap.write_slot(new_file, new_slot, &buf)?;
                    c.pt.set(va, Pte::new_swap(new_file, new_slot));
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            self.release_aspace(&child);
            return Err(e);
        }

        let mut rec = self.reclaim.lock();
        for (va, pfn) in tracked {
            rec.insert(reclaim::ReplFrame {
                pfn,
                vaddr: va,
                aspace: Arc::downgrade(&child),
                aspace_id: child.id,
                last_access: 0,
                access_count: 0,
                referenced: false,
            });
        }
        drop(rec);

        log::debug!("mm: cloned address space {} -> {}", parent.id, child.id);
        Ok(child)
    }

    // ---- user memory access (the MMU of the simulation) ----

    /// Copy between `buf` and user memory at `addr`, faulting pages in
    /// on demand exactly as the trap path would.
    pub fn access_user(
        &self,
        aspace: &Arc<AddressSpace>,
        addr: u64,
        buf: &mut [u8],
        write: bool,
        now: u64,
    ) -> Result<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let va = addr
                .checked_add(offset as u64)
                .ok_or(KernelError::Segv)?;
            let page_va = page_align_down(va);
            let in_page = (page_va + PAGE_SIZE as u64 - va) as usize;
            let chunk = in_page.min(buf.len() - offset);

            self.ensure_mapped(aspace, va, write, now)?;

            let pte = aspace.pte(page_va).ok_or(KernelError::Segv)?;
            let pa = pfn_to_pa(pte.pfn()) + (va - page_va);
            if write {
                self.frames.write_phys(pa, &buf[offset..offset + chunk]);
                aspace.update_pte(page_va, |p| {
                    p.insert_flags(PteFlags::DIRTY | PteFlags::ACCESSED)
                });
            } else {
                self.frames.read_phys(pa, &mut buf[offset..offset + chunk]);
                aspace.update_pte(page_va, |p| p.insert_flags(PteFlags::ACCESSED));
            }
            self.reclaim.lock().mark_access(aspace.id, page_va, now);
            offset += chunk;
        }
        Ok(())
    }

    pub fn write_user(
        &self,
        aspace: &Arc<AddressSpace>,
        addr: u64,
        data: &[u8],
        now: u64,
    ) -> Result<()> {
        let mut buf = data.to_vec();
        self.access_user(aspace, addr, &mut buf, true, now)
    }

    pub fn read_user(
        &self,
        aspace: &Arc<AddressSpace>,
        addr: u64,
        buf: &mut [u8],
        now: u64,
    ) -> Result<()> {
        self.access_user(aspace, addr, buf, false, now)
    }

    /// Fault the page at `va` in (and make it writable if needed).
    fn ensure_mapped(
        &self,
        aspace: &Arc<AddressSpace>,
        va: u64,
        write: bool,
        now: u64,
    ) -> Result<()> {
        for _ in 0..3 {
            let pte = aspace.pte(va);
            match pte {
                Some(p) if p.is_present() && (!write || p.is_writable()) => return Ok(()),
                Some(p) if p.is_present() => {
                    // Present but not writable: protection or COW fault
                    let err = FaultError::PRESENT | FaultError::WRITE | FaultError::USER;
                    self.handle_fault(aspace, va, err, now)?;
                }
                _ => {
                    let mut err = FaultError::USER;
                    if write {
                        err |= FaultError::WRITE;
                    }
                    self.handle_fault(aspace, va, err, now)?;
                }
            }
        }
        Err(KernelError::Segv)
    }

    // ---- reclaim ----

    /// Allocate one user frame, reclaiming under pressure.
    pub(crate) fn alloc_user_frame(&self, now: u64) -> Result<Pfn> {
        self.maybe_reclaim(now);
        let flags = AllocFlags::HIGHMEM | AllocFlags::ZERO;
        let pfn = match self.frames.alloc_page(flags) {
            Ok(pfn) => pfn,
            Err(_) => {
                self.reclaim_pages(now, RECLAIM_AGGRESSIVE);
                self.frames.alloc_page(flags)?
            }
        };
        if let Some(frame) = self.frames.frame(pfn) {
            frame.update(|info| info.owner = FrameOwner::User);
        }
        Ok(pfn)
    }

    /// Run reclaim if free memory has fallen under the thresholds.
    pub fn maybe_reclaim(&self, now: u64) {
        let free = self.frames.free_percent();
        if free <= self.reclaim_high_percent {
            self.reclaim_pages(now, RECLAIM_AGGRESSIVE);
        } else if free <= self.reclaim_low_percent {
            self.reclaim_pages(now, RECLAIM_GENTLE);
        }
    }

    /// Evict up to `target` pages; returns how many went out.
    pub fn reclaim_pages(&self, now: u64, target: usize) -> usize {
        let mut evicted = 0;
        while evicted < target {
            match self.evict_one(now) {
                Ok(true) => evicted += 1,
                Ok(false) => break,
                Err(e) => {
                    log::warn!("mm: reclaim stopped: {}", e);
                    break;
                }
            }
        }
        if evicted > 0 {
            log::debug!("mm: reclaimed {} page(s)", evicted);
        }
        evicted
    }

    /// Evict one victim: dirty pages go to a swap slot, clean pages are
    /// dropped. Shared (COW) frames are not candidates.
    fn evict_one(&self, _now: u64) -> Result<bool> {
        loop {
            let entry = {
                let mut rec = self.reclaim.lock();
                // Keep the inactive list populated with demoted frames
                while rec.inactive_len() < rec.active_len() {
                    if !rec.age_one() {
                        break;
                    }
                }
                let frames = &self.frames;
                rec.pick_victim(&|e| {
                    frames
                        .frame(e.pfn)
                        .map(|f| f.refcount() == 1)
                        .unwrap_or(false)
                })
            };
            let Some(entry) = entry else {
                return Ok(false);
            };
            let Some(aspace) = entry.aspace.upgrade() else {
                continue;
            };
            let Some(pte) = aspace.pte(entry.vaddr) else {
                continue;
            };
            if !pte.is_present() || pte.pfn() != entry.pfn {
                continue;
            }

            let class = aspace
                .find_region(entry.vaddr)
                .map(|r| r.rss_class())
                .unwrap_or(RssClass::Anon);

            if pte.flags().contains(PteFlags::DIRTY) {
                let (file, slot) = match self.swap.alloc_slot() {
                    Ok(x) => x,
                    Err(e) => {
                        self.reclaim.lock().insert(entry);
                        return Err(e);
                    }
                };
                if let Some(frame) = self.frames.frame(entry.pfn) {
                    frame.update(|info| info.state = FrameState::Swapped);
                }
                let mut buf = [0u8; PAGE_SIZE];
                self.frames.read_page(entry.pfn, &mut buf);
                if let Err(e) = self.swap.write_slot(file, slot, &buf) {
                    let _ = self.swap.free_slot(file, slot);
                    self.reclaim.lock().insert(entry);
                    return Err(e);
                }
                aspace.set_pte(entry.vaddr, Pte::new_swap(file, slot));
                self.stats.swap_out();
                log::trace!(
                    "mm: swapped out {:#x} (pfn {}) to ({}, {})",
                    entry.vaddr,
                    entry.pfn,
                    file,
                    slot
                );
            } else {
                aspace.clear_pte(entry.vaddr);
                log::trace!("mm: dropped clean page {:#x} (pfn {})", entry.vaddr, entry.pfn);
            }

            aspace.rss_sub(class, 1);
            self.frames.free_page(entry.pfn);
            self.stats.page_reclaimed();
            return Ok(true);
        }
    }

    /// Check that every swap PTE of `aspace` references an allocated slot.
    pub fn verify_swap_ptes(&self, aspace: &AddressSpace) -> bool {
        let inner = aspace.inner.read();
        for (_, pte) in inner.pt.iter() {
            if pte.is_swap() {
                let (file, slot) = pte.swap_entry();
                if !self.swap.is_allocated(file, slot) {
                    return false;
                }
            }
        }
        true
    }

    /// Human-readable one-line summary, for diagnostics.
    pub fn summary(&self) -> String {
        let alloc = self.frames.alloc_stats();
        let stats = self.stats();
        alloc::format!(
            "mem: {}/{} pages free, faults {}/{} (minor/major), cow {}, swap {}/{} (in/out)",
            alloc.free_pages,
            alloc.total_pages,
            stats.minor_faults,
            stats.major_faults,
            stats.cow_copies,
            stats.swap_ins,
            stats.swap_outs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn mem(pages: usize, swap_pages: usize) -> MemorySystem {
        MemorySystem::new(&KernelConfig::compact(pages, swap_pages)).unwrap()
    }

    #[test]
    fn minor_fault_maps_zero_page() {
        let m = mem(32, 0);
        let asp = m.create_aspace().unwrap();
        m.mmap(
            &asp,
            0x40_0000,
            4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        let mut buf = [0xffu8; 4];
        m.read_user(&asp, 0x40_0000, &mut buf, 1).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        assert_eq!(m.stats().minor_faults, 1);
        assert_eq!(asp.counters().anon_rss, 1);
    }

    #[test]
    fn unmapped_access_is_segv() {
        let m = mem(32, 0);
        let asp = m.create_aspace().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            m.read_user(&asp, 0x1234_5000, &mut buf, 1).unwrap_err(),
            KernelError::Segv
        );
    }

    #[test]
    fn write_to_readonly_is_segv() {
        let m = mem(32, 0);
        let asp = m.create_aspace().unwrap();
        m.mmap(
            &asp,
            0x40_0000,
            4096,
            Prot::READ,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        assert_eq!(
            m.write_user(&asp, 0x40_0000, &[1], 1).unwrap_err(),
            KernelError::Segv
        );
    }

    #[test]
    fn cow_clone_preserves_content() {
        let m = mem(64, 16);
        let parent = m.create_aspace().unwrap();
        m.mmap(
            &parent,
            0x40_0000,
            4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        m.write_user(&parent, 0x40_0000, &[0xaa], 1).unwrap();

        let child = m.clone_aspace(&parent).unwrap();
        let mut buf = [0u8; 1];
        m.read_user(&child, 0x40_0000, &mut buf, 2).unwrap();
        assert_eq!(buf[0], 0xaa);

        m.write_user(&parent, 0x40_0000, &[0xbb], 3).unwrap();
        m.read_user(&child, 0x40_0000, &mut buf, 4).unwrap();
        assert_eq!(buf[0], 0xaa);
        m.read_user(&parent, 0x40_0000, &mut buf, 5).unwrap();
        assert_eq!(buf[0], 0xbb);
        assert_eq!(m.stats().cow_copies, 1);

        m.release_aspace(&child);
        m.release_aspace(&parent);
    }

    #[test]
    fn munmap_releases_frames() {
        let m = mem(32, 0);
        let asp = m.create_aspace().unwrap();
        let free_before = m.frames.free_pages_total();
        m.mmap(
            &asp,
            0x40_0000,
            2 * 4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        m.write_user(&asp, 0x40_0000, &[1], 1).unwrap();
        m.write_user(&asp, 0x40_1000, &[2], 2).unwrap();
        m.munmap(&asp, 0x40_0000, 2 * 4096).unwrap();
        assert_eq!(m.frames.free_pages_total(), free_before);
        assert_eq!(asp.counters().rss(), 0);
    }

    #[test]
    fn swap_round_trip_under_pressure() {
        // Room for the table root plus four user frames
        let m = mem(5, 16);
        let asp = m.create_aspace().unwrap();
        m.mmap(
            &asp,
            0x40_0000,
            8 * 4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        for i in 0..8u64 {
            m.write_user(&asp, 0x40_0000 + i * 4096, &[i as u8 + 1], i)
                .unwrap();
        }
        let stats = m.stats();
        assert!(stats.swap_outs >= 4, "expected swap-outs, got {:?}", stats);
        // Every page still reads back its byte
        for i in 0..8u64 {
            let mut buf = [0u8; 1];
            m.read_user(&asp, 0x40_0000 + i * 4096, &mut buf, 100 + i).unwrap();
            assert_eq!(buf[0], i as u8 + 1);
        }
        assert!(m.verify_swap_ptes(&asp));
        m.release_aspace(&asp);
    }

    #[test]
    fn fork_duplicates_swap_slots() {
        // Tight enough that most pages get swapped out before the fork,
        // with headroom left for the child's faults afterwards.
        let m = mem(8, 32);
        let parent = m.create_aspace().unwrap();
        m.mmap(
            &parent,
            0x40_0000,
            8 * 4096,
            Prot::READ | Prot::WRITE,
            MapFlags::FIXED,
            Backing::Anon,
        )
        .unwrap();
        for i in 0..8u64 {
            m.write_user(&parent, 0x40_0000 + i * 4096, &[i as u8 + 1], i)
                .unwrap();
        }
        let slots_before = m.swap_table().free_slots_total();
        let child = m.clone_aspace(&parent).unwrap();
        // Swapped pages were duplicated, one fresh slot each
        assert!(m.swap_table().free_slots_total() < slots_before);
        assert!(m.verify_swap_ptes(&parent));
        assert!(m.verify_swap_ptes(&child));
        let mut buf = [0u8; 1];
        m.read_user(&child, 0x40_0000, &mut buf, 50).unwrap();
        assert_eq!(buf[0], 1);
        m.release_aspace(&child);
        m.release_aspace(&parent);
    }
}
