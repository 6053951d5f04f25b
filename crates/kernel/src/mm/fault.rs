/// Page fault handling
///
/// Entry point for the page-fault trap. Resolves minor faults with a
/// zero-filled frame, major faults by reading the recorded swap slot
/// back in, and write faults on COW mappings by duplicating the shared
/// frame. Anything else is a protection violation.

use alloc::sync::Arc;

use crate::error::{KernelError, Result};
use super::address_space::{AddressSpace, Prot, Region};
use super::page::{page_align_down, FrameOwner, PAGE_SIZE};
use super::pagetable::{Pte, PteFlags};
use super::reclaim::ReplFrame;
use super::MemorySystem;

bitflags::bitflags! {
    /// Page-fault error code bits, as delivered by the trap
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultError: u32 {
        /// The faulting translation was present (protection fault)
        const PRESENT = 1 << 0;
        /// The access was a write
        const WRITE = 1 << 1;
        /// The access came from user mode
        const USER = 1 << 2;
        /// The access was an instruction fetch
        const INSTR = 1 << 3;
    }
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Zero-filled frame, no I/O
    Minor,
    /// Read back from a swap slot
    Major,
    /// Shared COW frame duplicated for the writer
    CowCopied,
    /// Sole owner of a COW frame; write re-enabled in place
    CowWriteEnabled,
    /// Translation already present when the handler looked (lost race)
    Spurious,
}

fn pte_flags_for(region: &Region) -> PteFlags {
    let mut flags = PteFlags::USER;
    if region.prot.contains(Prot::WRITE) {
        flags |= PteFlags::WRITE;
    }
    if region.prot.contains(Prot::EXEC) {
        flags |= PteFlags::EXEC;
    }
    flags
}

impl MemorySystem {
    /// Handle a page fault against `aspace` at `fault_addr`.
    ///
    /// Returns how the fault was resolved, or `Segv` when the address is
    /// not mapped or the access violates the region protection.
    pub fn handle_fault(
        &self,
        aspace: &Arc<AddressSpace>,
        fault_addr: u64,
        err: FaultError,
        now: u64,
    ) -> Result<FaultKind> {
        let region = aspace.find_region(fault_addr).ok_or_else(|| {
            log::debug!("fault: no region for {:#x}", fault_addr);
            KernelError::Segv
        })?;

        if err.contains(FaultError::WRITE) && !region.prot.contains(Prot::WRITE) {
            return Err(KernelError::Segv);
        }
        if err.contains(FaultError::INSTR) && !region.prot.contains(Prot::EXEC) {
            return Err(KernelError::Segv);
        }
        if !err.intersects(FaultError::WRITE | FaultError::INSTR)
            && !region.prot.contains(Prot::READ)
        {
            return Err(KernelError::Segv);
        }

        let page_va = page_align_down(fault_addr);
        let pte = aspace.pte(page_va);

        if !err.contains(FaultError::PRESENT) {
            return match pte {
                Some(p) if p.is_swap() => self.fault_in_from_swap(aspace, &region, page_va, p, now),
                Some(p) if p.is_present() => Ok(FaultKind::Spurious),
                _ => self.fault_in_zero(aspace, &region, page_va, now),
            };
        }

        // Present + write on a COW translation duplicates the page.
        if err.contains(FaultError::WRITE) {
            if let Some(p) = pte {
                if p.is_cow() {
                    return self.cow_duplicate(aspace, &region, page_va, p, now);
                }
                if p.is_present() && region.prot.contains(Prot::WRITE) {
                    // Stale read-only translation left over from an
                    // mprotect round trip; re-enable write in place.
                    aspace.update_pte(page_va, |q| {
                        q.insert_flags(PteFlags::WRITE | PteFlags::DIRTY | PteFlags::ACCESSED)
                    });
                    return Ok(FaultKind::Spurious);
                }
            }
        }

        log::debug!(
            "fault: protection violation at {:#x} (err {:?})",
            fault_addr,
            err
        );
        Err(KernelError::Segv)
    }

    /// Minor fault: map a zero-filled frame.
    fn fault_in_zero(
        &self,
        aspace: &Arc<AddressSpace>,
        region: &Region,
        page_va: u64,
        now: u64,
    ) -> Result<FaultKind> {
        let pfn = self.alloc_user_frame(now)?;
        aspace.set_pte(page_va, Pte::new_frame(pfn, pte_flags_for(region)));
        aspace.rss_add(region.rss_class(), 1);
        self.track_mapping(aspace, page_va, pfn, now);
        self.stats.minor_fault();
        log::trace!("fault: minor at {:#x} -> pfn {}", page_va, pfn);
        Ok(FaultKind::Minor)
    }

    /// Major fault: allocate a frame, read the slot back, free the slot.
    fn fault_in_from_swap(
        &self,
        aspace: &Arc<AddressSpace>,
        region: &Region,
        page_va: u64,
        pte: Pte,
        now: u64,
    ) -> Result<FaultKind> {
        let (file, slot) = pte.swap_entry();
        let pfn = self.alloc_user_frame(now)?;

        let mut buf = [0u8; PAGE_SIZE];
        if let Err(e) = self.swap.read_slot(file, slot, &mut buf) {
            self.frames.free_page(pfn);
            log::error!("fault: swap-in of ({}, {}) failed: {}", file, slot, e);
            return Err(e);
        }
        self.frames.write_page(pfn, &buf);
        self.swap.free_slot(file, slot)?;

        // The slot is gone, so the content is not reconstructible; the
        // mapping comes back dirty.
        let flags = pte_flags_for(region) | PteFlags::DIRTY | PteFlags::ACCESSED;
        aspace.set_pte(page_va, Pte::new_frame(pfn, flags));
        aspace.rss_add(region.rss_class(), 1);
        self.track_mapping(aspace, page_va, pfn, now);
        self.stats.major_fault();
        log::trace!(
            "fault: major at {:#x} <- swap ({}, {}) -> pfn {}",
            page_va,
            file,
            slot,
            pfn
        );
        Ok(FaultKind::Major)
    }

    /// COW duplication: copy the shared frame for the writing side, or
    /// re-enable write in place when the writer is the last holder.
    fn cow_duplicate(
        &self,
        aspace: &Arc<AddressSpace>,
        region: &Region,
        page_va: u64,
        pte: Pte,
        now: u64,
    ) -> Result<FaultKind> {
        let old_pfn = pte.pfn();
        let shared = self
            .frames
            .frame(old_pfn)
            .map(|f| f.refcount() > 1)
            .unwrap_or(false);

        if !shared {
            aspace.update_pte(page_va, |p| {
                p.insert_flags(PteFlags::WRITE | PteFlags::DIRTY | PteFlags::ACCESSED);
                p.remove_flags(PteFlags::COW);
            });
            self.stats.cow_fault();
            return Ok(FaultKind::CowWriteEnabled);
        }

        let new_pfn = self.alloc_user_frame(now)?;
        self.frames.copy_page(old_pfn, new_pfn);

        let mut flags = pte_flags_for(region) | PteFlags::WRITE;
        flags |= PteFlags::DIRTY | PteFlags::ACCESSED;
        aspace.set_pte(page_va, Pte::new_frame(new_pfn, flags));

        // Drop this mapping's reference on the shared frame.
        self.frames.free_page(old_pfn);
        self.reclaim.lock().update_pfn(aspace.id, page_va, new_pfn);
        self.stats.cow_fault();
        self.stats.cow_copy();
        log::trace!(
            "fault: cow copy at {:#x}: pfn {} -> {}",
            page_va,
            old_pfn,
            new_pfn
        );
        Ok(FaultKind::CowCopied)
    }

    fn track_mapping(&self, aspace: &Arc<AddressSpace>, page_va: u64, pfn: usize, now: u64) {
        if let Some(frame) = self.frames.frame(pfn) {
            frame.update(|info| info.owner = FrameOwner::User);
        }
        self.reclaim.lock().insert(ReplFrame {
            pfn,
            vaddr: page_va,
            aspace: Arc::downgrade(aspace),
            aspace_id: aspace.id,
            last_access: now,
            access_count: 1,
            referenced: true,
        });
    }
}
