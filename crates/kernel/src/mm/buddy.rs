/// Buddy allocator for physical page runs
///
/// Allocates and frees power-of-two page runs from the zone selected by
/// the allocation flags. Free runs at order k are linked through their
/// head pfn on the owning zone's free list; the buddy of a run at pfn p
/// is at `p ^ (1 << k)`.

use crate::error::{KernelError, Result};
use super::page::{FrameOwner, FrameState, PageFlags, Pfn};
use super::zone::{FrameTable, Zone, ZoneKind, MAX_ORDER};

bitflags::bitflags! {
    /// Allocation request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Caller cannot block; may dip below the low watermark
        const ATOMIC = 1 << 0;
        /// Must come from the DMA zone
        const DMA = 1 << 1;
        /// Prefer the high-memory zone
        const HIGHMEM = 1 << 2;
        /// Prefer the movable zone
        const MOVABLE = 1 << 3;
        /// Zero the run before returning it
        const ZERO = 1 << 4;
    }
}

impl AllocFlags {
    /// Zone fallback chain for this request.
    fn zone_chain(self) -> &'static [ZoneKind] {
        if self.contains(AllocFlags::DMA) {
            &[ZoneKind::Dma]
        } else if self.contains(AllocFlags::MOVABLE) {
            &[ZoneKind::Movable, ZoneKind::HighMem, ZoneKind::Normal, ZoneKind::Dma]
        } else if self.contains(AllocFlags::HIGHMEM) {
            &[ZoneKind::HighMem, ZoneKind::Normal, ZoneKind::Dma]
        } else {
            &[ZoneKind::Normal, ZoneKind::Dma]
        }
    }
}

impl FrameTable {
    /// Allocate a single page.
    pub fn alloc_page(&self, flags: AllocFlags) -> Result<Pfn> {
        self.alloc_pages(0, flags)
    }

    /// Allocate a run of 2^order contiguous pages.
    pub fn alloc_pages(&self, order: u8, flags: AllocFlags) -> Result<Pfn> {
        if order > MAX_ORDER {
            return Err(KernelError::BadOrder);
        }

        let atomic = flags.contains(AllocFlags::ATOMIC);
        let mut last_err = KernelError::NoMemory;
        for kind in flags.zone_chain() {
            for zone in self.zones().iter().filter(|z| z.kind == *kind) {
                match self.zone_alloc(zone, order, atomic) {
                    Ok(pfn) => {
                        if flags.contains(AllocFlags::ZERO) {
                            for p in pfn..pfn + (1 << order) {
                                self.zero_page(p);
                            }
                        }
                        log::trace!(
                            "buddy: allocated {} pages at pfn {} from {:?}",
                            1usize << order,
                            pfn,
                            zone.kind
                        );
                        return Ok(pfn);
                    }
                    Err(e) => last_err = e,
                }
            }
        }

        log::debug!("buddy: allocation failed for order {} ({:?})", order, last_err);
        Err(last_err)
    }

    fn zone_alloc(&self, zone: &Zone, order: u8, atomic: bool) -> Result<Pfn> {
        let run = 1usize << order;
        let mut lists = zone.lists.lock();

        if lists.free_pages < run {
            return Err(KernelError::NoMemory);
        }
        // Atomic requests may dip below `low` but never below `min`;
        // normal requests stop at `low` so the reserve stays intact.
        let free_after = lists.free_pages - run;
        if atomic {
            if free_after < zone.watermarks.min {
                return Err(KernelError::AtomicStarved);
            }
        } else if free_after < zone.watermarks.low {
            return Err(KernelError::NoMemory);
        }

        // Smallest available order >= requested
        let mut current = order;
        while current <= MAX_ORDER {
            if !lists.free_lists[current as usize].is_empty() {
                break;
            }
            current += 1;
        }
        if current > MAX_ORDER {
            return Err(KernelError::NoMemory);
        }

        let Some(pfn) = lists.free_lists[current as usize].pop() else {
            return Err(KernelError::NoMemory);
        };

        // Split larger runs, re-inserting the upper halves
        while current > order {
            current -= 1;
            let upper = pfn + (1 << current);
            if let Some(frame) = self.frame(upper) {
                frame.update(|info| {
                    info.order = current;
                    info.flags.insert(PageFlags::BUDDY);
                });
            }
            lists.free_lists[current as usize].push(upper);
        }

        for p in pfn..pfn + run {
            if let Some(frame) = self.frame(p) {
                frame.update(|info| {
                    info.state = FrameState::Allocated;
                    info.flags.remove(PageFlags::BUDDY);
                });
            }
        }
        if let Some(head) = self.frame(pfn) {
            head.update(|info| info.order = order);
            head.set_refcount(1);
        }

        lists.free_pages -= run;
        Ok(pfn)
    }

    /// Free a single page.
    pub fn free_page(&self, pfn: Pfn) {
        self.free_pages(pfn, 0);
    }

    /// Return a run of 2^order pages to its zone, coalescing with its
    /// buddy while the buddy is also a free run of the same order.
    ///
    /// The run is only returned once the head frame's reference count
    /// drops to zero; shared frames stay allocated for the other holders.
    pub fn free_pages(&self, pfn: Pfn, order: u8) {
        let head = match self.frame(pfn) {
            Some(frame) => frame,
            None => {
                log::error!("buddy: free of pfn {} outside the frame table", pfn);
                return;
            }
        };

        let info = head.info();
        if info.state == FrameState::Free {
            // Unrecoverable: the free-list metadata cannot be trusted anymore.
            log::error!("buddy: double free of pfn {} (order {})", pfn, order);
            panic!("buddy free-list corruption");
        }
        if head.put() > 0 {
            return;
        }

        let zone = match self.zone_of(pfn) {
            Some(zone) => zone,
            None => {
                log::error!("buddy: free of reserved pfn {}", pfn);
                return;
            }
        };

        let run = 1usize << order;
        for p in pfn..pfn + run {
            if let Some(frame) = self.frame(p) {
                frame.update(|info| {
                    info.state = FrameState::Free;
                    info.order = 0;
                    info.flags = PageFlags::empty();
                    info.owner = FrameOwner::None;
                });
            }
        }

        let mut lists = zone.lists.lock();
        let mut pfn = pfn;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = pfn ^ (1usize << order);
            if !zone.contains(buddy) {
                break;
            }
            let mergeable = self
                .frame(buddy)
                .map(|frame| {
                    let info = frame.info();
                    info.state == FrameState::Free
                        && info.flags.contains(PageFlags::BUDDY)
                        && info.order == order
                })
                .unwrap_or(false);
            if !mergeable {
                break;
            }
            let list = &mut lists.free_lists[order as usize];
            match list.iter().position(|&p| p == buddy) {
                Some(pos) => {
                    list.swap_remove(pos);
                }
                None => {
                    log::error!("buddy: pfn {} marked free but missing from order {}", buddy, order);
                    panic!("buddy free-list corruption");
                }
            }
            if let Some(frame) = self.frame(buddy) {
                frame.update(|info| info.flags.remove(PageFlags::BUDDY));
            }
            pfn = pfn.min(buddy);
            order += 1;
        }

        if let Some(frame) = self.frame(pfn) {
            frame.update(|info| {
                info.order = order;
                info.flags.insert(PageFlags::BUDDY);
            });
        }
        lists.free_lists[order as usize].push(pfn);
        lists.free_pages += run;

        log::trace!("buddy: freed {} pages, head now pfn {} order {}", run, pfn, order);
    }

    /// Check the buddy free-list invariant: every free run at order k is
    /// aligned to 2^k and its buddy is not also free at the same order
    /// (otherwise the pair should have been coalesced).
    pub fn verify_buddy(&self) -> bool {
        for zone in self.zones() {
            let lists = zone.lists.lock();
            for (order, list) in lists.free_lists.iter().enumerate() {
                for &pfn in list {
                    if pfn % (1usize << order) != 0 {
                        return false;
                    }
                    if order as u8 >= MAX_ORDER {
                        continue;
                    }
                    let buddy = pfn ^ (1usize << order);
                    if zone.contains(buddy) && lists.free_lists[order].contains(&buddy) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemRange;
    use crate::mm::zone::WatermarkRatios;
    use alloc::vec;
    use alloc::vec::Vec;

    fn table(pages: usize) -> FrameTable {
        FrameTable::new(
            &[MemRange {
                base: 0,
                pages,
                kind: ZoneKind::Normal,
                node: 0,
            }],
            WatermarkRatios::default(),
        )
        .unwrap()
    }

    #[test]
    fn alloc_free_restores_counts() {
        let t = table(64);
        let before = t.free_pages_total();
        let pfn = t.alloc_pages(2, AllocFlags::empty()).unwrap();
        assert_eq!(t.free_pages_total(), before - 4);
        t.free_pages(pfn, 2);
        assert_eq!(t.free_pages_total(), before);
        assert!(t.verify_buddy());
        assert!(t.verify_zone_accounting());
    }

    #[test]
    fn split_and_coalesce() {
        let t = table(16);
        // 16 pages seed as a single order-4 run; an order-0 alloc splits it
        let a = t.alloc_page(AllocFlags::empty()).unwrap();
        let b = t.alloc_page(AllocFlags::empty()).unwrap();
        assert_ne!(a, b);
        t.free_page(a);
        t.free_page(b);
        // After freeing both, everything coalesces back to one run
        assert!(t.verify_buddy());
        assert_eq!(t.free_pages_total(), 16);
    }

    #[test]
    fn order_out_of_range() {
        let t = table(16);
        assert_eq!(
            t.alloc_pages(MAX_ORDER + 1, AllocFlags::empty()).unwrap_err(),
            KernelError::BadOrder
        );
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let t = table(16);
        let mut held = Vec::new();
        while let Ok(pfn) = t.alloc_page(AllocFlags::empty()) {
            held.push(pfn);
        }
        assert_eq!(t.alloc_page(AllocFlags::empty()).unwrap_err(), KernelError::NoMemory);
        for pfn in held {
            t.free_page(pfn);
        }
        assert_eq!(t.free_pages_total(), 16);
    }

    #[test]
    fn atomic_dips_below_low_watermark() {
        // 512 pages -> min watermark = 2 pages, low = 4 pages
        let t = table(512);
        let mut held = Vec::new();
        // Drain down to the low watermark with normal allocations
        while t.free_pages_total() > 4 {
            held.push(t.alloc_page(AllocFlags::empty()).unwrap());
        }
        assert_eq!(
            t.alloc_page(AllocFlags::empty()).unwrap_err(),
            KernelError::NoMemory
        );
        // Atomic requests may dip further, down to min
        let a = t.alloc_page(AllocFlags::ATOMIC).unwrap();
        let b = t.alloc_page(AllocFlags::ATOMIC).unwrap();
        assert_eq!(
            t.alloc_page(AllocFlags::ATOMIC).unwrap_err(),
            KernelError::AtomicStarved
        );
        t.free_page(a);
        t.free_page(b);
        for pfn in held {
            t.free_page(pfn);
        }
        assert_eq!(t.free_pages_total(), 512);
    }

    #[test]
    fn dma_requests_honor_zone() {
        let ranges = vec![
            MemRange {
                base: 0,
                pages: 16,
                kind: ZoneKind::Dma,
                node: 0,
            },
            MemRange {
                base: 16 * 4096,
                pages: 64,
                kind: ZoneKind::Normal,
                node: 0,
            },
        ];
        let t = FrameTable::new(&ranges, WatermarkRatios::default()).unwrap();
        let pfn = t.alloc_page(AllocFlags::DMA).unwrap();
        assert!(pfn < 16);
        // Normal requests prefer the normal zone
        let pfn2 = t.alloc_page(AllocFlags::empty()).unwrap();
        assert!(pfn2 >= 16);
        t.free_page(pfn);
        t.free_page(pfn2);
    }
}
