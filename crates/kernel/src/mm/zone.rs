/// Zoned page frame database
///
/// Gives every physical page a stable identity and a zone. Built once at
/// init from the memory map; pages outside the map are created Allocated
/// and owned by the kernel. Each frame carries its own 4 KiB of backing
/// storage so page content survives mapping, copying and swap traffic.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::MemRange;
use crate::error::{KernelError, Result};
use super::page::{
    Frame, FrameOwner, FrameState, PageFlags, Pfn, PhysAddr, PAGE_SHIFT, PAGE_SIZE, pa_to_pfn,
};

/// Maximum buddy order (2^10 pages = 4 MiB max run)
pub const MAX_ORDER: u8 = 10;

/// DMA zone upper bound (16 MiB)
pub const DMA_LIMIT_PFN: Pfn = (16 * 1024 * 1024) >> PAGE_SHIFT;

/// Zone kinds, in no particular order; allocation preference is decided
/// by the buddy allocator's fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Dma,
    Normal,
    HighMem,
    Movable,
}

/// Per-zone reclaim watermarks, in pages.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub min: usize,
    pub low: usize,
    pub high: usize,
}

/// Watermark ratios as divisors of the zone size (min, low, high).
#[derive(Debug, Clone, Copy)]
pub struct WatermarkRatios(pub usize, pub usize, pub usize);

impl Default for WatermarkRatios {
    fn default() -> Self {
        WatermarkRatios(256, 128, 64)
    }
}

/// Free-list state of one zone, behind the per-zone lock.
#[derive(Debug)]
pub(crate) struct ZoneLists {
    /// Free runs at order k are linked through their head pfn
    pub free_lists: Vec<Vec<Pfn>>,
    pub free_pages: usize,
}

/// One contiguous pfn range of one kind.
#[derive(Debug)]
pub struct Zone {
    pub kind: ZoneKind,
    pub start_pfn: Pfn,
    pub end_pfn: Pfn,
    pub watermarks: Watermarks,
    pub total_pages: usize,
    pub(crate) lists: Mutex<ZoneLists>,
}

impl Zone {
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn
    }

    pub fn free_pages(&self) -> usize {
        self.lists.lock().free_pages
    }
}

/// Per-frame byte storage.
#[derive(Debug)]
pub(crate) struct PageData(Mutex<alloc::boxed::Box<[u8]>>);

impl PageData {
    fn new() -> Self {
        PageData(Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.0.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.0.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    pub fn zero(&self) {
        self.0.lock().fill(0);
    }
}

/// Allocation statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct AllocStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub allocated_pages: usize,
}

/// The frame database: every physical page, its zone and its storage.
#[derive(Debug)]
pub struct FrameTable {
    zones: Vec<Zone>,
    frames: Vec<Frame>,
    data: Vec<PageData>,
    total_pages: usize,
}

impl FrameTable {
    /// Build the frame database from the firmware memory map.
    pub fn new(ranges: &[MemRange], ratios: WatermarkRatios) -> Result<Self> {
        if ranges.is_empty() {
            return Err(KernelError::Invalid);
        }

        let mut max_pfn = 0;
        for r in ranges {
            if r.pages == 0 {
                return Err(KernelError::Invalid);
            }
            let end = pa_to_pfn(r.base) + r.pages;
            max_pfn = max_pfn.max(end);
        }

        let mut frames = Vec::with_capacity(max_pfn);
        let mut data = Vec::with_capacity(max_pfn);
        for _ in 0..max_pfn {
            frames.push(Frame::new(0));
            data.push(PageData::new());
        }

        // Everything starts reserved; usable ranges are opened below.
        for frame in &frames {
            frame.update(|info| {
                info.state = FrameState::Allocated;
                info.flags = PageFlags::RESERVED | PageFlags::KERNEL;
                info.owner = FrameOwner::Kernel;
            });
            frame.set_refcount(1);
        }

        let mut zones = Vec::new();
        let mut total_pages = 0;
        for r in ranges {
            let start_pfn = pa_to_pfn(r.base);
            let end_pfn = start_pfn + r.pages;
            for zone in &zones {
                let z: &Zone = zone;
                if start_pfn < z.end_pfn && end_pfn > z.start_pfn {
                    return Err(KernelError::BadZone);
                }
            }
            let total = r.pages;
            zones.push(Zone {
                kind: r.kind,
                start_pfn,
                end_pfn,
                watermarks: Watermarks {
                    min: total / ratios.0,
                    low: total / ratios.1,
                    high: total / ratios.2,
                },
                total_pages: total,
                lists: Mutex::new(ZoneLists {
                    free_lists: vec![Vec::new(); MAX_ORDER as usize + 1],
                    free_pages: 0,
                }),
            });
            for pfn in start_pfn..end_pfn {
                frames[pfn].update(|info| {
                    info.state = FrameState::Free;
                    info.flags = PageFlags::empty();
                    info.owner = FrameOwner::None;
                    info.node = r.node;
                });
                frames[pfn].set_refcount(0);
            }
            total_pages += total;
        }

        let mut table = Self {
            zones,
            frames,
            data,
            total_pages,
        };
        table.seed_free_lists();

        log::info!(
            "zpf: {} zones, {} usable pages ({} KiB)",
            table.zones.len(),
            table.total_pages,
            table.total_pages * PAGE_SIZE / 1024
        );
        Ok(table)
    }

    /// Populate zone free lists with maximal aligned power-of-two runs.
    fn seed_free_lists(&mut self) {
        for zone in &self.zones {
            let mut lists = zone.lists.lock();
            let mut pfn = zone.start_pfn;
            let mut remaining = zone.end_pfn - zone.start_pfn;
            while remaining > 0 {
                let mut order = 0u8;
                while order < MAX_ORDER {
                    let run = 1usize << (order + 1);
                    if run > remaining || pfn & (run - 1) != 0 {
                        break;
                    }
                    order += 1;
                }
                let run = 1usize << order;
                self.frames[pfn].update(|info| {
                    info.order = order;
                    info.flags.insert(PageFlags::BUDDY);
                });
                lists.free_lists[order as usize].push(pfn);
                lists.free_pages += run;
                pfn += run;
                remaining -= run;
            }
        }
    }

    pub fn max_pfn(&self) -> Pfn {
        self.frames.len()
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn frame(&self, pfn: Pfn) -> Option<&Frame> {
        self.frames.get(pfn)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone_of(&self, pfn: Pfn) -> Option<&Zone> {
        self.zones.iter().find(|z| z.contains(pfn))
    }

    /// Total free pages across all zones.
    pub fn free_pages_total(&self) -> usize {
        self.zones.iter().map(|z| z.free_pages()).sum()
    }

    /// Free memory as a percentage of usable memory.
    pub fn free_percent(&self) -> usize {
        if self.total_pages == 0 {
            return 0;
        }
        self.free_pages_total() * 100 / self.total_pages
    }

    pub fn alloc_stats(&self) -> AllocStats {
        let free = self.free_pages_total();
        AllocStats {
            total_pages: self.total_pages,
            free_pages: free,
            allocated_pages: self.total_pages - free,
        }
    }

    // Page content access. Offsets must stay within one page.

    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) {
        let pfn = pa_to_pfn(pa);
        let offset = pa as usize & (PAGE_SIZE - 1);
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        self.data[pfn].read(offset, buf);
    }

    pub fn write_phys(&self, pa: PhysAddr, buf: &[u8]) {
        let pfn = pa_to_pfn(pa);
        let offset = pa as usize & (PAGE_SIZE - 1);
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        self.data[pfn].write(offset, buf);
    }

    pub fn zero_page(&self, pfn: Pfn) {
        self.data[pfn].zero();
    }

    pub fn copy_page(&self, src: Pfn, dst: Pfn) {
        let mut buf = [0u8; PAGE_SIZE];
        self.data[src].read(0, &mut buf);
        self.data[dst].write(0, &buf);
    }

    pub fn read_page(&self, pfn: Pfn, buf: &mut [u8; PAGE_SIZE]) {
        self.data[pfn].read(0, buf);
    }

    pub fn write_page(&self, pfn: Pfn, buf: &[u8; PAGE_SIZE]) {
        self.data[pfn].write(0, buf);
    }

    /// Check the zone accounting invariant:
    /// sum(free runs) + allocated == zone total.
    pub fn verify_zone_accounting(&self) -> bool {
        for zone in &self.zones {
            let lists = zone.lists.lock();
            let counted: usize = lists
                .free_lists
                .iter()
                .enumerate()
                .map(|(order, list)| list.len() << order)
                .sum();
            if counted != lists.free_pages || counted > zone.total_pages {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_zone(pages: usize) -> Vec<MemRange> {
        vec![MemRange {
            base: 0,
            pages,
            kind: ZoneKind::Normal,
            node: 0,
        }]
    }

    #[test]
    fn builds_zones_and_free_lists() {
        let table = FrameTable::new(&one_zone(64), WatermarkRatios::default()).unwrap();
        assert_eq!(table.total_pages(), 64);
        assert_eq!(table.free_pages_total(), 64);
        assert!(table.verify_zone_accounting());
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let ranges = vec![
            MemRange {
                base: 0,
                pages: 32,
                kind: ZoneKind::Dma,
                node: 0,
            },
            MemRange {
                base: 16 * PAGE_SIZE as u64,
                pages: 32,
                kind: ZoneKind::Normal,
                node: 0,
            },
        ];
        assert_eq!(
            FrameTable::new(&ranges, WatermarkRatios::default()).unwrap_err(),
            KernelError::BadZone
        );
    }

    #[test]
    fn page_data_round_trip() {
        let table = FrameTable::new(&one_zone(8), WatermarkRatios::default()).unwrap();
        table.write_phys(0x1010, &[0xde, 0xad]);
        let mut buf = [0u8; 2];
        table.read_phys(0x1010, &mut buf);
        assert_eq!(buf, [0xde, 0xad]);
        table.zero_page(1);
        table.read_phys(0x1010, &mut buf);
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn holes_are_reserved() {
        let ranges = vec![MemRange {
            base: 8 * PAGE_SIZE as u64,
            pages: 8,
            kind: ZoneKind::Normal,
            node: 0,
        }];
        let table = FrameTable::new(&ranges, WatermarkRatios::default()).unwrap();
        let info = table.frame(0).unwrap().info();
        assert_eq!(info.state, FrameState::Allocated);
        assert!(info.flags.contains(PageFlags::RESERVED));
        assert_eq!(info.owner, FrameOwner::Kernel);
        assert_eq!(table.total_pages(), 8);
    }
}
