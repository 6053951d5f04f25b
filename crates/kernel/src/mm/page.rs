/// Physical page management
///
/// Tracks metadata for each physical page frame including
/// reference counts, order, state and ownership.

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Physical address type
pub type PhysAddr = u64;

/// Page frame number
pub type Pfn = usize;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Convert physical address to page frame number
#[inline]
pub const fn pa_to_pfn(pa: PhysAddr) -> Pfn {
    (pa as usize) >> PAGE_SHIFT
}

/// Convert page frame number to physical address
#[inline]
pub const fn pfn_to_pa(pfn: Pfn) -> PhysAddr {
    (pfn << PAGE_SHIFT) as PhysAddr
}

/// Round physical address down to page boundary
#[inline]
pub const fn page_align_down(pa: u64) -> u64 {
    pa & !(PAGE_SIZE as u64 - 1)
}

/// Round physical address up to page boundary
#[inline]
pub const fn page_align_up(pa: u64) -> u64 {
    (pa + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Check for page alignment
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

bitflags::bitflags! {
    /// Page flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page is on a buddy free list
        const BUDDY = 1 << 0;
        /// Page is reserved (not available for allocation)
        const RESERVED = 1 << 1;
        /// Page is used by the kernel itself
        const KERNEL = 1 << 2;
        /// Page content has been modified since load
        const DIRTY = 1 << 3;
    }
}

/// Frame lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// On a zone free list
    Free,
    /// Handed out by the buddy allocator
    Allocated,
    /// Content is being written out to a swap slot
    Swapped,
}

/// Who holds a frame while it is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOwner {
    None,
    /// Kernel-internal allocation (page-table roots, kernel stacks)
    Kernel,
    /// Carved into objects by a slab cache (cache id)
    Slab(u32),
    /// Mapped by one or more user regions
    User,
}

/// Mutable per-frame metadata, protected by a per-frame lock
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub state: FrameState,
    pub order: u8,
    pub flags: PageFlags,
    pub owner: FrameOwner,
    /// NUMA node the frame belongs to
    pub node: u8,
}

/// Page frame metadata, one instance per physical page, indexed by PFN
pub struct Frame {
    /// Mapping reference count (0 = unreferenced)
    refcount: AtomicU32,
    info: Mutex<FrameInfo>,
}

impl Frame {
    pub const fn new(node: u8) -> Self {
        Self {
            refcount: AtomicU32::new(0),
            info: Mutex::new(FrameInfo {
                state: FrameState::Free,
                order: 0,
                flags: PageFlags::empty(),
                owner: FrameOwner::None,
                node,
            }),
        }
    }

    /// Check if frame is unreferenced
    pub fn is_free(&self) -> bool {
        self.refcount.load(Ordering::Acquire) == 0
    }

    /// Increment reference count
    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement reference count and return the new value
    pub fn put(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn set_refcount(&self, count: u32) {
        self.refcount.store(count, Ordering::Release);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn info(&self) -> FrameInfo {
        *self.info.lock()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FrameInfo) -> R) -> R {
        f(&mut self.info.lock())
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let info = self.info();
        f.debug_struct("Frame")
            .field("refcount", &self.refcount())
            .field("state", &info.state)
            .field("order", &info.order)
            .field("flags", &info.flags)
            .field("owner", &info.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfn_round_trip() {
        assert_eq!(pa_to_pfn(0x4000), 4);
        assert_eq!(pfn_to_pa(4), 0x4000);
        assert_eq!(page_align_down(0x4fff), 0x4000);
        assert_eq!(page_align_up(0x4001), 0x5000);
        assert!(is_page_aligned(0x40_0000));
        assert!(!is_page_aligned(0x40_0001));
    }

    #[test]
    fn refcounting() {
        let frame = Frame::new(0);
        assert!(frame.is_free());
        frame.get();
        frame.get();
        assert_eq!(frame.refcount(), 2);
        assert_eq!(frame.put(), 1);
        assert_eq!(frame.put(), 0);
        assert!(frame.is_free());
    }
}
