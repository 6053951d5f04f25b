/// Kernel configuration
///
/// Everything the boot path needs to size the core: the memory map, CPU
/// count, timer frequency, scheduling and replacement policies, swap
/// geometry and the allocator tunables.

use alloc::vec;
use alloc::vec::Vec;

use crate::mm::reclaim::ReplacementPolicy;
use crate::mm::zone::{WatermarkRatios, ZoneKind};
use crate::mm::PAGE_SIZE;
use crate::sched::SchedPolicy;

/// One usable RAM range from the firmware memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemRange {
    pub base: u64,
    pub pages: usize,
    pub kind: ZoneKind,
    pub node: u8,
}

/// One swap file to register at init.
#[derive(Debug, Clone, Copy)]
pub struct SwapFileConfig {
    pub pages: usize,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Usable RAM ranges; everything outside stays kernel-reserved.
    pub mem: Vec<MemRange>,
    pub cpus: usize,
    /// Timer frequency in ticks per second.
    pub hz: u32,
    /// Round-robin quantum, in ticks.
    pub default_quantum: u32,
    pub sched_policy: SchedPolicy,
    pub repl_policy: ReplacementPolicy,
    pub swap_files: Vec<SwapFileConfig>,
    pub watermarks: WatermarkRatios,
    /// Free-memory percentage below which gentle reclaim runs.
    pub reclaim_low_percent: usize,
    /// Free-memory percentage below which aggressive reclaim runs.
    pub reclaim_high_percent: usize,
    /// Per-CPU slab magazine capacity; drains in halves.
    pub magazine_limit: usize,
    /// Default capacity of per-process message queues.
    pub queue_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            // 16 MiB DMA + 48 MiB normal
            mem: vec![
                MemRange {
                    base: 0,
                    pages: (16 << 20) / PAGE_SIZE,
                    kind: ZoneKind::Dma,
                    node: 0,
                },
                MemRange {
                    base: 16 << 20,
                    pages: (48 << 20) / PAGE_SIZE,
                    kind: ZoneKind::Normal,
                    node: 0,
                },
            ],
            cpus: 1,
            hz: 1000,
            default_quantum: 10,
            sched_policy: SchedPolicy::RoundRobin,
            repl_policy: ReplacementPolicy::Lru,
            swap_files: vec![SwapFileConfig {
                pages: 4096,
                priority: 0,
            }],
            watermarks: WatermarkRatios::default(),
            reclaim_low_percent: 10,
            reclaim_high_percent: 5,
            magazine_limit: 16,
            queue_capacity: 64,
        }
    }
}

impl KernelConfig {
    /// Small single-zone configuration, handy for tests and demos.
    pub fn compact(pages: usize, swap_pages: usize) -> Self {
        Self {
            mem: vec![MemRange {
                base: 0,
                pages,
                kind: ZoneKind::Normal,
                node: 0,
            }],
            swap_files: if swap_pages > 0 {
                vec![SwapFileConfig {
                    pages: swap_pages,
                    priority: 0,
                }]
            } else {
                Vec::new()
            },
            ..Self::default()
        }
    }

    pub fn ticks_for_ms(&self, ms: u64) -> u64 {
        (ms * self.hz as u64).div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.hz, 1000);
        assert_eq!(cfg.ticks_for_ms(50), 50);
        assert!(cfg.reclaim_high_percent < cfg.reclaim_low_percent);
    }

    #[test]
    fn compact_config() {
        let cfg = KernelConfig::compact(8, 16);
        assert_eq!(cfg.mem.len(), 1);
        assert_eq!(cfg.mem[0].pages, 8);
        assert_eq!(cfg.swap_files[0].pages, 16);
    }
}
