/// Swap files and slot bitmaps
///
/// Page-sized, page-aligned slots across a small set of swap files. Slot
/// allocation picks the highest-priority file with a free slot; the slot
/// identity (file index, page index) is what the PTE swap encoding
/// carries. Up to 32 files (the encoding has a 5-bit file index).

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::SwapFileConfig;
use crate::error::{KernelError, Result};
use super::page::PAGE_SIZE;

pub const MAX_SWAP_FILES: usize = 32;

struct SwapFileInner {
    data: Vec<u8>,
    bitmap: Vec<u64>,
    free_slots: usize,
}

/// One swap file: a slot arena plus its allocation bitmap.
pub struct SwapFile {
    pub index: usize,
    pub priority: i32,
    pub pages: usize,
    inner: Mutex<SwapFileInner>,
}

impl SwapFile {
    fn new(index: usize, cfg: SwapFileConfig) -> Self {
        Self {
            index,
            priority: cfg.priority,
            pages: cfg.pages,
            inner: Mutex::new(SwapFileInner {
                data: vec![0u8; cfg.pages * PAGE_SIZE],
                bitmap: vec![0u64; cfg.pages.div_ceil(64)],
                free_slots: cfg.pages,
            }),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().free_slots
    }

    fn alloc_slot(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.free_slots == 0 {
            return None;
        }
        for (word_idx, word) in inner.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let slot = word_idx * 64 + bit;
                if slot >= self.pages {
                    break;
                }
                *word |= 1 << bit;
                inner.free_slots -= 1;
                return Some(slot);
            }
        }
        None
    }

    fn free_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.pages {
            return Err(KernelError::CorruptedSwap);
        }
        let mut inner = self.inner.lock();
        let (word, bit) = (slot / 64, slot % 64);
        if inner.bitmap[word] & (1 << bit) == 0 {
            return Err(KernelError::CorruptedSwap);
        }
        inner.bitmap[word] &= !(1 << bit);
        inner.free_slots += 1;
        Ok(())
    }

    pub fn is_allocated(&self, slot: usize) -> bool {
        if slot >= self.pages {
            return false;
        }
        let inner = self.inner.lock();
        inner.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn write(&self, slot: usize, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        if slot >= self.pages {
            return Err(KernelError::IoError);
        }
        let mut inner = self.inner.lock();
        if inner.bitmap[slot / 64] & (1 << (slot % 64)) == 0 {
            return Err(KernelError::CorruptedSwap);
        }
        let offset = slot * PAGE_SIZE;
        inner.data[offset..offset + PAGE_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn read(&self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if slot >= self.pages {
            return Err(KernelError::IoError);
        }
        let inner = self.inner.lock();
        if inner.bitmap[slot / 64] & (1 << (slot % 64)) == 0 {
            return Err(KernelError::CorruptedSwap);
        }
        let offset = slot * PAGE_SIZE;
        buf.copy_from_slice(&inner.data[offset..offset + PAGE_SIZE]);
        Ok(())
    }
}

/// The registered swap files, ordered as configured.
pub struct SwapTable {
    files: Vec<SwapFile>,
}

impl SwapTable {
    pub fn new(configs: &[SwapFileConfig]) -> Result<Self> {
        if configs.len() > MAX_SWAP_FILES {
            return Err(KernelError::Invalid);
        }
        let files = configs
            .iter()
            .enumerate()
            .map(|(i, cfg)| SwapFile::new(i, *cfg))
            .collect::<Vec<_>>();
        if !files.is_empty() {
            log::info!(
                "swap: {} file(s), {} total slots",
                files.len(),
                files.iter().map(|f| f.pages).sum::<usize>()
            );
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[SwapFile] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Result<&SwapFile> {
        self.files.get(index).ok_or(KernelError::CorruptedSwap)
    }

    /// Allocate one slot from the highest-priority file with space.
    pub fn alloc_slot(&self) -> Result<(usize, usize)> {
        let mut candidates: Vec<&SwapFile> = self.files.iter().collect();
        candidates.sort_by_key(|f| core::cmp::Reverse(f.priority));
        for file in candidates {
            if let Some(slot) = file.alloc_slot() {
                return Ok((file.index, slot));
            }
        }
        Err(KernelError::SwapFull)
    }

    pub fn free_slot(&self, file: usize, slot: usize) -> Result<()> {
        self.file(file)?.free_slot(slot)
    }

    pub fn write_slot(&self, file: usize, slot: usize, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.file(file)?.write(slot, buf)
    }

    pub fn read_slot(&self, file: usize, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.file(file)?.read(slot, buf)
    }

    pub fn is_allocated(&self, file: usize, slot: usize) -> bool {
        self.files
            .get(file)
            .map(|f| f.is_allocated(slot))
            .unwrap_or(false)
    }

    pub fn free_slots_total(&self) -> usize {
        self.files.iter().map(|f| f.free_slots()).sum()
    }
}
