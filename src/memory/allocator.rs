use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::provider::{MemoryBlock, MemoryProvider};
use crate::options::DEFAULT_ALIGNMENT;

/// Offset allocator used to plan a single static buffer.
///
/// During planning the arena exists only as a `peak` counter and `alloc`/`free`
/// hand out and reclaim byte offsets. The first call to [`Allocator::materialize`]
/// requests `peak` bytes from the provider; from then on the layout is frozen
/// and further planning calls panic.
#[derive(Debug)]
pub struct Allocator {
    provider: Arc<dyn MemoryProvider>,
    used: usize,
    peak: usize,
    alignment: usize,
    /// Reclaimed regions, block start -> block length
    free_blocks: BTreeMap<usize, usize>,
    block: Option<MemoryBlock>,
}

impl Allocator {
    /// Create an allocator with the default alignment
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Self {
        Self::with_alignment(provider, DEFAULT_ALIGNMENT)
    }

    /// Create an allocator rounding every request to `alignment` bytes
    pub fn with_alignment(provider: Arc<dyn MemoryProvider>, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a non-zero power of two, got {}",
            alignment
        );
        Self {
            provider,
            used: 0,
            peak: 0,
            alignment,
            free_blocks: BTreeMap::new(),
            block: None,
        }
    }

    /// Reserve `size` bytes and return their offset in the arena
    pub fn alloc(&mut self, size: usize) -> usize {
        assert!(
            self.block.is_none(),
            "alloc after the arena has been materialized"
        );
        let size = self.aligned_size(size);
        self.used = match self.used.checked_add(size) {
            Some(used) => used,
            None => panic!("arena usage {} overflows usize growing by {}", self.used, size),
        };

        let fit = self
            .free_blocks
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len));
        if let Some((offset, len)) = fit {
            self.free_blocks.remove(&offset);
            if len > size {
                self.free_blocks.insert(offset + size, len - size);
            }
            return offset;
        }

        // A free block touching the end of the arena can be grown in place
        if let Some((&offset, &len)) = self.free_blocks.iter().next_back() {
            if offset + len == self.peak {
                self.free_blocks.remove(&offset);
                self.grow_peak(size - len);
                return offset;
            }
        }

        let offset = self.peak;
        self.grow_peak(size);
        offset
    }

    /// Return a region previously obtained from `alloc` with the same size
    pub fn free(&mut self, offset: usize, size: usize) {
        assert!(
            self.block.is_none(),
            "free after the arena has been materialized"
        );
        let size = self.aligned_size(size);
        assert!(
            size <= self.used && offset + size <= self.peak,
            "free of [{}, {}) does not match a live allocation (used {}, peak {})",
            offset,
            offset + size,
            self.used,
            self.peak
        );

        let lower = self
            .free_blocks
            .range(..=offset)
            .next_back()
            .map(|(&start, &len)| (start, len));
        let upper = self
            .free_blocks
            .range(offset + 1..)
            .next()
            .map(|(&start, &len)| (start, len));
        if let Some((start, len)) = lower {
            assert!(
                start + len <= offset,
                "double free of offset {} (free block [{}, {}))",
                offset,
                start,
                start + len
            );
        }
        if let Some((start, _)) = upper {
            assert!(
                offset + size <= start,
                "free of [{}, {}) overlaps free block at {}",
                offset,
                offset + size,
                start
            );
        }

        self.used -= size;
        let mut start = offset;
        let mut len = size;
        if let Some((lower_start, lower_len)) = lower {
            if lower_start + lower_len == offset {
                self.free_blocks.remove(&lower_start);
                start = lower_start;
                len += lower_len;
            }
        }
        if let Some(upper_len) = self.free_blocks.remove(&(offset + size)) {
            len += upper_len;
        }
        self.free_blocks.insert(start, len);
    }

    /// Request the planned arena from the provider; idempotent
    pub fn materialize(&mut self) -> Result<NonNull<u8>> {
        if let Some(block) = &self.block {
            return Ok(block.ptr());
        }
        let block = self.provider.allocate(self.peak, self.alignment)?;
        log::info!(
            "allocator materialized {} bytes at {:p} on {}",
            self.peak,
            block.ptr(),
            self.provider.name()
        );
        let ptr = block.ptr();
        self.block = Some(block);
        Ok(ptr)
    }

    /// Round `size` up to the allocator alignment; zero counts as one byte.
    ///
    /// An empty tensor still gets its own slot, so no two live tensors share
    /// an offset and `free` can tell their regions apart.
    ///
    /// Panics if the rounded size does not fit in `usize`.
    pub fn aligned_size(&self, size: usize) -> usize {
        let size = std::cmp::max(1, size);
        match size.checked_add(self.alignment - 1) {
            Some(padded) => padded / self.alignment * self.alignment,
            None => panic!(
                "size {} overflows usize when aligned to {}",
                size, self.alignment
            ),
        }
    }

    fn grow_peak(&mut self, by: usize) {
        self.peak = match self.peak.checked_add(by) {
            Some(peak) => peak,
            None => panic!("arena peak {} overflows usize growing by {}", self.peak, by),
        };
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_materialized(&self) -> bool {
        self.block.is_some()
    }

    /// Reclaimed regions as `(offset, length)` in address order
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks.iter().map(|(&offset, &len)| (offset, len))
    }

    /// Log current usage
    pub fn info(&self) {
        log::info!("used memory: {}, peak memory: {}", self.used, self.peak);
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.provider.deallocate(block);
        }
    }
}
