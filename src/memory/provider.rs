use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// A block of memory handed out by a [`MemoryProvider`]
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    /// Pointer to the memory block
    ptr: NonNull<u8>,
    /// Size of the memory block in bytes
    size: usize,
    /// Alignment of the memory block
    alignment: usize,
}

impl MemoryBlock {
    /// Create a new memory block
    pub fn new(ptr: NonNull<u8>, size: usize, alignment: usize) -> Self {
        Self {
            ptr,
            size,
            alignment,
        }
    }

    /// Get a pointer to the memory block
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Get the size of the memory block
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the alignment of the memory block
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

/// The device capability the planner materializes buffers with.
///
/// A provider is shared between a graph, its allocator and its tensors, so
/// it takes `&self` and keeps its own bookkeeping behind interior mutability.
pub trait MemoryProvider: Send + Sync + Debug {
    /// Human readable name of the device
    fn name(&self) -> &str;

    /// Allocate a block of memory with the specified size and alignment
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemoryBlock>;

    /// Return a block obtained from `allocate`
    fn deallocate(&self, block: MemoryBlock);

    /// Get the amount of memory currently handed out
    fn allocated_memory(&self) -> usize;
}

/// Whether two handles refer to the same provider instance
pub fn same_provider(a: &Arc<dyn MemoryProvider>, b: &Arc<dyn MemoryProvider>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Host memory provider backed by the Rust global allocator
#[derive(Debug)]
pub struct CpuProvider {
    allocated: AtomicUsize,
    memory_limit: Option<usize>,
    allocations: Mutex<HashMap<usize, Layout>>,
}

impl CpuProvider {
    /// Create a new host provider
    pub fn new(memory_limit: Option<usize>) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            memory_limit,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Create a shared host provider without a memory limit
    pub fn shared() -> Arc<dyn MemoryProvider> {
        Arc::new(Self::new(None))
    }
}

impl MemoryProvider for CpuProvider {
    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate(&self, size: usize, alignment: usize) -> Result<MemoryBlock> {
        // Zero-sized layouts are not allowed by the global allocator
        let size = std::cmp::max(1, size);

        if let Some(limit) = self.memory_limit {
            let current = self.allocated.load(Ordering::Relaxed);
            if current.checked_add(size).map_or(true, |total| total > limit) {
                return Err(Error::AllocationFailed(format!(
                    "memory limit of {} bytes exceeded with allocation of {} bytes (current: {})",
                    limit, size, current
                )));
            }
        }

        let layout = Layout::from_size_align(size, alignment).map_err(|e| {
            Error::AllocationFailed(format!(
                "invalid memory layout: size={}, alignment={}, error={}",
                size, alignment, e
            ))
        })?;

        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| Error::AllocationFailed("failed to lock allocations mutex".to_string()))?;

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::AllocationFailed(format!(
                "out of host memory: size={}, alignment={}",
                size, alignment
            ))
        })?;

        allocations.insert(ptr.as_ptr() as usize, layout);
        self.allocated.fetch_add(size, Ordering::Relaxed);

        Ok(MemoryBlock::new(ptr, size, alignment))
    }

    fn deallocate(&self, block: MemoryBlock) {
        let mut allocations = match self.allocations.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!("cpu provider lock poisoned, leaking {} bytes", block.size());
                return;
            }
        };

        if let Some(layout) = allocations.remove(&(block.ptr().as_ptr() as usize)) {
            // SAFETY: the pointer was produced by `alloc::alloc` with this layout
            // and has just been removed from the live set.
            unsafe {
                alloc::dealloc(block.ptr().as_ptr(), layout);
            }
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        }
    }

    fn allocated_memory(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Drop for CpuProvider {
    fn drop(&mut self) {
        if let Ok(allocations) = self.allocations.get_mut() {
            for (ptr, layout) in allocations.drain() {
                // SAFETY: every entry is a live allocation made with `layout`.
                unsafe {
                    alloc::dealloc(ptr as *mut u8, layout);
                }
            }
        }
    }
}
