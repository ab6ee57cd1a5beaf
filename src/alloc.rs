//! Physical memory allocators.
//!
//! Turns byte counts into [`MemoryBlock`]s. The heap allocator backs
//! blocks with shared word arrays and recycles large buffers; the
//! off-heap allocator hands out raw native memory. Either can poison
//! memory with recognizable fill patterns to flush out use-after-free
//! and missing-initialization bugs in consumers.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{BlockBase, HeapStore, MemoryBlock, PageRegistration};
use crate::error::{MemoryError, MemoryResult};

/// Byte pattern written over freshly granted memory when debug fill is on.
pub const DEBUG_FILL_CLEAN: u8 = 0xa5;

/// Byte pattern written over released memory when debug fill is on.
pub const DEBUG_FILL_FREED: u8 = 0x5a;

/// Heap buffers at least this large are kept for reuse after free.
pub const POOLING_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Turns byte counts into memory blocks.
///
/// Newly reserved memory is zeroed; recycled heap buffers may retain
/// previous contents (or the freed fill pattern when debug fill is on).
pub trait MemoryAllocator: Send + Sync {
    /// Allocate a block of `size` bytes. Zero-size requests are an
    /// error; running out of physical memory is not recoverable at this
    /// layer and aborts.
    fn allocate(&self, size: u64) -> MemoryResult<MemoryBlock>;

    /// Release a block's backing memory.
    ///
    /// The block must already be deregistered from its page table.
    fn free(&self, block: MemoryBlock);
}

// Heap allocator

/// Allocator backing blocks with shared word arrays.
///
/// Freed buffers of at least [`POOLING_THRESHOLD_BYTES`] are retained in
/// size-class buckets and handed out again without re-zeroing, as long
/// as the freed block held the last handle to its store.
pub struct HeapAllocator {
    /// Reusable stores bucketed by word length.
    pooled: Mutex<HashMap<usize, Vec<HeapStore>>>,
    debug_fill: bool,
}

impl HeapAllocator {
    /// Create a heap allocator.
    pub fn new(debug_fill: bool) -> Self {
        Self {
            pooled: Mutex::new(HashMap::new()),
            debug_fill,
        }
    }

    #[inline]
    fn should_pool(size: u64) -> bool {
        size >= POOLING_THRESHOLD_BYTES
    }

    fn take_pooled(&self, words: usize) -> Option<HeapStore> {
        let mut pooled = self.pooled.lock();
        let bucket = pooled.get_mut(&words)?;
        let store = bucket.pop();
        if bucket.is_empty() {
            pooled.remove(&words);
        }
        store
    }
}

impl MemoryAllocator for HeapAllocator {
    fn allocate(&self, size: u64) -> MemoryResult<MemoryBlock> {
        if size == 0 {
            return Err(MemoryError::Allocation(
                "cannot allocate zero bytes".to_string(),
            ));
        }

        let words = (size as usize).div_ceil(8);
        let mut store = if Self::should_pool(size)
            && let Some(store) = self.take_pooled(words)
        {
            store
        } else {
            HeapStore::zeroed(size)?
        };
        if self.debug_fill {
            store.fill(DEBUG_FILL_CLEAN);
        }
        Ok(MemoryBlock::heap(Arc::new(store), size))
    }

    fn free(&self, block: MemoryBlock) {
        assert!(
            block.registration() == PageRegistration::Unregistered,
            "block must be deregistered from its task before it is freed"
        );
        let size = block.size();
        let BlockBase::Heap(store) = block.into_base() else {
            panic!("heap allocator asked to free an off-heap block");
        };

        // Recycle only when this was the last handle to the store.
        if let Some(mut store) = Arc::into_inner(store) {
            if self.debug_fill {
                store.fill(DEBUG_FILL_FREED);
            }
            if Self::should_pool(size) {
                self.pooled
                    .lock()
                    .entry(store.word_len())
                    .or_default()
                    .push(store);
            }
        }
    }
}

// Off-heap allocator

/// Allocator backing blocks with raw native memory.
pub struct OffHeapAllocator {
    debug_fill: bool,
}

impl OffHeapAllocator {
    /// Create an off-heap allocator.
    pub fn new(debug_fill: bool) -> Self {
        Self { debug_fill }
    }
}

impl MemoryAllocator for OffHeapAllocator {
    fn allocate(&self, size: u64) -> MemoryResult<MemoryBlock> {
        if size == 0 {
            return Err(MemoryError::Allocation(
                "cannot allocate zero bytes".to_string(),
            ));
        }

        let layout = Layout::from_size_align(size as usize, 8)
            .map_err(|_| MemoryError::Allocation(format!("invalid layout for {} bytes", size)))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        if self.debug_fill {
            unsafe { std::ptr::write_bytes(ptr, DEBUG_FILL_CLEAN, size as usize) };
        }
        Ok(MemoryBlock::off_heap(ptr as usize as u64, size))
    }

    fn free(&self, block: MemoryBlock) {
        assert!(
            block.registration() == PageRegistration::Unregistered,
            "block must be deregistered from its task before it is freed"
        );
        let size = block.size();
        let addr = block.base_offset();
        match block.into_base() {
            BlockBase::OffHeap => {}
            BlockBase::Heap(_) => panic!("off-heap allocator asked to free a heap block"),
        }

        let ptr = addr as usize as *mut u8;
        // Matches the layout built in allocate().
        let layout = unsafe { Layout::from_size_align_unchecked(size as usize, 8) };
        unsafe {
            if self.debug_fill {
                std::ptr::write_bytes(ptr, DEBUG_FILL_FREED, size as usize);
            }
            dealloc(ptr, layout);
        }
    }
}

// Tests
