//! Quarry - task-level execution memory management
//!
//! Each running task gets a [`TaskMemoryManager`] that draws execution
//! memory from a shared [`MemoryPool`], arbitrates it among cooperating
//! [`MemoryConsumer`]s by asking them to spill under pressure, and packs
//! page number and offset into a single `u64` so operators can address
//! managed memory in either on-heap or off-heap mode.

pub mod addr;
pub mod alloc;
pub mod block;
pub mod consumer;
pub mod error;
pub mod pool;
pub mod task;

pub use addr::{
    MAX_PAGE_SIZE_BYTES, OFFSET_BITS, OFFSET_MASK, PAGE_NUMBER_BITS, PAGE_NUMBER_MASK,
    PAGE_TABLE_SIZE, PageNumber, decode_offset, decode_page_number, encode_page_address,
};
pub use alloc::{HeapAllocator, MemoryAllocator, OffHeapAllocator};
pub use block::{HeapStore, MemoryBlock, PageRegistration};
pub use consumer::{ConsumerId, MemoryConsumer, SharedConsumer};
pub use error::{MemoryError, MemoryResult};
pub use pool::{BoundedMemoryPool, MemoryMode, MemoryPool, SharedMemoryPool, TaskId};
pub use task::TaskMemoryManager;

/// Execution memory configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Total execution memory budget in bytes.
    pub capacity: u64,
    /// Whether pages are backed by the managed heap or raw allocations.
    pub mode: MemoryMode,
    /// Page size advertised to consumers sizing their requests.
    pub page_size: u64,
    /// Panic on accounting anomalies instead of logging them.
    pub strict_accounting: bool,
    /// Poison allocated and freed memory with recognizable byte patterns.
    pub debug_fill: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024, // 64 MiB
            mode: MemoryMode::OnHeap,
            page_size: 1024 * 1024, // 1 MiB
            strict_accounting: false,
            debug_fill: false,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.page_size == 0 {
            return Err(MemoryError::Config("page_size must be non-zero".to_string()));
        }
        if self.page_size > MAX_PAGE_SIZE_BYTES {
            return Err(MemoryError::Config(format!(
                "page_size {} exceeds the maximum page size of {} bytes",
                self.page_size, MAX_PAGE_SIZE_BYTES
            )));
        }
        Ok(())
    }
}
