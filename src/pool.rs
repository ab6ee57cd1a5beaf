//! Execution memory pools.
//!
//! A pool owns the process-wide execution memory budget; task managers
//! draw from it and hand it back. The trait is the seam for plugging in
//! different arbitration policies, [`BoundedMemoryPool`] is the concrete
//! fixed-budget pool used by the engine and its tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::MemoryConfig;
use crate::alloc::{HeapAllocator, MemoryAllocator, OffHeapAllocator};
use crate::error::MemoryResult;

// Identifiers

/// Identifier of a task attempt sharing an execution pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a pool's pages physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    /// Pages are backed by managed heap buffers.
    OnHeap,
    /// Pages are backed by raw native allocations.
    OffHeap,
}

// Pool trait

/// Process-wide execution memory budget shared by tasks.
///
/// Growth and arbitration across tasks live behind this interface; a
/// task manager only ever sees its own grants.
pub trait MemoryPool: Send + Sync {
    /// Try to reserve up to `bytes` for a task. Returns the granted
    /// amount, anywhere from zero to `bytes`. May block while memory is
    /// reclaimed elsewhere.
    fn acquire_execution_memory(&self, bytes: u64, task: TaskId) -> u64;

    /// Return `bytes` of a task's reservation to the pool.
    fn release_execution_memory(&self, bytes: u64, task: TaskId);

    /// Drop everything a task still holds. Returns the amount released.
    fn release_all_execution_memory_for_task(&self, task: TaskId) -> u64;

    /// Recommended page size for allocations drawn from this pool.
    fn page_size_bytes(&self) -> u64;

    /// Bytes currently reserved by a task.
    fn execution_memory_used_for_task(&self, task: TaskId) -> u64;

    /// Whether pages from this pool live on or off the managed heap.
    fn memory_mode(&self) -> MemoryMode;

    /// The allocator that backs pages drawn from this pool.
    fn allocator(&self) -> Arc<dyn MemoryAllocator>;

    /// Whether accounting anomalies should abort instead of warn.
    fn strict_accounting(&self) -> bool {
        false
    }
}

/// Shared handle to a pool.
pub type SharedMemoryPool = Arc<dyn MemoryPool>;

// Bounded pool

#[derive(Default)]
struct PoolState {
    used: u64,
    by_task: HashMap<TaskId, u64>,
}

/// Fixed-budget pool handing out execution memory first come, first
/// served.
///
/// Grants are clamped to what is left of the budget; there is no
/// cross-task fairness policy and no blocking. Tasks that need more than
/// the remainder are expected to spill through their managers.
pub struct BoundedMemoryPool {
    config: MemoryConfig,
    allocator: Arc<dyn MemoryAllocator>,
    state: Mutex<PoolState>,
}

impl BoundedMemoryPool {
    /// Create a pool over the given configuration.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;
        let allocator: Arc<dyn MemoryAllocator> = match config.mode {
            MemoryMode::OnHeap => Arc::new(HeapAllocator::new(config.debug_fill)),
            MemoryMode::OffHeap => Arc::new(OffHeapAllocator::new(config.debug_fill)),
        };
        Ok(Self {
            config,
            allocator,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Total budget in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Bytes currently reserved across all tasks.
    pub fn memory_used(&self) -> u64 {
        self.state.lock().used
    }

    /// Unreserved bytes remaining in the budget.
    pub fn memory_free(&self) -> u64 {
        self.config.capacity - self.state.lock().used
    }
}

impl MemoryPool for BoundedMemoryPool {
    fn acquire_execution_memory(&self, bytes: u64, task: TaskId) -> u64 {
        let mut state = self.state.lock();
        let granted = bytes.min(self.config.capacity - state.used);
        if granted > 0 {
            state.used += granted;
            *state.by_task.entry(task).or_insert(0) += granted;
        }
        granted
    }

    fn release_execution_memory(&self, bytes: u64, task: TaskId) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        let held = state.by_task.get(&task).copied().unwrap_or(0);
        let released = if bytes > held {
            tracing::warn!(
                "task {} released {} bytes of execution memory but only {} are recorded",
                task,
                bytes,
                held
            );
            held
        } else {
            bytes
        };
        state.used -= released;
        if released == held {
            state.by_task.remove(&task);
        } else if let Some(entry) = state.by_task.get_mut(&task) {
            *entry -= released;
        }
    }

    fn release_all_execution_memory_for_task(&self, task: TaskId) -> u64 {
        let mut state = self.state.lock();
        let held = state.by_task.remove(&task).unwrap_or(0);
        state.used -= held;
        held
    }

    fn page_size_bytes(&self) -> u64 {
        self.config.page_size
    }

    fn execution_memory_used_for_task(&self, task: TaskId) -> u64 {
        self.state.lock().by_task.get(&task).copied().unwrap_or(0)
    }

    fn memory_mode(&self) -> MemoryMode {
        self.config.mode
    }

    fn allocator(&self) -> Arc<dyn MemoryAllocator> {
        self.allocator.clone()
    }

    fn strict_accounting(&self) -> bool {
        self.config.strict_accounting
    }
}

// Tests
