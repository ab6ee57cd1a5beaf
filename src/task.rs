//! Task-level execution memory management.
//!
//! One [`TaskMemoryManager`] arbitrates execution memory among the
//! cooperating consumers of a single task: it draws grants from the
//! shared pool, asks other consumers to spill when a request falls
//! short, and tracks every allocated page in a fixed table so that
//! packed page addresses can be resolved back to live memory.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use bitvec::BitArr;
use bitvec::array::BitArray;
use parking_lot::Mutex;

use crate::addr::{self, MAX_PAGE_SIZE_BYTES, PAGE_TABLE_SIZE, PageNumber};
use crate::alloc::MemoryAllocator;
use crate::block::{HeapStore, MemoryBlock, PageRegistration};
use crate::consumer::{ConsumerId, SharedConsumer};
use crate::error::{MemoryError, MemoryResult};
use crate::pool::{MemoryMode, SharedMemoryPool, TaskId};

type PageBitmap = BitArr!(for PAGE_TABLE_SIZE, in u64);

/// Bytes granted to one consumer, plus the handle used to ask it to
/// spill on someone else's behalf. Anonymous grants carry no handle.
struct ConsumerEntry {
    bytes: u64,
    handle: Option<SharedConsumer>,
}

struct TaskState {
    /// Granted bytes per consumer; an entry exists only while its
    /// balance is strictly positive.
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    /// Slot `n` holds the block registered as page `n`.
    page_table: Box<[Option<MemoryBlock>]>,
    /// Occupancy bitmap over `page_table`: a bit is set exactly when the
    /// slot holds a block.
    allocated_pages: PageBitmap,
}

impl TaskState {
    fn new() -> Self {
        Self {
            consumers: HashMap::new(),
            page_table: (0..PAGE_TABLE_SIZE).map(|_| None).collect(),
            allocated_pages: BitArray::ZERO,
        }
    }
}

/// Execution memory manager for a single task.
///
/// Grants are drawn from the [`SharedMemoryPool`] and attributed to the
/// requesting consumer. When the pool cannot satisfy a request, the
/// manager asks the task's other consumers to spill and retries until
/// the request is met or nobody has anything left to give. Large
/// allocations go through [`allocate_page`], which registers the block
/// in a page table of [`PAGE_TABLE_SIZE`] slots so offsets into it can
/// be packed into a single `u64` address.
///
/// Locking: `acquire_lock` serializes whole acquire-and-spill sequences,
/// while `state` guards the accounting map and page table with short
/// critical sections. Spill callbacks run with only `acquire_lock` held,
/// so a spilling consumer may release memory and free pages but must not
/// request more memory from the same manager.
///
/// [`allocate_page`]: TaskMemoryManager::allocate_page
pub struct TaskMemoryManager {
    pool: SharedMemoryPool,
    allocator: Arc<dyn MemoryAllocator>,
    mode: MemoryMode,
    strict_accounting: bool,
    task: TaskId,
    acquire_lock: Mutex<()>,
    state: Mutex<TaskState>,
}

impl TaskMemoryManager {
    /// Create a manager for one task over a shared pool.
    pub fn new(pool: SharedMemoryPool, task: TaskId) -> Self {
        let allocator = pool.allocator();
        let mode = pool.memory_mode();
        let strict_accounting = pool.strict_accounting();
        Self {
            pool,
            allocator,
            mode,
            strict_accounting,
            task,
            acquire_lock: Mutex::new(()),
            state: Mutex::new(TaskState::new()),
        }
    }

    /// The task this manager accounts for.
    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Whether pages live on or off the managed heap.
    #[inline]
    pub fn memory_mode(&self) -> MemoryMode {
        self.mode
    }

    /// Acquire up to `required` bytes for a consumer, spilling other
    /// consumers as needed. Returns the number of bytes granted, between
    /// zero and `required`.
    ///
    /// A grant below `required` is not an error; callers decide whether
    /// to proceed with less, shed their own state, or give up. An error
    /// is returned only when a spill callback fails, and any bytes
    /// granted before the failure remain attributed to the consumer.
    pub fn acquire_execution_memory(
        &self,
        required: u64,
        consumer: Option<&SharedConsumer>,
    ) -> MemoryResult<u64> {
        let requester = consumer.map_or(ConsumerId::ANONYMOUS, |c| ConsumerId::of(c.as_ref()));
        let _serial = self.acquire_lock.lock();

        let mut got = self.pool.acquire_execution_memory(required, self.task);

        if got < required {
            // A spill may re-enter release_execution_memory or
            // free_page, so the candidates are snapshotted and the state
            // lock is not held across the callbacks.
            let victims: Vec<(ConsumerId, SharedConsumer)> = {
                let state = self.state.lock();
                state
                    .consumers
                    .iter()
                    .filter(|(id, entry)| **id != requester && entry.bytes > 0)
                    .filter_map(|(id, entry)| entry.handle.clone().map(|handle| (*id, handle)))
                    .collect()
            };
            let trigger = (!requester.is_anonymous()).then_some(requester);
            for (victim, handle) in victims {
                match handle.spill(required - got, trigger) {
                    Ok(released) => {
                        if released > 0 {
                            tracing::debug!(
                                "task {}: consumer {} released {} bytes for consumer {}",
                                self.task,
                                victim,
                                released,
                                requester
                            );
                        }
                        // Even a zero-byte spill may have raced with a
                        // release elsewhere, so always ask again.
                        got += self.pool.acquire_execution_memory(required - got, self.task);
                        if got >= required {
                            break;
                        }
                    }
                    Err(err) => {
                        self.record_grant(requester, consumer, got);
                        return Err(MemoryError::Spill(format!(
                            "consumer {} failed to spill while raising {} bytes: {}",
                            handle.label(),
                            required - got,
                            err
                        )));
                    }
                }
            }
        }

        self.record_grant(requester, consumer, got);
        tracing::trace!(
            "task {}: acquired {} of {} requested bytes for consumer {}",
            self.task,
            got,
            required,
            requester
        );
        Ok(got)
    }

    fn record_grant(&self, id: ConsumerId, consumer: Option<&SharedConsumer>, got: u64) {
        if got == 0 {
            return;
        }
        let mut state = self.state.lock();
        let entry = state.consumers.entry(id).or_insert_with(|| ConsumerEntry {
            bytes: 0,
            handle: consumer.cloned(),
        });
        entry.bytes += got;
    }

    /// Return `size` bytes previously granted to a consumer. Zero is a
    /// no-op.
    ///
    /// Releasing more than the consumer's recorded balance is a caller
    /// bug: the stale entry is dropped and a warning logged, or the
    /// process panics when the pool runs with strict accounting. The
    /// bytes are forwarded to the pool either way, because the caller
    /// has freed real capacity whatever the local books say.
    pub fn release_execution_memory(&self, size: u64, consumer: Option<ConsumerId>) {
        if size == 0 {
            return;
        }
        let id = consumer.unwrap_or(ConsumerId::ANONYMOUS);
        {
            let mut state = self.state.lock();
            match state.consumers.entry(id) {
                Entry::Occupied(mut entry) => {
                    let held = entry.get().bytes;
                    if held > size {
                        entry.get_mut().bytes = held - size;
                    } else {
                        if held < size {
                            let msg = format!(
                                "consumer {id} released {size} bytes but only {held} were acquired"
                            );
                            tracing::warn!("{msg}");
                            if self.strict_accounting {
                                panic!("{msg}");
                            }
                        }
                        entry.remove();
                    }
                }
                Entry::Vacant(_) => {
                    let msg =
                        format!("released {size} bytes for consumer {id} with no memory on record");
                    tracing::warn!("{msg}");
                    if self.strict_accounting {
                        panic!("{msg}");
                    }
                }
            }
        }
        tracing::trace!(
            "task {}: released {} bytes from consumer {}",
            self.task,
            size,
            id
        );
        self.pool.release_execution_memory(size, self.task);
    }

    /// Allocate a block of `size` bytes tracked in the page table,
    /// intended for large regions shared between operators.
    ///
    /// Returns `Ok(None)` when no memory could be granted even after
    /// spilling; a partial grant produces a page of the granted size
    /// rather than the requested one. Requests above
    /// [`MAX_PAGE_SIZE_BYTES`] are rejected with a panic, and exhausting
    /// all [`PAGE_TABLE_SIZE`] slots is fatal after the provisional
    /// grant has been returned to the pool.
    pub fn allocate_page(
        &self,
        size: u64,
        consumer: Option<&SharedConsumer>,
    ) -> MemoryResult<Option<MemoryBlock>> {
        assert!(
            size <= MAX_PAGE_SIZE_BYTES,
            "cannot allocate a page of {size} bytes: the maximum page size is {MAX_PAGE_SIZE_BYTES} bytes"
        );

        let acquired = self.acquire_execution_memory(size, consumer)?;
        if acquired == 0 {
            return Ok(None);
        }
        let id = consumer.map(|c| ConsumerId::of(c.as_ref()));

        let mut state = self.state.lock();
        let Some(slot) = state.allocated_pages.first_zero() else {
            drop(state);
            self.release_execution_memory(acquired, id);
            panic!("all {PAGE_TABLE_SIZE} pages of this task are already allocated");
        };
        state.allocated_pages.set(slot, true);

        let mut page = match self.allocator.allocate(acquired) {
            Ok(page) => page,
            Err(err) => {
                state.allocated_pages.set(slot, false);
                drop(state);
                self.release_execution_memory(acquired, id);
                return Err(err);
            }
        };
        page.register(PageNumber::new(slot));
        state.page_table[slot] = Some(page.duplicate());
        drop(state);

        tracing::trace!(
            "task {}: allocated page {} ({} bytes)",
            self.task,
            slot,
            acquired
        );
        Ok(Some(page))
    }

    /// Free a page produced by [`allocate_page`], consuming the block.
    ///
    /// The page table entry is cleared before the memory is handed back
    /// to the allocator, and the accounting release happens last, so a
    /// concurrent address lookup never resolves to freed memory.
    ///
    /// [`allocate_page`]: TaskMemoryManager::allocate_page
    pub fn free_page(&self, mut page: MemoryBlock, consumer: Option<ConsumerId>) {
        let PageRegistration::Registered(number) = page.registration() else {
            panic!("cannot free memory that was not allocated as a page");
        };
        let slot = number.index();
        {
            let mut state = self.state.lock();
            assert!(
                state.allocated_pages[slot],
                "page {number} is not currently allocated"
            );
            let removed = state.page_table[slot].take();
            assert!(removed.is_some(), "page {number} has already been freed");
            state.allocated_pages.set(slot, false);
        }

        let size = page.size();
        page.deregister();
        self.allocator.free(page);
        tracing::trace!("task {}: freed page {} ({} bytes)", self.task, slot, size);
        self.release_execution_memory(size, consumer);
    }

    /// Pack an offset into a registered page into a single `u64`
    /// address.
    ///
    /// In on-heap mode `offset_in_page` is relative to the start of the
    /// page. In off-heap mode it is the absolute address of the target
    /// byte; the page's base address is subtracted before packing so the
    /// stored offset fits the low 51 bits.
    pub fn encode_page_address(&self, page: &MemoryBlock, offset_in_page: u64) -> u64 {
        let PageRegistration::Registered(number) = page.registration() else {
            panic!("cannot encode an address into memory that is not a registered page");
        };
        let offset = match self.mode {
            MemoryMode::OnHeap => offset_in_page,
            MemoryMode::OffHeap => offset_in_page.wrapping_sub(page.base_offset()),
        };
        addr::encode_page_address(number, offset)
    }

    /// Resolve a packed address to the heap store backing its page.
    ///
    /// Returns `None` in off-heap mode, where no managed object backs
    /// the memory and the absolute address from [`offset_in_page`] is
    /// all a caller needs. In on-heap mode the page must be live.
    ///
    /// [`offset_in_page`]: TaskMemoryManager::offset_in_page
    pub fn page_base(&self, addr: u64) -> Option<Arc<HeapStore>> {
        match self.mode {
            MemoryMode::OffHeap => None,
            MemoryMode::OnHeap => {
                let number = addr::decode_page_number(addr);
                let state = self.state.lock();
                let Some(page) = state.page_table[number.index()].as_ref() else {
                    panic!("address {addr:#x} points at page {number}, which is not allocated");
                };
                let Some(store) = page.heap_store() else {
                    panic!("page {number} has no heap backing");
                };
                Some(store.clone())
            }
        }
    }

    /// Recover the offset packed into an address.
    ///
    /// In on-heap mode this is the page-relative offset as encoded. In
    /// off-heap mode the page's base address is added back, yielding the
    /// absolute address originally passed to [`encode_page_address`].
    ///
    /// [`encode_page_address`]: TaskMemoryManager::encode_page_address
    pub fn offset_in_page(&self, addr: u64) -> u64 {
        let offset = addr::decode_offset(addr);
        match self.mode {
            MemoryMode::OnHeap => offset,
            MemoryMode::OffHeap => {
                let number = addr::decode_page_number(addr);
                let state = self.state.lock();
                let Some(page) = state.page_table[number.index()].as_ref() else {
                    panic!("address {addr:#x} points at page {number}, which is not allocated");
                };
                page.base_offset().wrapping_add(offset)
            }
        }
    }

    /// Log every consumer's granted bytes and the task total.
    pub fn show_memory_usage(&self) {
        tracing::info!("memory used in task {}", self.task);
        let mut tracked = 0u64;
        {
            let state = self.state.lock();
            for (id, entry) in &state.consumers {
                if entry.bytes == 0 {
                    continue;
                }
                tracked += entry.bytes;
                let label = entry
                    .handle
                    .as_ref()
                    .map_or_else(|| "anonymous".to_string(), |handle| handle.label());
                tracing::info!("acquired by {} ({}): {} bytes", label, id, entry.bytes);
            }
        }
        let total = self.memory_consumption();
        tracing::info!(
            "total: {} bytes acquired from the pool, {} bytes attributed to consumers",
            total,
            tracked
        );
    }

    /// Free every live page and release everything this task still holds
    /// in the pool. Returns the number of bytes freed; non-zero means
    /// some consumer leaked, which callers should surface as a warning.
    pub fn cleanup_all_allocated_memory(&self) -> u64 {
        let mut freed = 0u64;

        let pages: Vec<MemoryBlock> = {
            let mut state = self.state.lock();
            for (id, entry) in &state.consumers {
                if entry.bytes > 0 {
                    tracing::debug!(
                        "task {}: consumer {} left {} bytes unreleased",
                        self.task,
                        id,
                        entry.bytes
                    );
                }
            }
            let occupied: Vec<usize> = state.allocated_pages.iter_ones().collect();
            let mut pages = Vec::with_capacity(occupied.len());
            for slot in occupied {
                if let Some(page) = state.page_table[slot].take() {
                    state.allocated_pages.set(slot, false);
                    pages.push(page);
                }
            }
            pages
        };

        for mut page in pages {
            let size = page.size();
            if let Some(number) = page.page_number() {
                tracing::debug!(
                    "task {}: freeing unreleased page {} ({} bytes)",
                    self.task,
                    number,
                    size
                );
            }
            freed += size;
            page.deregister();
            self.allocator.free(page);
            self.release_execution_memory(size, None);
        }

        self.state.lock().consumers.clear();

        // Backstop for grants that never became pages.
        freed += self.pool.release_all_execution_memory_for_task(self.task);
        freed
    }

    /// Recommended page size, straight from the pool.
    pub fn page_size_bytes(&self) -> u64 {
        self.pool.page_size_bytes()
    }

    /// Bytes of execution memory the pool currently attributes to this
    /// task.
    pub fn memory_consumption(&self) -> u64 {
        self.pool.execution_memory_used_for_task(self.task)
    }

    #[cfg(test)]
    pub(crate) fn live_pages(&self) -> usize {
        self.state.lock().allocated_pages.count_ones()
    }

    #[cfg(test)]
    pub(crate) fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }
}

// Tests

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::path::PathBuf;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicU64, Ordering};

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::MemoryConfig;
    use crate::consumer::MemoryConsumer;
    use crate::pool::BoundedMemoryPool;

    fn harness(config: MemoryConfig) -> (Arc<BoundedMemoryPool>, Arc<TaskMemoryManager>) {
        let pool = Arc::new(BoundedMemoryPool::new(config).unwrap());
        let manager = Arc::new(TaskMemoryManager::new(pool.clone(), TaskId(1)));
        (pool, manager)
    }

    fn strict_config(capacity: u64) -> MemoryConfig {
        MemoryConfig {
            capacity,
            strict_accounting: true,
            ..MemoryConfig::default()
        }
    }

    enum SpillPolicy {
        /// Shed everything currently held, like a sorter dumping its
        /// whole run to disk.
        Everything,
        /// Hold on to all of it.
        Nothing,
        /// Simulate a failed disk write.
        Fail,
    }

    struct TestConsumer {
        manager: Arc<TaskMemoryManager>,
        me: Weak<TestConsumer>,
        name: &'static str,
        policy: SpillPolicy,
        used: Mutex<u64>,
        spilled: AtomicU64,
        spill_calls: AtomicU64,
    }

    impl TestConsumer {
        fn new(manager: &Arc<TaskMemoryManager>, name: &'static str) -> Arc<Self> {
            Self::with_policy(manager, name, SpillPolicy::Everything)
        }

        fn with_policy(
            manager: &Arc<TaskMemoryManager>,
            name: &'static str,
            policy: SpillPolicy,
        ) -> Arc<Self> {
            Arc::new_cyclic(|me| TestConsumer {
                manager: manager.clone(),
                me: me.clone(),
                name,
                policy,
                used: Mutex::new(0),
                spilled: AtomicU64::new(0),
                spill_calls: AtomicU64::new(0),
            })
        }

        fn shared(&self) -> SharedConsumer {
            self.me.upgrade().unwrap()
        }

        fn use_memory(&self, size: u64) -> u64 {
            let got = self
                .manager
                .acquire_execution_memory(size, Some(&self.shared()))
                .unwrap();
            *self.used.lock() += got;
            got
        }

        fn free_memory(&self, size: u64) {
            let released = {
                let mut used = self.used.lock();
                let released = size.min(*used);
                *used -= released;
                released
            };
            self.manager
                .release_execution_memory(released, Some(self.id()));
        }

        fn id(&self) -> ConsumerId {
            ConsumerId::of(self)
        }

        fn used(&self) -> u64 {
            *self.used.lock()
        }

        fn spilled(&self) -> u64 {
            self.spilled.load(Ordering::SeqCst)
        }

        fn spill_calls(&self) -> u64 {
            self.spill_calls.load(Ordering::SeqCst)
        }
    }

    impl MemoryConsumer for TestConsumer {
        fn spill(&self, _size: u64, _trigger: Option<ConsumerId>) -> MemoryResult<u64> {
            self.spill_calls.fetch_add(1, Ordering::SeqCst);
            match self.policy {
                SpillPolicy::Nothing => Ok(0),
                SpillPolicy::Fail => Err(MemoryError::Io(std::io::Error::other("disk full"))),
                SpillPolicy::Everything => {
                    let released = {
                        let mut used = self.used.lock();
                        std::mem::take(&mut *used)
                    };
                    self.spilled.fetch_add(released, Ordering::SeqCst);
                    self.manager
                        .release_execution_memory(released, Some(self.id()));
                    Ok(released)
                }
            }
        }

        fn label(&self) -> String {
            self.name.to_string()
        }
    }

    /// Buffers rows in memory and dumps them to a file when asked to
    /// make room for somebody else.
    struct DiskBackedBuffer {
        manager: Arc<TaskMemoryManager>,
        me: Weak<DiskBackedBuffer>,
        path: PathBuf,
        rows: Mutex<Vec<u8>>,
    }

    impl DiskBackedBuffer {
        fn new(manager: &Arc<TaskMemoryManager>, path: PathBuf) -> Arc<Self> {
            Arc::new_cyclic(|me| DiskBackedBuffer {
                manager: manager.clone(),
                me: me.clone(),
                path,
                rows: Mutex::new(Vec::new()),
            })
        }

        fn shared(&self) -> SharedConsumer {
            self.me.upgrade().unwrap()
        }

        fn append(&self, row: &[u8]) {
            let got = self
                .manager
                .acquire_execution_memory(row.len() as u64, Some(&self.shared()))
                .unwrap();
            assert_eq!(got, row.len() as u64);
            self.rows.lock().extend_from_slice(row);
        }
    }

    impl MemoryConsumer for DiskBackedBuffer {
        fn spill(&self, _size: u64, _trigger: Option<ConsumerId>) -> MemoryResult<u64> {
            let rows = std::mem::take(&mut *self.rows.lock());
            if rows.is_empty() {
                return Ok(0);
            }
            std::fs::write(&self.path, &rows)?;
            let released = rows.len() as u64;
            self.manager
                .release_execution_memory(released, Some(ConsumerId::of(self)));
            Ok(released)
        }

        fn label(&self) -> String {
            "disk-backed buffer".to_string()
        }
    }

    #[test]
    fn test_anonymous_accounting() {
        let (pool, manager) = harness(strict_config(100));

        assert_eq!(manager.acquire_execution_memory(60, None).unwrap(), 60);
        assert_eq!(manager.acquire_execution_memory(60, None).unwrap(), 40);
        assert_eq!(manager.acquire_execution_memory(60, None).unwrap(), 0);
        assert_eq!(manager.memory_consumption(), 100);
        assert_eq!(manager.consumer_count(), 1);

        manager.release_execution_memory(100, None);
        assert_eq!(manager.memory_consumption(), 0);
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(pool.memory_used(), 0);
    }

    #[test]
    fn test_cooperative_spilling() {
        let (_pool, manager) = harness(strict_config(100));
        let c1 = TestConsumer::new(&manager, "c1");
        let c2 = TestConsumer::new(&manager, "c2");

        c1.use_memory(100);
        assert_eq!(c1.used(), 100);
        assert_eq!(manager.memory_consumption(), 100);

        // The pool is exhausted, so c2 can only be served by spilling c1.
        c2.use_memory(100);
        assert_eq!(c1.used(), 0);
        assert_eq!(c2.used(), 100);
        assert_eq!(manager.memory_consumption(), 100);

        c1.use_memory(60);
        assert_eq!(c1.used(), 60);
        assert_eq!(c2.used(), 0);
        assert_eq!(manager.memory_consumption(), 60);

        // Enough headroom now for a direct grant.
        c2.use_memory(30);
        assert_eq!(c2.used(), 30);
        assert_eq!(manager.memory_consumption(), 90);

        manager.show_memory_usage();

        // Partly from the pool, the rest recovered from c2.
        c1.use_memory(40);
        assert_eq!(c1.used(), 100);
        assert_eq!(c2.used(), 0);
        assert_eq!(manager.memory_consumption(), 100);

        c1.free_memory(20);
        assert_eq!(manager.memory_consumption(), 80);

        c2.use_memory(10);
        assert_eq!(c2.used(), 10);

        c2.use_memory(100);
        assert_eq!(c1.used(), 0);
        assert_eq!(c2.used(), 100);
        assert_eq!(manager.memory_consumption(), 100);

        assert_eq!(c1.spilled(), 180);
        assert_eq!(c2.spilled(), 130);

        c1.free_memory(0);
        c2.free_memory(100);
        assert_eq!(manager.memory_consumption(), 0);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_consumer_is_never_asked_to_spill_for_itself() {
        let (_pool, manager) = harness(strict_config(100));
        let c1 = TestConsumer::new(&manager, "c1");

        assert_eq!(c1.use_memory(150), 100);
        assert_eq!(c1.use_memory(50), 0);
        assert_eq!(c1.spill_calls(), 0);
        assert_eq!(c1.used(), 100);

        c1.free_memory(100);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_zero_byte_spill_does_not_stop_the_scan() {
        let (pool, manager) = harness(strict_config(100));
        let stubborn = TestConsumer::with_policy(&manager, "stubborn", SpillPolicy::Nothing);
        let giver = TestConsumer::new(&manager, "giver");
        let asker = TestConsumer::new(&manager, "asker");

        stubborn.use_memory(40);
        giver.use_memory(60);

        // Whichever victim is tried first, the zero-byte result from
        // stubborn must not end the scan early.
        assert_eq!(asker.use_memory(80), 60);
        assert_eq!(stubborn.used(), 40);
        assert_eq!(giver.used(), 0);
        assert!(stubborn.spill_calls() >= 1);
        assert_eq!(giver.spill_calls(), 1);
        assert_eq!(pool.memory_used(), 100);

        // The backstop returns everything still held without pages.
        assert_eq!(manager.cleanup_all_allocated_memory(), 100);
        assert_eq!(pool.memory_used(), 0);
    }

    #[test]
    fn test_spill_failure_keeps_the_partial_grant() {
        let (_pool, manager) = harness(strict_config(100));
        let failing = TestConsumer::with_policy(&manager, "failing", SpillPolicy::Fail);
        let asker = TestConsumer::new(&manager, "asker");

        failing.use_memory(50);

        let shared: SharedConsumer = asker.clone();
        let err = manager
            .acquire_execution_memory(100, Some(&shared))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Spill(_)));
        assert!(err.to_string().contains("failing"));

        // The 50 bytes granted before the failure stay on asker's
        // account; releasing them must not trip strict accounting.
        assert_eq!(manager.memory_consumption(), 100);
        manager.release_execution_memory(50, Some(asker.id()));
        assert_eq!(manager.memory_consumption(), 50);

        failing.free_memory(50);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_spilling_to_disk_frees_memory_for_the_asker() {
        let (pool, manager) = harness(strict_config(64));
        let temp_dir = tempdir().unwrap();

        let buffer = DiskBackedBuffer::new(&manager, temp_dir.path().join("run-0.bin"));
        buffer.append(b"0123456789abcdef");
        buffer.append(b"0123456789ABCDEF");
        assert_eq!(pool.memory_used(), 32);

        // Serving the newcomer takes more than the pool has left, so
        // the buffer's contents end up on disk.
        let asker = TestConsumer::with_policy(&manager, "asker", SpillPolicy::Nothing);
        assert_eq!(asker.use_memory(48), 48);

        assert!(buffer.rows.lock().is_empty());
        let spilled = std::fs::read(temp_dir.path().join("run-0.bin")).unwrap();
        assert_eq!(spilled, b"0123456789abcdef0123456789ABCDEF");
        assert_eq!(pool.memory_used(), 48);
        assert_eq!(manager.cleanup_all_allocated_memory(), 48);
    }

    #[test]
    fn test_allocate_and_free_pages() {
        let (_pool, manager) = harness(strict_config(1 << 20));

        let first = manager.allocate_page(4096, None).unwrap().unwrap();
        let second = manager.allocate_page(4096, None).unwrap().unwrap();
        assert_eq!(first.page_number(), Some(PageNumber::new(0)));
        assert_eq!(second.page_number(), Some(PageNumber::new(1)));
        assert_eq!(first.size(), 4096);
        assert_eq!(manager.memory_consumption(), 8192);
        assert_eq!(manager.live_pages(), 2);

        manager.free_page(first, None);
        assert_eq!(manager.memory_consumption(), 4096);
        assert_eq!(manager.live_pages(), 1);

        // The lowest free slot is always taken first.
        let third = manager.allocate_page(4096, None).unwrap().unwrap();
        assert_eq!(third.page_number(), Some(PageNumber::new(0)));

        manager.free_page(second, None);
        manager.free_page(third, None);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_allocate_page_returns_none_when_nothing_is_granted() {
        let (_pool, manager) = harness(strict_config(0));

        assert!(manager.allocate_page(4096, None).unwrap().is_none());
        assert!(
            manager
                .allocate_page(MAX_PAGE_SIZE_BYTES, None)
                .unwrap()
                .is_none()
        );
        assert_eq!(manager.live_pages(), 0);
        assert_eq!(manager.memory_consumption(), 0);
    }

    #[test]
    fn test_allocate_page_uses_the_granted_size() {
        let (_pool, manager) = harness(strict_config(100));

        assert_eq!(manager.acquire_execution_memory(60, None).unwrap(), 60);

        // Only 40 bytes are left, so the page shrinks to the grant.
        let page = manager.allocate_page(100, None).unwrap().unwrap();
        assert_eq!(page.size(), 40);
        assert_eq!(manager.memory_consumption(), 100);

        manager.free_page(page, None);
        assert_eq!(manager.memory_consumption(), 60);
        assert_eq!(manager.cleanup_all_allocated_memory(), 60);
    }

    #[test]
    #[should_panic(expected = "maximum page size")]
    fn test_oversized_page_request_panics() {
        let (_pool, manager) = harness(strict_config(100));
        let _ = manager.allocate_page(MAX_PAGE_SIZE_BYTES + 1, None);
    }

    #[test]
    fn test_page_table_exhaustion_releases_the_grant() {
        let page_size = 256u64;
        let (pool, manager) = harness(strict_config((PAGE_TABLE_SIZE as u64 + 1) * page_size));

        let mut pages = Vec::with_capacity(PAGE_TABLE_SIZE);
        for _ in 0..PAGE_TABLE_SIZE {
            pages.push(manager.allocate_page(page_size, None).unwrap().unwrap());
        }
        assert_eq!(manager.live_pages(), PAGE_TABLE_SIZE);

        let result = catch_unwind(AssertUnwindSafe(|| manager.allocate_page(page_size, None)));
        assert!(result.is_err());

        // The grant for the failed attempt went back to the pool.
        assert_eq!(pool.memory_used(), PAGE_TABLE_SIZE as u64 * page_size);

        for page in pages {
            manager.free_page(page, None);
        }
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
        assert_eq!(pool.memory_used(), 0);
    }

    #[test]
    fn test_heap_address_round_trip() {
        let (_pool, manager) = harness(strict_config(1 << 20));
        let page = manager.allocate_page(4096, None).unwrap().unwrap();
        let number = page.page_number().unwrap();

        let addr = manager.encode_page_address(&page, 64);
        assert_eq!(addr::decode_page_number(addr), number);
        assert_eq!(addr::decode_offset(addr), 64);

        unsafe { page.write_u64(64, 0x00C0_FFEE) };
        let store = manager.page_base(addr).unwrap();
        assert!(Arc::ptr_eq(&store, page.heap_store().unwrap()));
        let offset = manager.offset_in_page(addr);
        assert_eq!(offset, 64);
        assert_eq!(unsafe { store.read_u64(offset) }, 0x00C0_FFEE);

        manager.free_page(page, None);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_off_heap_address_round_trip() {
        let (_pool, manager) = harness(MemoryConfig {
            capacity: 1 << 20,
            mode: MemoryMode::OffHeap,
            strict_accounting: true,
            ..MemoryConfig::default()
        });
        let page = manager.allocate_page(4096, None).unwrap().unwrap();
        let base = page.base_offset();
        assert_ne!(base, 0);

        // Off-heap callers address memory by absolute location; only the
        // page-relative part is packed.
        let absolute = base + 128;
        let addr = manager.encode_page_address(&page, absolute);
        assert_eq!(addr::decode_offset(addr), 128);
        assert!(manager.page_base(addr).is_none());
        assert_eq!(manager.offset_in_page(addr), absolute);

        unsafe { page.write_u64(128, 0xFEED_FACE) };
        let resolved = manager.offset_in_page(addr) as usize as *const u64;
        assert_eq!(unsafe { std::ptr::read_unaligned(resolved) }, 0xFEED_FACE);

        manager.free_page(page, None);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_over_release_warns_and_drops_the_entry() {
        let (pool, manager) = harness(MemoryConfig {
            capacity: 100,
            ..MemoryConfig::default()
        });

        assert_eq!(manager.acquire_execution_memory(100, None).unwrap(), 100);
        manager.release_execution_memory(150, None);

        // The stale entry is gone and the pool clamped the release.
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(manager.memory_consumption(), 0);
        assert_eq!(pool.memory_used(), 0);
    }

    #[test]
    fn test_unknown_consumer_release_is_forwarded() {
        let (pool, manager) = harness(MemoryConfig {
            capacity: 100,
            ..MemoryConfig::default()
        });

        manager.release_execution_memory(64, None);
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(pool.memory_used(), 0);
    }

    #[test]
    #[should_panic(expected = "released 150 bytes but only 100")]
    fn test_over_release_panics_in_strict_mode() {
        let (_pool, manager) = harness(strict_config(100));
        assert_eq!(manager.acquire_execution_memory(100, None).unwrap(), 100);
        manager.release_execution_memory(150, None);
    }

    #[test]
    #[should_panic(expected = "no memory on record")]
    fn test_unknown_consumer_release_panics_in_strict_mode() {
        let (_pool, manager) = harness(strict_config(100));
        manager.release_execution_memory(64, None);
    }

    #[test]
    fn test_cleanup_frees_leaked_pages_and_grants() {
        let (pool, manager) = harness(MemoryConfig {
            capacity: 1 << 20,
            ..MemoryConfig::default()
        });

        let _leaked_one = manager.allocate_page(4096, None).unwrap().unwrap();
        let _leaked_two = manager.allocate_page(512, None).unwrap().unwrap();
        assert_eq!(manager.acquire_execution_memory(100, None).unwrap(), 100);

        assert_eq!(manager.cleanup_all_allocated_memory(), 4096 + 512 + 100);
        assert_eq!(manager.live_pages(), 0);
        assert_eq!(manager.consumer_count(), 0);
        assert_eq!(pool.memory_used(), 0);

        // A second pass finds nothing left.
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    #[should_panic(expected = "not allocated as a page")]
    fn test_freeing_an_unregistered_block_panics() {
        let (_pool, manager) = harness(strict_config(100));
        let store = Arc::new(HeapStore::zeroed(64).unwrap());
        let block = MemoryBlock::heap(store, 64);
        manager.free_page(block, None);
    }

    #[test]
    #[should_panic(expected = "is not currently allocated")]
    fn test_double_free_panics() {
        let (_pool, manager) = harness(strict_config(1 << 20));
        let page = manager.allocate_page(4096, None).unwrap().unwrap();
        let ghost = page.duplicate();
        manager.free_page(page, None);
        manager.free_page(ghost, None);
    }

    #[test]
    #[should_panic(expected = "which is not allocated")]
    fn test_resolving_a_freed_page_panics() {
        let (_pool, manager) = harness(strict_config(1 << 20));
        let page = manager.allocate_page(4096, None).unwrap().unwrap();
        let addr = manager.encode_page_address(&page, 0);
        manager.free_page(page, None);
        let _ = manager.page_base(addr);
    }

    #[test]
    fn test_concurrent_use_and_release() {
        let (pool, manager) = harness(strict_config(512));

        std::thread::scope(|scope| {
            for name in ["w1", "w2", "w3", "w4"] {
                let manager = manager.clone();
                scope.spawn(move || {
                    let consumer = TestConsumer::new(&manager, name);
                    for _ in 0..25 {
                        consumer.use_memory(64);
                        consumer.use_memory(192);
                        consumer.free_memory(consumer.used());
                    }
                    consumer.free_memory(consumer.used());
                });
            }
        });

        assert_eq!(manager.memory_consumption(), 0);
        assert_eq!(pool.memory_used(), 0);
        assert_eq!(manager.cleanup_all_allocated_memory(), 0);
    }

    #[test]
    fn test_page_size_pass_through() {
        let (_pool, manager) = harness(MemoryConfig {
            capacity: 1024,
            page_size: 256,
            ..MemoryConfig::default()
        });
        assert_eq!(manager.page_size_bytes(), 256);
        assert_eq!(manager.memory_mode(), MemoryMode::OnHeap);
        assert_eq!(manager.task(), TaskId(1));
    }
}
