//! Memory blocks and their backing storage.
//!
//! A [`MemoryBlock`] is the handle a consumer receives for one allocated
//! region. Heap-mode blocks share a [`HeapStore`] with the owning page
//! table so an encoded address can be resolved back to live storage;
//! off-heap blocks carry their absolute base address and nothing else.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::addr::PageNumber;
use crate::error::{MemoryError, MemoryResult};

// Heap backing store

/// Word-aligned storage backing one heap-mode page.
///
/// Shared between the page table and the consumer's block handle; the
/// region is fixed for the life of the store, so a store-relative byte
/// offset stays valid as long as any handle is held.
pub struct HeapStore {
    ptr: NonNull<u64>,
    words: usize,
}

// Access goes through raw pointers with caller-synchronized offsets.
unsafe impl Send for HeapStore {}
unsafe impl Sync for HeapStore {}

impl HeapStore {
    /// Allocate a zeroed store covering at least `size` bytes.
    pub(crate) fn zeroed(size: u64) -> MemoryResult<HeapStore> {
        let words = (size as usize).div_ceil(8);
        let layout = Layout::from_size_align(words * 8, 8)
            .map_err(|_| MemoryError::Allocation(format!("invalid layout for {} bytes", size)))?;
        let Some(ptr) = NonNull::new(unsafe { alloc_zeroed(layout) }.cast::<u64>()) else {
            std::alloc::handle_alloc_error(layout);
        };
        Ok(HeapStore { ptr, words })
    }

    /// Capacity in bytes (whole words, rounded up from the requested size).
    #[inline]
    pub fn len(&self) -> usize {
        self.words * 8
    }

    /// Check if the store covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// Backing length in words, used as the recycling bucket key.
    #[inline]
    pub(crate) fn word_len(&self) -> usize {
        self.words
    }

    /// Overwrite every byte of the store.
    pub(crate) fn fill(&mut self, value: u8) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().cast::<u8>(), value, self.len()) };
    }

    #[inline]
    fn at(&self, offset: u64) -> *mut u8 {
        self.ptr.as_ptr().cast::<u8>().wrapping_add(offset as usize)
    }

    /// Read a u64 at a store-relative byte offset.
    ///
    /// # Safety
    ///
    /// `offset + 8` must be within the store, and the caller must
    /// synchronize with any concurrent writer of that range.
    #[inline]
    pub unsafe fn read_u64(&self, offset: u64) -> u64 {
        debug_assert!(offset + 8 <= self.len() as u64);
        unsafe { std::ptr::read_unaligned(self.at(offset).cast::<u64>()) }
    }

    /// Write a u64 at a store-relative byte offset.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeapStore::read_u64`].
    #[inline]
    pub unsafe fn write_u64(&self, offset: u64, value: u64) {
        debug_assert!(offset + 8 <= self.len() as u64);
        unsafe { std::ptr::write_unaligned(self.at(offset).cast::<u64>(), value) };
    }

    /// Copy `dst.len()` bytes out of the store starting at `offset`.
    ///
    /// # Safety
    ///
    /// The source range must be within the store and free of concurrent
    /// writers.
    pub unsafe fn read_bytes(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() as u64 <= self.len() as u64);
        unsafe { std::ptr::copy_nonoverlapping(self.at(offset), dst.as_mut_ptr(), dst.len()) };
    }

    /// Copy `src` into the store starting at `offset`.
    ///
    /// # Safety
    ///
    /// The destination range must be within the store and free of
    /// concurrent readers or writers.
    pub unsafe fn write_bytes(&self, offset: u64, src: &[u8]) {
        debug_assert!(offset + src.len() as u64 <= self.len() as u64);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.at(offset), src.len()) };
    }
}

impl Drop for HeapStore {
    fn drop(&mut self) {
        // Matches the layout built in zeroed().
        let layout = unsafe { Layout::from_size_align_unchecked(self.words * 8, 8) };
        unsafe { dealloc(self.ptr.as_ptr().cast::<u8>(), layout) };
    }
}

// Registration state

/// Page table membership of a block.
///
/// The transition to `Registered` happens exactly once, when a manager
/// places the block in its page table; freeing reverts it. Blocks never
/// register themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRegistration {
    /// Not (or no longer) tracked by a page table.
    Unregistered,
    /// Occupying the given page table slot.
    Registered(PageNumber),
}

// Memory block

/// Backing storage of a block.
#[derive(Clone)]
pub(crate) enum BlockBase {
    /// Managed heap words, shared with the owning page table.
    Heap(Arc<HeapStore>),
    /// Raw native memory; the block's base offset is the absolute address.
    OffHeap,
}

impl fmt::Debug for BlockBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockBase::Heap(_) => f.write_str("Heap"),
            BlockBase::OffHeap => f.write_str("OffHeap"),
        }
    }
}

/// One allocated region of task memory.
///
/// Produced by an allocator, registered into a page table by the manager,
/// and consumed by [`free_page`]. Accessor offsets are relative to the
/// start of the block in both modes.
///
/// [`free_page`]: crate::task::TaskMemoryManager::free_page
#[derive(Debug)]
pub struct MemoryBlock {
    base: BlockBase,
    base_offset: u64,
    size: u64,
    registration: PageRegistration,
}

impl MemoryBlock {
    pub(crate) fn heap(store: Arc<HeapStore>, size: u64) -> MemoryBlock {
        debug_assert!(size as usize <= store.len());
        MemoryBlock {
            base: BlockBase::Heap(store),
            base_offset: 0,
            size,
            registration: PageRegistration::Unregistered,
        }
    }

    pub(crate) fn off_heap(addr: u64, size: u64) -> MemoryBlock {
        MemoryBlock {
            base: BlockBase::OffHeap,
            base_offset: addr,
            size,
            registration: PageRegistration::Unregistered,
        }
    }

    /// Size of the block in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Base offset: zero for heap blocks, the absolute address for
    /// off-heap blocks.
    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Current page table membership.
    #[inline]
    pub fn registration(&self) -> PageRegistration {
        self.registration
    }

    /// Page number, if the block is currently registered.
    #[inline]
    pub fn page_number(&self) -> Option<PageNumber> {
        match self.registration {
            PageRegistration::Registered(number) => Some(number),
            PageRegistration::Unregistered => None,
        }
    }

    /// Heap backing store, if this is a heap-mode block.
    #[inline]
    pub fn heap_store(&self) -> Option<&Arc<HeapStore>> {
        match &self.base {
            BlockBase::Heap(store) => Some(store),
            BlockBase::OffHeap => None,
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> &BlockBase {
        &self.base
    }

    pub(crate) fn into_base(self) -> BlockBase {
        self.base
    }

    /// Mark the block as occupying a page table slot.
    pub(crate) fn register(&mut self, number: PageNumber) {
        assert!(
            self.registration == PageRegistration::Unregistered,
            "block is already registered as page {:?} and cannot become page {}",
            self.registration,
            number
        );
        self.registration = PageRegistration::Registered(number);
    }

    /// Clear page table membership.
    pub(crate) fn deregister(&mut self) {
        self.registration = PageRegistration::Unregistered;
    }

    /// Second handle over the same region, for the page table.
    pub(crate) fn duplicate(&self) -> MemoryBlock {
        MemoryBlock {
            base: self.base.clone(),
            base_offset: self.base_offset,
            size: self.size,
            registration: self.registration,
        }
    }

    #[inline]
    fn addr_of(&self, offset: u64, len: u64) -> *mut u8 {
        debug_assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            "{} byte access at offset {} is out of bounds for a {} byte block",
            len,
            offset,
            self.size
        );
        match &self.base {
            BlockBase::Heap(store) => store.at(offset),
            BlockBase::OffHeap => self.base_offset.wrapping_add(offset) as usize as *mut u8,
        }
    }

    /// Read a u8 at a block-relative byte offset.
    ///
    /// # Safety
    ///
    /// The offset must be within the block, and the caller must
    /// synchronize with any concurrent writer of that range.
    #[inline]
    pub unsafe fn read_u8(&self, offset: u64) -> u8 {
        unsafe { *self.addr_of(offset, 1) }
    }

    /// Write a u8 at a block-relative byte offset.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemoryBlock::read_u8`].
    #[inline]
    pub unsafe fn write_u8(&self, offset: u64, value: u8) {
        unsafe { *self.addr_of(offset, 1) = value };
    }

    /// Read a u32 at a block-relative byte offset. Unaligned offsets are
    /// allowed.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemoryBlock::read_u8`], over four bytes.
    #[inline]
    pub unsafe fn read_u32(&self, offset: u64) -> u32 {
        unsafe { std::ptr::read_unaligned(self.addr_of(offset, 4).cast::<u32>()) }
    }

    /// Write a u32 at a block-relative byte offset.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemoryBlock::read_u32`].
    #[inline]
    pub unsafe fn write_u32(&self, offset: u64, value: u32) {
        unsafe { std::ptr::write_unaligned(self.addr_of(offset, 4).cast::<u32>(), value) };
    }

    /// Read a u64 at a block-relative byte offset. Unaligned offsets are
    /// allowed.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemoryBlock::read_u8`], over eight bytes.
    #[inline]
    pub unsafe fn read_u64(&self, offset: u64) -> u64 {
        unsafe { std::ptr::read_unaligned(self.addr_of(offset, 8).cast::<u64>()) }
    }

    /// Write a u64 at a block-relative byte offset.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemoryBlock::read_u64`].
    #[inline]
    pub unsafe fn write_u64(&self, offset: u64, value: u64) {
        unsafe { std::ptr::write_unaligned(self.addr_of(offset, 8).cast::<u64>(), value) };
    }

    /// Copy bytes out of the block starting at `offset`.
    ///
    /// # Safety
    ///
    /// The source range must be within the block and free of concurrent
    /// writers.
    pub unsafe fn read_bytes(&self, offset: u64, dst: &mut [u8]) {
        let src = self.addr_of(offset, dst.len() as u64);
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }

    /// Copy `src` into the block starting at `offset`.
    ///
    /// # Safety
    ///
    /// The destination range must be within the block and free of
    /// concurrent readers or writers.
    pub unsafe fn write_bytes(&self, offset: u64, src: &[u8]) {
        let dst = self.addr_of(offset, src.len() as u64);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }
}

// Tests
