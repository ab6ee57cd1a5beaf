//! Encoded page addresses.
//!
//! A location inside a task's memory is packed into a single u64 so that
//! operators can store pointers to their own data as plain words: the top
//! 13 bits index the task's page table, the low 51 bits carry an offset
//! within that page. Heap pages cannot be addressed by raw pointer (their
//! backing store may move), so the page number is the stable half of the
//! address and the table resolves it back to a base.

// Address layout constants

/// Number of bits used for the page number in an encoded address.
pub const PAGE_NUMBER_BITS: u32 = 13;

/// Number of bits used for the in-page offset in an encoded address.
pub const OFFSET_BITS: u32 = 64 - PAGE_NUMBER_BITS;

/// Number of slots in a task's page table.
pub const PAGE_TABLE_SIZE: usize = 1 << PAGE_NUMBER_BITS;

/// Mask selecting the offset bits of an encoded address.
pub const OFFSET_MASK: u64 = (1u64 << OFFSET_BITS) - 1;

/// Mask selecting the page number bits of an encoded address.
pub const PAGE_NUMBER_MASK: u64 = !OFFSET_MASK;

/// Largest page a task may allocate, in bytes.
///
/// The offset field could address far more, but heap pages are backed by
/// u64 word arrays and capped at ((1 << 31) - 1) * 8 bytes; the same cap
/// applies in both modes so that addresses stay interchangeable.
pub const MAX_PAGE_SIZE_BYTES: u64 = ((1u64 << 31) - 1) * 8;

// Page numbers

/// Index of a slot in a task's page table.
///
/// Always names a valid slot; a block that has never been registered has
/// no page number at all (see [`PageRegistration`]).
///
/// [`PageRegistration`]: crate::block::PageRegistration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageNumber(u16);

impl PageNumber {
    /// Create a page number, asserting the slot exists.
    #[inline]
    pub fn new(index: usize) -> Self {
        assert!(
            index < PAGE_TABLE_SIZE,
            "page number {} does not address a page table slot",
            index
        );
        PageNumber(index as u16)
    }

    /// Slot index into the page table.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PageNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Packing and unpacking

/// Pack a page number and an in-page offset into one u64.
///
/// Offset bits above the low 51 are silently truncated; callers are
/// responsible for passing page-relative offsets that fit.
#[inline]
pub fn encode_page_address(page: PageNumber, offset_in_page: u64) -> u64 {
    ((page.index() as u64) << OFFSET_BITS) | (offset_in_page & OFFSET_MASK)
}

/// Extract the page number from an encoded address.
#[inline]
pub fn decode_page_number(addr: u64) -> PageNumber {
    // The 13-bit field cannot hold an out-of-range slot index.
    PageNumber(((addr & PAGE_NUMBER_MASK) >> OFFSET_BITS) as u16)
}

/// Extract the in-page offset from an encoded address.
#[inline]
pub fn decode_offset(addr: u64) -> u64 {
    addr & OFFSET_MASK
}

// Tests
