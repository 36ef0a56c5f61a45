use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

/// Number of block sectors backing one page of swap.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE as usize;

const _: () = assert!(
    PAGE_FRAME_SIZE % SECTOR_SIZE as usize == 0,
    "a page must hold a whole number of sectors"
);

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Lowest address a user program may touch. Everything below stays unmapped so
/// that null and near-null pointers fault.
pub const USER_BASE: usize = 0x08048000;

/// User stacks grow down from the top of user space.
pub const USER_STACK_TOP: usize = OFFSET;

/// Maximum size a user stack may grow to.
pub const STACK_LIMIT: usize = 8 * MB;

/// How far below the stack pointer an access may land and still count as stack
/// growth. `pusha` writes 32 bytes below `esp` before moving it.
pub const STACK_SLACK: usize = 32;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

/// Returns `true` if `addr` lies in the part of the address space user
/// programs are allowed to access.
#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr >= USER_BASE && addr < OFFSET
}
