use thiserror::Error;

pub type Result<T> = core::result::Result<T, VmError>;

/// Errors from the supplemental page table and demand paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("read length {read_bytes} and zero length {zero_bytes} do not add up to a page")]
    BadLength { read_bytes: usize, zero_bytes: usize },
    #[error("address {0:#x} is not page aligned")]
    Misaligned(usize),
    #[error("address {0:#x} is not a user address")]
    NotUser(usize),
    #[error("page {0:#x} is already in the supplemental page table")]
    PageExists(usize),
    #[error("page {0:#x} is already resident")]
    AlreadyResident(usize),
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("could not map page {0:#x}")]
    MapFailed(usize),
}

/// Errors from creating a memory mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmapError {
    #[error("cannot map a file at {0:#x}")]
    BadAddress(usize),
    #[error("cannot map an empty file")]
    EmptyFile,
    #[error(transparent)]
    Page(#[from] VmError),
}
