//! The slice of the file system interface the virtual memory system relies on.
//!
//! The file system itself serializes on one global lock. Every [`File`]
//! operation takes the [`FsGuard`] proving that lock is held, so a file call
//! without the lock does not compile.

use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::sync::Arc;

/// The global file system lock.
#[derive(Default)]
pub struct FsLock(Mutex<()>);

/// Proof that the global file system lock is held.
pub struct FsGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl FsLock {
    pub const fn new() -> Self {
        Self(Mutex::new(()))
    }

    pub fn lock(&self) -> FsGuard<'_> {
        FsGuard(self.0.lock())
    }
}

/// An open file.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number of
    /// bytes read, which is short at end of file.
    fn read_at(&self, fs: &FsGuard<'_>, buf: &mut [u8], offset: u64) -> usize;

    /// Writes `buf` at `offset`. Returns the number of bytes written.
    fn write_at(&self, fs: &FsGuard<'_>, buf: &[u8], offset: u64) -> usize;

    /// Length of the file in bytes.
    fn length(&self, fs: &FsGuard<'_>) -> u64;

    /// Opens a new, independent handle to the same file. Closing either handle
    /// does not affect the other.
    fn reopen(&self, fs: &FsGuard<'_>) -> Arc<dyn File>;

    /// Closes this handle.
    fn close(&self, fs: &FsGuard<'_>);
}
