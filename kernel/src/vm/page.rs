//! Supplemental page table entries: what backs a user page and whether it is
//! resident.

use super::swap::SwapSlot;
use crate::fs::File;
use crate::mem::Frame;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

/// A page-sized window onto a file: `read_bytes` bytes at `offset`, followed by
/// `zero_bytes` zeroes.
#[derive(Clone)]
pub struct FileRegion {
    pub file: Arc<dyn File>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// Where a page's contents come from when it is not resident.
#[derive(Clone)]
pub enum Backing {
    /// Anonymous memory, kept in swap while evicted. Stack pages are of this kind.
    Swap,
    /// A read-only or private region of an executable.
    File(FileRegion),
    /// A region of a file mapped with `mmap`. Changes are written back.
    Mmap(FileRegion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Swap,
    File,
    Mmap,
}

#[derive(Default)]
pub(crate) struct PageState {
    /// The frame holding the page, set iff the page is resident and mapped.
    pub frame: Option<Frame>,
    /// The slot holding the page while it is swapped out.
    pub swap_slot: Option<SwapSlot>,
    /// A file page that was written to and can no longer be rebuilt from its
    /// file. It goes to swap like anonymous memory from then on.
    pub anonymous: bool,
}

pub struct Page {
    upage: usize,
    writable: bool,
    backing: Backing,
    /// Set while the page is being loaded, evicted or torn down.
    pinned: AtomicBool,
    state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(upage: usize, writable: bool, backing: Backing) -> Self {
        Self {
            upage,
            writable,
            backing,
            pinned: AtomicBool::new(false),
            state: Mutex::default(),
        }
    }

    pub fn upage(&self) -> usize {
        self.upage
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// How the page is preserved when evicted.
    pub fn kind(&self) -> PageKind {
        match self.backing {
            Backing::Swap => PageKind::Swap,
            Backing::File(_) if self.state.lock().anonymous => PageKind::Swap,
            Backing::File(_) => PageKind::File,
            Backing::Mmap(_) => PageKind::Mmap,
        }
    }

    pub fn file_region(&self) -> Option<&FileRegion> {
        match &self.backing {
            Backing::Swap => None,
            Backing::File(region) | Backing::Mmap(region) => Some(region),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.state.lock().frame.is_some()
    }

    pub fn frame(&self) -> Option<Frame> {
        self.state.lock().frame
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.state.lock().swap_slot
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    /// Pins the page, waiting for whoever holds the pin to release it.
    pub fn pin(&self) {
        while !self.try_pin() {
            core::hint::spin_loop();
        }
    }

    /// Pins the page if nobody else has it pinned.
    pub fn try_pin(&self) -> bool {
        self.pinned
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unpin(&self) {
        let was_pinned = self.pinned.swap(false, Ordering::Release);
        debug_assert!(was_pinned, "unpinning unpinned page {:#x}", self.upage);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("upage", &format_args!("{:#x}", self.upage))
            .field("kind", &self.kind())
            .field("writable", &self.writable)
            .field("pinned", &self.is_pinned())
            .finish_non_exhaustive()
    }
}
