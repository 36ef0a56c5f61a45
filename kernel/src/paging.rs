// https://wiki.osdev.org/Paging

use crate::mem::Frame;
use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use arbitrary_int::u20;
use bitbybit::bitfield;
use kidneyos_shared::mem::{is_page_aligned, page_offset, page_round_down, PAGE_FRAME_SIZE};

/// The hardware page table operations the virtual memory system needs for one
/// process's address space.
///
/// Every method takes `&self`: the frame table evicts pages out of other
/// processes' address spaces while those processes may be running.
pub trait PageManager: Send + Sync {
    /// Map the user page `upage` to `frame`.
    ///
    /// Returns `false` if `upage` is already mapped or the page table could not be
    /// extended.
    #[must_use]
    fn map(&self, upage: usize, frame: Frame, writable: bool) -> bool;

    /// Remove the mapping for `upage`, if any. Returns whether the page was dirty
    /// at the moment it was unmapped, so that no store can slip in between
    /// checking the dirty bit and tearing the mapping down.
    fn unmap(&self, upage: usize) -> bool;

    /// The frame `upage` is mapped to.
    fn translate(&self, upage: usize) -> Option<Frame>;

    fn is_accessed(&self, upage: usize) -> bool;

    fn set_accessed(&self, upage: usize, accessed: bool);
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    fn user_page(frame: Frame, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(u20::new(frame.pfn()))
    }
}

/// A page fault raised by a simulated user access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address.
    pub addr: usize,
    /// The access was a store.
    pub write: bool,
    /// The page was present, i.e. this is a protection fault.
    pub present: bool,
}

/// A page table kept in kernel memory and walked in software.
///
/// Besides implementing [`PageManager`] it plays the part of the MMU for user
/// accesses: [`SoftPageManager::load`] and [`SoftPageManager::store`] go through
/// the table, set the accessed and dirty bits, and report page faults.
#[derive(Default)]
pub struct SoftPageManager {
    entries: Mutex<BTreeMap<usize, (PageTableEntry, Frame)>>,
    /// Maximum number of mappings, standing in for running out of page tables.
    limit: Option<usize>,
}

impl SoftPageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A page manager that refuses to hold more than `limit` mappings.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::default(),
            limit: Some(limit),
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_writable(&self, upage: usize) -> Option<bool> {
        self.entries
            .lock()
            .get(&page_round_down(upage))
            .map(|(pte, _)| pte.read_write())
    }

    /// Read `buf.len()` bytes of user memory starting at `vaddr`.
    ///
    /// # Errors
    ///
    /// Returns the first fault hit. Bytes before the faulting page have been
    /// copied already.
    pub fn load(&self, vaddr: usize, buf: &mut [u8]) -> Result<(), PageFault> {
        self.access(vaddr, buf.len(), false, |frame, at, range| {
            // SAFETY: The mapping, and so the frame, cannot go away while the table
            // is locked.
            buf[range.clone()].copy_from_slice(unsafe { &frame.as_slice()[at..at + range.len()] });
        })
    }

    /// Write `data` to user memory starting at `vaddr`.
    ///
    /// # Errors
    ///
    /// Returns the first fault hit, including stores to read-only pages.
    pub fn store(&self, vaddr: usize, data: &[u8]) -> Result<(), PageFault> {
        self.access(vaddr, data.len(), true, |frame, at, range| {
            // SAFETY: As in `load`.
            unsafe { frame.as_mut_slice()[at..at + range.len()].copy_from_slice(&data[range]) };
        })
    }

    fn access(
        &self,
        vaddr: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(Frame, usize, core::ops::Range<usize>),
    ) -> Result<(), PageFault> {
        let mut entries = self.entries.lock();
        let mut done = 0;
        while done < len {
            let addr = vaddr + done;
            let at = page_offset(addr);
            let chunk = (PAGE_FRAME_SIZE - at).min(len - done);
            let Some((pte, frame)) = entries.get_mut(&page_round_down(addr)) else {
                return Err(PageFault {
                    addr,
                    write,
                    present: false,
                });
            };
            debug_assert!(pte.present() && pte.user_supervisor());
            if write && !pte.read_write() {
                return Err(PageFault {
                    addr,
                    write,
                    present: true,
                });
            }
            *pte = pte.with_accessed(true).with_dirty(pte.dirty() || write);
            copy(*frame, at, done..done + chunk);
            done += chunk;
        }
        Ok(())
    }
}

impl PageManager for SoftPageManager {
    fn map(&self, upage: usize, frame: Frame, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage) || self.limit.is_some_and(|limit| entries.len() >= limit) {
            return false;
        }
        entries.insert(upage, (PageTableEntry::user_page(frame, writable), frame));
        true
    }

    fn unmap(&self, upage: usize) -> bool {
        self.entries
            .lock()
            .remove(&upage)
            .is_some_and(|(pte, _)| pte.dirty())
    }

    fn translate(&self, upage: usize) -> Option<Frame> {
        self.entries.lock().get(&upage).map(|(_, frame)| *frame)
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|(pte, _)| pte.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        if let Some((pte, _)) = self.entries.lock().get_mut(&upage) {
            *pte = pte.with_accessed(accessed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::frame_allocator::UserPool;
    use crate::mem::{FrameAllocator, PallocFlags};

    const PAGE: usize = 0x1000_0000;

    fn frame() -> Frame {
        let mut pool: UserPool = UserPool::with_frames(1);
        pool.alloc(PallocFlags::for_user(true)).unwrap()
    }

    #[test]
    fn store_sets_accessed_and_dirty() {
        let pm = SoftPageManager::new();
        let frame = frame();
        assert!(pm.map(PAGE, frame, true));
        assert!(!pm.is_accessed(PAGE));

        let mut buf = [0; 3];
        pm.load(PAGE + 10, &mut buf).unwrap();
        assert!(pm.is_accessed(PAGE));

        pm.store(PAGE + 10, b"abc").unwrap();
        assert_eq!(&unsafe { frame.as_slice() }[10..13], b"abc");

        pm.set_accessed(PAGE, false);
        assert!(!pm.is_accessed(PAGE));
        assert!(pm.unmap(PAGE));
        assert_eq!(pm.translate(PAGE), None);
        assert!(!pm.unmap(PAGE));
    }

    #[test]
    fn loads_leave_pages_clean() {
        let pm = SoftPageManager::new();
        assert!(pm.map(PAGE, frame(), true));
        let mut buf = [0; 8];
        pm.load(PAGE, &mut buf).unwrap();
        assert!(!pm.unmap(PAGE));
    }

    #[test]
    fn faults() {
        let pm = SoftPageManager::new();
        assert!(pm.map(PAGE, frame(), false));
        assert!(!pm.map(PAGE, frame(), false));

        assert_eq!(
            pm.store(PAGE, b"x"),
            Err(PageFault { addr: PAGE, write: true, present: true })
        );
        let mut buf = [0; 8];
        // Crosses into the unmapped next page.
        assert_eq!(
            pm.load(PAGE + PAGE_FRAME_SIZE - 4, &mut buf),
            Err(PageFault { addr: PAGE + PAGE_FRAME_SIZE, write: false, present: false })
        );
    }

    #[test]
    fn limit_refuses_mappings() {
        let pm = SoftPageManager::with_limit(1);
        assert!(pm.map(PAGE, frame(), true));
        assert!(!pm.map(PAGE + PAGE_FRAME_SIZE, frame(), true));
        assert_eq!(pm.mapped_pages(), 1);
        assert_eq!(pm.is_writable(PAGE + 5), Some(true));
    }
}
