//! The frame table: which user frame backs which page of which process, and
//! second-chance clock eviction when the user pool runs dry.

use super::page::{Backing, Page};
use super::swap::SwapSpace;
use crate::fs::FsLock;
use crate::mem::{Frame, FrameAllocator, PallocFlags};
use crate::paging::PageManager;
use crate::sync::mutex::Mutex;
use crate::user_program::process::Pid;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use log::{debug, trace, warn};

/// The process a frame is lent to.
#[derive(Clone)]
pub struct Owner {
    pub pid: Pid,
    pub pagedir: Arc<dyn PageManager>,
}

/// Frame table entry.
struct Fte {
    frame: Frame,
    owner: Owner,
    page: Arc<Page>,
}

struct FrameTable {
    entries: Vec<Fte>,
    /// Index of the next entry the clock looks at.
    hand: usize,
    allocator: Box<dyn FrameAllocator>,
}

pub struct FramePool {
    table: Mutex<FrameTable>,
    swap: Arc<SwapSpace>,
    fs_lock: Arc<FsLock>,
}

impl FramePool {
    pub fn new(
        allocator: Box<dyn FrameAllocator>,
        swap: Arc<SwapSpace>,
        fs_lock: Arc<FsLock>,
    ) -> Self {
        Self {
            table: Mutex::new(FrameTable {
                entries: Vec::with_capacity(allocator.total_frames()),
                hand: 0,
                allocator,
            }),
            swap,
            fs_lock,
        }
    }

    /// Takes a frame from the user pool for `page` of `owner`, evicting another
    /// page if the pool is empty.
    ///
    /// The caller must hold `page` pinned until it is mapped. Panics if no frame
    /// can be found even after eviction.
    pub fn allocate(&self, owner: &Owner, page: &Arc<Page>, zeroed: bool) -> Frame {
        let flags = PallocFlags::for_user(zeroed);
        let mut table = self.table.lock();
        let frame = match table.allocator.alloc(flags) {
            Ok(frame) => frame,
            Err(_) => {
                if !self.evict(&mut table) {
                    panic!("out of frames: every resident page is pinned");
                }
                match table.allocator.alloc(flags) {
                    Ok(frame) => frame,
                    Err(e) => panic!("out of frames after eviction: {e}"),
                }
            }
        };

        trace!(
            "frame: {frame:?} -> pid {} page {:#x}",
            owner.pid,
            page.upage()
        );
        table.entries.push(Fte {
            frame,
            owner: owner.clone(),
            page: Arc::clone(page),
        });
        frame
    }

    /// Forgets `frame` and returns it to the user pool. The mapping and the page's
    /// residency are the caller's business.
    pub fn free(&self, frame: Frame) {
        let mut table = self.table.lock();
        let Some(idx) = table.entries.iter().position(|fte| fte.frame == frame) else {
            panic!("freeing untracked {frame:?}");
        };
        Self::remove_entry(&mut table, idx);
        table.allocator.dealloc(frame);
    }

    /// Number of frames currently lent to pages.
    pub fn resident_frames(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Number of frame table entries referring to `page`.
    pub fn entries_for(&self, page: &Arc<Page>) -> usize {
        self.table
            .lock()
            .entries
            .iter()
            .filter(|fte| Arc::ptr_eq(&fte.page, page))
            .count()
    }

    fn remove_entry(table: &mut FrameTable, idx: usize) -> Fte {
        let fte = table.entries.remove(idx);
        if table.hand > idx {
            table.hand -= 1;
        }
        if table.hand >= table.entries.len() {
            table.hand = 0;
        }
        fte
    }

    /// Runs the clock for at most two sweeps and evicts the first unpinned page
    /// that was not accessed since the last sweep. Returns whether a frame was
    /// freed.
    fn evict(&self, table: &mut FrameTable) -> bool {
        let len = table.entries.len();
        for _ in 0..2 * len {
            let idx = table.hand;
            table.hand = (idx + 1) % len;

            let fte = &table.entries[idx];
            if !fte.page.try_pin() {
                continue;
            }
            let upage = fte.page.upage();
            if fte.owner.pagedir.is_accessed(upage) {
                fte.owner.pagedir.set_accessed(upage, false);
                fte.page.unpin();
                continue;
            }

            let victim = Self::remove_entry(table, idx);
            self.page_out(&victim);
            table.allocator.dealloc(victim.frame);
            victim.page.unpin();
            return true;
        }
        false
    }

    /// Unmaps the victim and saves its contents according to its backing.
    fn page_out(&self, victim: &Fte) {
        let page = &victim.page;
        let dirty = victim.owner.pagedir.unmap(page.upage());
        let mut state = page.state();

        // A written file page whose tail is zero fill cannot be written back
        // without growing the file, so it moves to swap for good.
        let to_swap = match page.backing() {
            Backing::Swap => true,
            Backing::File(region) => state.anonymous || (dirty && region.zero_bytes > 0),
            Backing::Mmap(_) => false,
        };

        let outcome = if to_swap {
            state.swap_slot = Some(self.swap.swap_out(victim.frame));
            if matches!(page.backing(), Backing::File(_)) {
                state.anonymous = true;
            }
            "swapped out"
        } else if let (true, Some(region)) = (dirty, page.file_region()) {
            // SAFETY: The page is pinned and no longer mapped.
            let data = unsafe { victim.frame.as_slice() };
            let written = {
                let fs = self.fs_lock.lock();
                region.file.write_at(&fs, &data[..region.read_bytes], region.offset)
            };
            if written != region.read_bytes {
                warn!(
                    "pid {}: short write-back of {:#x}: {written} of {} bytes",
                    victim.owner.pid,
                    page.upage(),
                    region.read_bytes
                );
            }
            "written back"
        } else {
            "dropped"
        };
        state.frame = None;

        debug!(
            "evicted pid {} page {:#x} from {:?}: {outcome}",
            victim.owner.pid,
            page.upage(),
            victim.frame,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::SoftPageManager;
    use crate::test_util::{self, fill, TestVm};

    const PAGE: usize = 0x1000_0000;

    fn resident(vm: &TestVm, owner: &Owner, pm: &SoftPageManager, upage: usize) -> Arc<Page> {
        let page = Arc::new(Page::new(upage, true, Backing::Swap));
        page.pin();
        let frame = vm.frames.allocate(owner, &page, true);
        assert!(pm.map(upage, frame, true));
        page.state().frame = Some(frame);
        page.unpin();
        page
    }

    #[test]
    fn free_returns_frame() {
        let vm = TestVm::new(2, 4);
        let (owner, pm) = test_util::owner(1);
        let page = resident(&vm, &owner, &pm, PAGE);
        assert_eq!(vm.frames.resident_frames(), 1);
        assert_eq!(vm.frames.entries_for(&page), 1);

        let frame = page.state().frame.take().unwrap();
        pm.unmap(PAGE);
        vm.frames.free(frame);
        assert_eq!(vm.frames.resident_frames(), 0);
        assert_eq!(vm.frames.entries_for(&page), 0);
    }

    #[test]
    fn clock_gives_second_chance() {
        let vm = TestVm::new(2, 4);
        let (owner, pm) = test_util::owner(1);
        let a = resident(&vm, &owner, &pm, PAGE);
        let b = resident(&vm, &owner, &pm, PAGE + 0x1000);
        fill(&pm, PAGE, 0xaa);

        // `a` was just written to, so `b` goes first.
        let c = resident(&vm, &owner, &pm, PAGE + 0x2000);
        assert!(a.is_resident());
        assert!(!b.is_resident());
        assert!(b.swap_slot().is_some());
        assert!(!pm.is_accessed(PAGE));
        assert_eq!(vm.swap.used_slots(), 1);

        // Its accessed bit is clear now, so `a` goes next.
        let _d = resident(&vm, &owner, &pm, PAGE + 0x3000);
        assert!(!a.is_resident());
        assert!(c.is_resident());
        assert_eq!(vm.frames.resident_frames(), 2);
    }

    #[test]
    fn pinned_pages_are_never_evicted() {
        let vm = TestVm::new(2, 4);
        let (owner, pm) = test_util::owner(1);
        let a = resident(&vm, &owner, &pm, PAGE);
        let b = resident(&vm, &owner, &pm, PAGE + 0x1000);
        a.pin();

        let _c = resident(&vm, &owner, &pm, PAGE + 0x2000);
        assert!(a.is_resident());
        assert!(!b.is_resident());
        a.unpin();
    }

    #[test]
    #[should_panic(expected = "out of frames")]
    fn all_pinned_is_fatal() {
        let vm = TestVm::new(1, 4);
        let (owner, pm) = test_util::owner(1);
        let a = resident(&vm, &owner, &pm, PAGE);
        a.pin();
        resident(&vm, &owner, &pm, PAGE + 0x1000);
    }

    #[test]
    #[should_panic(expected = "untracked")]
    fn freeing_untracked_frame_panics() {
        let vm = TestVm::new(2, 4);
        let (owner, pm) = test_util::owner(1);
        let page = resident(&vm, &owner, &pm, PAGE);
        let frame = page.frame().unwrap();
        vm.frames.free(frame);
        vm.frames.free(frame);
    }
}
