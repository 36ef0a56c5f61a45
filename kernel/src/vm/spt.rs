//! The supplemental page table: every user page a process has declared, resident
//! or not, and the demand paging that makes them resident.

use super::error::{Result, VmError};
use super::frame::Owner;
use super::mmap::Mapping;
use super::page::{Backing, FileRegion, Page};
use super::Vm;
use crate::fs::File;
use crate::mem::Frame;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_shared::mem::{
    is_page_aligned, is_user_vaddr, page_round_down, PAGE_FRAME_SIZE, STACK_LIMIT, USER_STACK_TOP,
};
use log::{debug, warn};

pub struct SupplementalPageTable {
    owner: Owner,
    pages: BTreeMap<usize, Arc<Page>>,
}

impl SupplementalPageTable {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            pages: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// The entry for the page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<Arc<Page>> {
        self.pages.get(&page_round_down(addr)).cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.pages.values()
    }

    /// Declares a page loaded lazily from `read_bytes` bytes of `file` at
    /// `offset`, followed by `zero_bytes` zeroes.
    pub fn add_file_backed(
        &mut self,
        upage: usize,
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<Arc<Page>> {
        let region = Self::region(file, offset, read_bytes, zero_bytes)?;
        self.insert(Page::new(upage, writable, Backing::File(region)))
    }

    /// Declares a writable page of the memory mapping `mapping`.
    pub fn add_mmap_backed(
        &mut self,
        mapping: &mut Mapping,
        upage: usize,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Arc<Page>> {
        let region = Self::region(Arc::clone(mapping.file()), offset, read_bytes, zero_bytes)?;
        let page = self.insert(Page::new(upage, true, Backing::Mmap(region)))?;
        mapping.push(upage);
        Ok(page)
    }

    fn region(
        file: Arc<dyn File>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<FileRegion> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_FRAME_SIZE) {
            return Err(VmError::BadLength {
                read_bytes,
                zero_bytes,
            });
        }
        Ok(FileRegion {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }

    fn insert(&mut self, page: Page) -> Result<Arc<Page>> {
        let upage = page.upage();
        if !is_page_aligned(upage) {
            return Err(VmError::Misaligned(upage));
        }
        if !is_user_vaddr(upage) {
            return Err(VmError::NotUser(upage));
        }
        if self.pages.contains_key(&upage) {
            return Err(VmError::PageExists(upage));
        }
        let page = Arc::new(page);
        self.pages.insert(upage, Arc::clone(&page));
        Ok(page)
    }

    /// Removes the entry for `upage` without touching its frame or swap slot.
    pub fn remove(&mut self, upage: usize) -> Option<Arc<Page>> {
        self.pages.remove(&upage)
    }

    /// Adds a zeroed, resident stack page covering `addr`.
    ///
    /// Returns [`None`] if the stack would grow past its limit, the page already
    /// exists or it cannot be mapped.
    pub fn grow_stack(&mut self, vm: &Vm, addr: usize) -> Option<Arc<Page>> {
        let upage = page_round_down(addr);
        if !is_user_vaddr(upage) || USER_STACK_TOP - upage > STACK_LIMIT {
            warn!("pid {}: stack growth to {addr:#x} refused", self.owner.pid);
            return None;
        }
        if self.pages.contains_key(&upage) {
            return None;
        }

        let page = Arc::new(Page::new(upage, true, Backing::Swap));
        page.pin();
        let frame = vm.frames.allocate(&self.owner, &page, true);
        if !self.owner.pagedir.map(upage, frame, true) {
            vm.frames.free(frame);
            page.unpin();
            return None;
        }
        page.state().frame = Some(frame);
        self.pages.insert(upage, Arc::clone(&page));
        page.unpin();

        debug!("pid {}: stack grown to {upage:#x}", self.owner.pid);
        Some(page)
    }

    /// Brings `page` into memory and maps it.
    pub fn resolve(&self, vm: &Vm, page: &Arc<Page>) -> Result<()> {
        page.pin();
        let result = self.load(vm, page);
        page.unpin();
        result
    }

    fn load(&self, vm: &Vm, page: &Arc<Page>) -> Result<()> {
        let upage = page.upage();
        let slot = {
            let state = page.state();
            if state.frame.is_some() {
                return Err(VmError::AlreadyResident(upage));
            }
            state.swap_slot
        };

        let frame = match (slot, page.backing()) {
            (Some(slot), _) => {
                let frame = vm.frames.allocate(&self.owner, page, false);
                self.install(vm, page, frame)?;
                vm.swap.read_frame(slot, frame);
                frame
            }
            (None, Backing::Swap) => {
                let frame = vm.frames.allocate(&self.owner, page, true);
                self.install(vm, page, frame)?;
                frame
            }
            (None, Backing::File(region) | Backing::Mmap(region)) => {
                let frame = vm.frames.allocate(&self.owner, page, true);
                // SAFETY: The page is pinned and not mapped yet.
                let data = unsafe { frame.as_mut_slice() };
                let got = {
                    let fs = vm.fs_lock.lock();
                    region
                        .file
                        .read_at(&fs, &mut data[..region.read_bytes], region.offset)
                };
                if got != region.read_bytes {
                    warn!(
                        "pid {}: short read paging in {upage:#x}: {got} of {} bytes",
                        self.owner.pid, region.read_bytes
                    );
                    vm.frames.free(frame);
                    return Err(VmError::ShortRead {
                        expected: region.read_bytes,
                        got,
                    });
                }
                self.install(vm, page, frame)?;
                frame
            }
        };

        let mut state = page.state();
        state.frame = Some(frame);
        state.swap_slot = None;
        Ok(())
    }

    fn install(&self, vm: &Vm, page: &Page, frame: Frame) -> Result<()> {
        if self.owner.pagedir.map(page.upage(), frame, page.is_writable()) {
            Ok(())
        } else {
            vm.frames.free(frame);
            Err(VmError::MapFailed(page.upage()))
        }
    }

    /// Releases every page: frames go back to the pool, swap slots are freed and
    /// mappings are cleared.
    pub fn destroy(&mut self, vm: &Vm) {
        let pages: Vec<_> = core::mem::take(&mut self.pages).into_values().collect();
        for page in pages {
            page.pin();
            let (frame, slot) = {
                let mut state = page.state();
                (state.frame.take(), state.swap_slot.take())
            };
            if let Some(frame) = frame {
                self.owner.pagedir.unmap(page.upage());
                vm.frames.free(frame);
            }
            if let Some(slot) = slot {
                vm.swap.free_slot(slot);
            }
            page.unpin();
        }
        debug!("pid {}: supplemental page table destroyed", self.owner.pid);
    }
}
