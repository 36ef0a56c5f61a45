//! Memory-mapped files.

use super::error::MmapError;
use super::page::Backing;
use super::spt::SupplementalPageTable;
use super::Vm;
use crate::fs::File;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_shared::mem::{is_page_aligned, is_user_vaddr, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// Identifies a mapping within its process.
pub type MapId = usize;

/// One successful `mmap`: the pages it created and the file handle backing them.
pub struct Mapping {
    file: Arc<dyn File>,
    pages: Vec<usize>,
}

impl Mapping {
    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub fn pages(&self) -> &[usize] {
        &self.pages
    }

    pub(crate) fn push(&mut self, upage: usize) {
        self.pages.push(upage);
    }
}

#[derive(Default)]
pub struct MmapTable {
    next_id: MapId,
    maps: BTreeMap<MapId, Mapping>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MapId) -> Option<&Mapping> {
        self.maps.get(&id)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Maps the whole of `file` at `addr`, one lazily loaded page at a time.
    ///
    /// The mapping holds its own handle to the file, so closing `file` does not
    /// affect it.
    pub fn map(
        &mut self,
        vm: &Vm,
        spt: &mut SupplementalPageTable,
        file: &Arc<dyn File>,
        addr: usize,
    ) -> Result<MapId, MmapError> {
        if addr == 0 || !is_page_aligned(addr) || !is_user_vaddr(addr) {
            return Err(MmapError::BadAddress(addr));
        }

        let (len, file) = {
            let fs = vm.fs_lock.lock();
            let len = file.length(&fs);
            if len == 0 {
                return Err(MmapError::EmptyFile);
            }
            let fits = usize::try_from(len)
                .ok()
                .and_then(|len| addr.checked_add(len))
                .is_some_and(|end| end <= OFFSET);
            if !fits {
                return Err(MmapError::BadAddress(addr));
            }
            (len, file.reopen(&fs))
        };

        let mut mapping = Mapping {
            file,
            pages: Vec::new(),
        };
        let mut offset = 0u64;
        while offset < len {
            #[allow(clippy::cast_possible_truncation)]
            let read_bytes = (len - offset).min(PAGE_FRAME_SIZE as u64) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let upage = addr + offset as usize;
            if let Err(e) = spt.add_mmap_backed(
                &mut mapping,
                upage,
                offset,
                read_bytes,
                PAGE_FRAME_SIZE - read_bytes,
            ) {
                Self::release(vm, spt, mapping);
                return Err(e.into());
            }
            offset += PAGE_FRAME_SIZE as u64;
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!(
            "pid {}: mmap {id} at {addr:#x}, {} pages",
            spt.owner().pid,
            mapping.pages.len()
        );
        self.maps.insert(id, mapping);
        Ok(id)
    }

    /// Removes mapping `id`, writing dirty pages back to the file. Unknown ids
    /// are ignored.
    pub fn unmap(&mut self, vm: &Vm, spt: &mut SupplementalPageTable, id: MapId) {
        if let Some(mapping) = self.maps.remove(&id) {
            debug!("pid {}: munmap {id}", spt.owner().pid);
            Self::release(vm, spt, mapping);
        }
    }

    /// Removes every mapping, as on process exit.
    pub fn unmap_all(&mut self, vm: &Vm, spt: &mut SupplementalPageTable) {
        for (_, mapping) in core::mem::take(&mut self.maps) {
            Self::release(vm, spt, mapping);
        }
    }

    fn release(vm: &Vm, spt: &mut SupplementalPageTable, mapping: Mapping) {
        let pagedir = Arc::clone(&spt.owner().pagedir);
        for &upage in &mapping.pages {
            let Some(page) = spt.remove(upage) else {
                continue;
            };
            page.pin();
            let frame = page.state().frame.take();
            if let Some(frame) = frame {
                let dirty = pagedir.unmap(upage);
                if let (true, Backing::Mmap(region)) = (dirty, page.backing()) {
                    // SAFETY: The page is pinned and no longer mapped.
                    let data = unsafe { frame.as_slice() };
                    let written = {
                        let fs = vm.fs_lock.lock();
                        region
                            .file
                            .write_at(&fs, &data[..region.read_bytes], region.offset)
                    };
                    if written != region.read_bytes {
                        warn!(
                            "munmap {upage:#x}: short write-back: {written} of {} bytes",
                            region.read_bytes
                        );
                    }
                }
                vm.frames.free(frame);
            }
            page.unpin();
        }

        let fs = vm.fs_lock.lock();
        mapping.file.close(&fs);
    }
}
