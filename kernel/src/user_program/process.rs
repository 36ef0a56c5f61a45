//! The per-process half of virtual memory.

use crate::fs::File;
use crate::paging::PageManager;
use crate::vm::frame::Owner;
use crate::vm::mmap::{MapId, MmapTable};
use crate::vm::spt::SupplementalPageTable;
use crate::vm::{MmapError, Vm};
use alloc::sync::Arc;
use log::debug;

pub type Pid = u16;

/// Everything a process owns in the virtual memory system: its supplemental page
/// table and its memory mappings.
pub struct ProcessMemory {
    pub(super) spt: SupplementalPageTable,
    mmaps: MmapTable,
}

impl ProcessMemory {
    pub fn new(pid: Pid, pagedir: Arc<dyn PageManager>) -> Self {
        Self {
            spt: SupplementalPageTable::new(Owner { pid, pagedir }),
            mmaps: MmapTable::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.spt.owner().pid
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// For loading executables, which declare their pages up front.
    pub fn spt_mut(&mut self) -> &mut SupplementalPageTable {
        &mut self.spt
    }

    pub fn mmaps(&self) -> &MmapTable {
        &self.mmaps
    }

    pub fn mmap(&mut self, vm: &Vm, file: &Arc<dyn File>, addr: usize) -> Result<MapId, MmapError> {
        self.mmaps.map(vm, &mut self.spt, file, addr)
    }

    pub fn munmap(&mut self, vm: &Vm, id: MapId) {
        self.mmaps.unmap(vm, &mut self.spt, id);
    }

    /// Releases all of the process's memory. Mappings are written back first.
    pub fn exit(mut self, vm: &Vm) {
        debug!("pid {}: releasing memory", self.pid());
        self.mmaps.unmap_all(vm, &mut self.spt);
        self.spt.destroy(vm);
    }
}
