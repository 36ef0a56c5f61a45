use crate::block::block_core::{BlockManager, BlockSector, BlockType};
use crate::drivers::ram_disk::RamDisk;
use crate::fs::{File, FsGuard, FsLock};
use crate::mem::frame_allocator::UserPool;
use crate::paging::SoftPageManager;
use crate::sync::mutex::Mutex;
use crate::user_program::process::{Pid, ProcessMemory};
use crate::vm::frame::Owner;
use crate::vm::spt::SupplementalPageTable;
use crate::vm::{Vm, VmError};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A file kept in memory. Handles made by `reopen` share contents and counters.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MemFile {
    pub fn new(data: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(data.to_vec())),
            writes: Arc::default(),
            closes: Arc::default(),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Shrinks the file to `len` bytes.
    pub fn truncate(&self, len: usize) {
        self.data.lock().truncate(len);
    }

    /// Number of `write_at` calls on any handle.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `close` calls on any handle.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl File for MemFile {
    fn read_at(&self, _fs: &FsGuard<'_>, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        len
    }

    fn write_at(&self, _fs: &FsGuard<'_>, buf: &[u8], offset: u64) -> usize {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        data[start..start + len].copy_from_slice(&buf[..len]);
        len
    }

    fn length(&self, _fs: &FsGuard<'_>) -> u64 {
        self.data.lock().len() as u64
    }

    fn reopen(&self, _fs: &FsGuard<'_>) -> Arc<dyn File> {
        Arc::new(Self {
            data: Arc::clone(&self.data),
            writes: Arc::clone(&self.writes),
            closes: Arc::clone(&self.closes),
        })
    }

    fn close(&self, _fs: &FsGuard<'_>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`Vm`] with `frames` user frames and `swap_slots` pages of swap on RAM disks.
pub struct TestVm(Vm);

impl TestVm {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        init_logger();
        let sectors = swap_slots * SECTORS_PER_PAGE;
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::FileSystem, "hda1", 64, Box::new(RamDisk::new(64)));
        blocks.register_block(
            BlockType::Swap,
            "hda2",
            sectors as BlockSector,
            Box::new(RamDisk::new(sectors)),
        );
        let pool: UserPool = UserPool::with_frames(frames);
        Self(Vm::init(&blocks, Box::new(pool), Arc::new(FsLock::new())))
    }
}

impl Deref for TestVm {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        &self.0
    }
}

pub fn owner(pid: Pid) -> (Owner, Arc<SoftPageManager>) {
    let pm = Arc::new(SoftPageManager::new());
    (
        Owner {
            pid,
            pagedir: pm.clone(),
        },
        pm,
    )
}

pub fn owner_with_limit(pid: Pid, limit: usize) -> (Owner, Arc<SoftPageManager>) {
    let pm = Arc::new(SoftPageManager::with_limit(limit));
    (
        Owner {
            pid,
            pagedir: pm.clone(),
        },
        pm,
    )
}

pub fn process(pid: Pid) -> (ProcessMemory, Arc<SoftPageManager>) {
    let pm = Arc::new(SoftPageManager::new());
    (ProcessMemory::new(pid, pm.clone()), pm)
}

/// Overwrites the whole page at `upage`, which must be mapped writable.
pub fn fill(pm: &SoftPageManager, upage: usize, byte: u8) {
    pm.store(upage, &[byte; PAGE_FRAME_SIZE]).unwrap();
}

fn page_in(vm: &Vm, spt: &SupplementalPageTable, addr: usize) {
    let page = spt
        .lookup(addr)
        .unwrap_or_else(|| panic!("no page at {addr:#x}"));
    match spt.resolve(vm, &page) {
        Ok(()) | Err(VmError::AlreadyResident(_)) => {}
        Err(e) => panic!("paging in {addr:#x}: {e}"),
    }
}

/// Stores `data` at `addr`, paging in declared pages as needed.
pub fn store(vm: &Vm, spt: &SupplementalPageTable, pm: &SoftPageManager, addr: usize, data: &[u8]) {
    while let Err(fault) = pm.store(addr, data) {
        page_in(vm, spt, fault.addr);
    }
}

pub fn load(vm: &Vm, spt: &SupplementalPageTable, pm: &SoftPageManager, addr: usize, buf: &mut [u8]) {
    while let Err(fault) = pm.load(addr, buf) {
        page_in(vm, spt, fault.addr);
    }
}

/// Stores `data` at `addr` as a user program would, going through the page
/// fault handler.
pub fn fault_store(
    vm: &Vm,
    process: &mut ProcessMemory,
    pm: &SoftPageManager,
    addr: usize,
    data: &[u8],
    esp: usize,
) {
    while let Err(fault) = pm.store(addr, data) {
        process
            .handle_page_fault(vm, fault.addr, esp, true)
            .unwrap();
    }
}

pub fn fault_load(
    vm: &Vm,
    process: &mut ProcessMemory,
    pm: &SoftPageManager,
    addr: usize,
    buf: &mut [u8],
    esp: usize,
) {
    while let Err(fault) = pm.load(addr, buf) {
        process
            .handle_page_fault(vm, fault.addr, esp, false)
            .unwrap();
    }
}
