//! Swap space: a block device carved into page-sized slots.

use crate::block::block_core::{Block, BlockManager, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::mem::Frame;
use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::bit_array::Bitmap;
use kidneyos_shared::mem::SECTORS_PER_PAGE;
use log::{debug, info};

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn sector(self, i: usize) -> BlockSector {
        #[allow(clippy::cast_possible_truncation)]
        let sector = (self.0 * SECTORS_PER_PAGE + i) as BlockSector;
        sector
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

struct SwapTable {
    device: Arc<Block>,
    /// One bit per slot, set while the slot holds a page.
    used: Bitmap,
}

pub struct SwapSpace {
    inner: Mutex<SwapTable>,
}

impl SwapTable {
    fn allocate(&mut self) -> SwapSlot {
        match self.used.scan_and_flip() {
            Some(idx) => SwapSlot(idx),
            None => panic!("swap partition full ({} slots)", self.used.len()),
        }
    }

    fn write(&self, slot: SwapSlot, frame: Frame) {
        // SAFETY: The caller holds the page backed by `frame` pinned, so the frame
        // is not written to while it is copied out.
        let data = unsafe { frame.as_slice() };
        for (i, sector) in data.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(e) = self.device.write(slot.sector(i), sector) {
                panic!("swap write to {slot:?} failed: {e}");
            }
        }
    }

    fn read(&self, slot: SwapSlot, frame: Frame) {
        // SAFETY: The caller holds the page being read into pinned and the frame is
        // not mapped yet, so nobody else can access it.
        let data = unsafe { frame.as_mut_slice() };
        for (i, sector) in data.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(e) = self.device.read(slot.sector(i), sector) {
                panic!("swap read from {slot:?} failed: {e}");
            }
        }
    }
}

impl SwapSpace {
    /// Binds to the block device registered for the swap role.
    ///
    /// Panics if there is no swap device or it cannot hold a single page.
    pub fn init(blocks: &BlockManager) -> Self {
        let Some(device) = blocks.by_role(BlockType::Swap) else {
            panic!("no swap device registered");
        };
        let slots = device.get_size() as usize / SECTORS_PER_PAGE;
        if slots == 0 {
            panic!(
                "swap device \"{}\" is too small ({} sectors)",
                device.get_name(),
                device.get_size()
            );
        }
        info!(
            "swap: using \"{}\" with {} slots",
            device.get_name(),
            slots
        );

        Self {
            inner: Mutex::new(SwapTable {
                device,
                used: Bitmap::new(slots),
            }),
        }
    }

    /// Marks a free slot as used and returns it. Panics if swap is full.
    pub fn allocate_slot(&self) -> SwapSlot {
        self.inner.lock().allocate()
    }

    /// Copies `frame` into `slot`, which must have been allocated.
    pub fn write_frame(&self, slot: SwapSlot, frame: Frame) {
        let table = self.inner.lock();
        assert!(table.used.test(slot.index()), "writing to a free {slot:?}");
        table.write(slot, frame);
    }

    /// Copies `slot` into `frame` and frees the slot.
    pub fn read_frame(&self, slot: SwapSlot, frame: Frame) {
        let mut table = self.inner.lock();
        if !table.used.test(slot.index()) {
            panic!("Swapping in a free page ({slot:?})");
        }
        table.read(slot, frame);
        table.used.set(slot.index(), false);
        debug!("swap: {slot:?} -> {frame:?}");
    }

    /// Frees `slot` without reading it back.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut table = self.inner.lock();
        assert!(table.used.test(slot.index()), "double free of {slot:?}");
        table.used.set(slot.index(), false);
    }

    /// Allocates a slot and copies `frame` into it.
    pub fn swap_out(&self, frame: Frame) -> SwapSlot {
        let mut table = self.inner.lock();
        let slot = table.allocate();
        table.write(slot, frame);
        debug!("swap: {frame:?} -> {slot:?}");
        slot
    }

    /// Number of slots on the swap device.
    pub fn slot_count(&self) -> usize {
        self.inner.lock().used.len()
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;
    use crate::mem::frame_allocator::UserPool;
    use crate::mem::{FrameAllocator, PallocFlags};
    use alloc::boxed::Box;

    fn swap_with_slots(slots: usize) -> SwapSpace {
        let sectors = slots * SECTORS_PER_PAGE;
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::FileSystem, "hda", 8, Box::new(RamDisk::new(8)));
        blocks.register_block(
            BlockType::Swap,
            "hdb",
            sectors as BlockSector,
            Box::new(RamDisk::new(sectors)),
        );
        SwapSpace::init(&blocks)
    }

    #[test]
    fn round_trip() {
        let swap = swap_with_slots(2);
        let mut pool: UserPool = UserPool::with_frames(2);
        let src = pool.alloc(PallocFlags::for_user(false)).unwrap();
        let dst = pool.alloc(PallocFlags::for_user(true)).unwrap();
        for (i, b) in unsafe { src.as_mut_slice() }.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let slot = swap.swap_out(src);
        assert_eq!(swap.used_slots(), 1);
        swap.read_frame(slot, dst);
        assert_eq!(swap.used_slots(), 0);
        assert_eq!(unsafe { src.as_slice() }, unsafe { dst.as_slice() });
    }

    #[test]
    fn write_then_read_frame() {
        let swap = swap_with_slots(2);
        let mut pool: UserPool = UserPool::with_frames(2);
        let src = pool.alloc(PallocFlags::for_user(false)).unwrap();
        let dst = pool.alloc(PallocFlags::for_user(true)).unwrap();
        for (i, b) in unsafe { src.as_mut_slice() }.iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8 ^ (i / BLOCK_SECTOR_SIZE) as u8;
        }

        let slot = swap.allocate_slot();
        swap.write_frame(slot, src);
        assert_eq!(swap.used_slots(), 1);
        swap.read_frame(slot, dst);
        assert_eq!(swap.used_slots(), 0);
        assert_eq!(unsafe { src.as_slice() }, unsafe { dst.as_slice() });
    }

    #[test]
    #[should_panic(expected = "writing to a free")]
    fn writing_a_free_slot_is_fatal() {
        let swap = swap_with_slots(1);
        let mut pool: UserPool = UserPool::with_frames(1);
        let frame = pool.alloc(PallocFlags::for_user(true)).unwrap();
        let slot = swap.allocate_slot();
        swap.free_slot(slot);
        swap.write_frame(slot, frame);
    }

    #[test]
    fn slots_are_unique() {
        let swap = swap_with_slots(3);
        assert_eq!(swap.slot_count(), 3);
        let a = swap.allocate_slot();
        let b = swap.allocate_slot();
        let c = swap.allocate_slot();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);

        swap.free_slot(b);
        assert_eq!(swap.allocate_slot(), b);
        assert_eq!(swap.used_slots(), 3);
    }

    #[test]
    #[should_panic(expected = "swap partition full")]
    fn exhaustion_is_fatal() {
        let swap = swap_with_slots(1);
        swap.allocate_slot();
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "Swapping in a free page")]
    fn reading_a_free_slot_is_fatal() {
        let swap = swap_with_slots(1);
        let mut pool: UserPool = UserPool::with_frames(1);
        let frame = pool.alloc(PallocFlags::for_user(true)).unwrap();
        let slot = swap.swap_out(frame);
        swap.read_frame(slot, frame);
        swap.read_frame(slot, frame);
    }

    #[test]
    #[should_panic(expected = "no swap device")]
    fn requires_a_swap_device() {
        SwapSpace::init(&BlockManager::new());
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn partial_page_device_is_rejected() {
        let mut blocks = BlockManager::new();
        let sectors = SECTORS_PER_PAGE - 1;
        blocks.register_block(
            BlockType::Swap,
            "hdb",
            sectors as BlockSector,
            Box::new(RamDisk::new(sectors)),
        );
        SwapSpace::init(&blocks);
    }
}
