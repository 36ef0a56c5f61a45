//! Demand-paged virtual memory for user processes.
//!
//! Lock order: frame pool, then a victim page's pin (try only), then the swap
//! lock, the file system lock or a page directory. Nothing takes the frame pool
//! lock while holding the swap or file system lock.

pub mod error;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod spt;
pub mod swap;

pub use error::{MmapError, VmError};

use crate::block::block_core::BlockManager;
use crate::fs::FsLock;
use crate::mem::FrameAllocator;
use alloc::{boxed::Box, sync::Arc};
use frame::FramePool;
use log::info;
use swap::SwapSpace;

/// The system-wide virtual memory state shared by all processes.
pub struct Vm {
    pub frames: FramePool,
    pub swap: Arc<SwapSpace>,
    pub fs_lock: Arc<FsLock>,
}

impl Vm {
    /// Sets up swap on the device registered for the swap role and hands the
    /// frames of `allocator` to the frame table.
    pub fn init(
        blocks: &BlockManager,
        allocator: Box<dyn FrameAllocator>,
        fs_lock: Arc<FsLock>,
    ) -> Self {
        let swap = Arc::new(SwapSpace::init(blocks));
        info!(
            "vm: {} user frames, {} swap slots",
            allocator.total_frames(),
            swap.slot_count()
        );
        Self {
            frames: FramePool::new(allocator, Arc::clone(&swap), Arc::clone(&fs_lock)),
            swap,
            fs_lock,
        }
    }
}
