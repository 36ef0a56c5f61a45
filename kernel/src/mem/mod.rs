pub mod frame_allocator;
pub mod user;

use bitbybit::bitfield;
use core::fmt;
use core::ptr::NonNull;
use core::slice;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use thiserror::Error;

/// Returned when the physical allocator has no frame to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of physical frames")]
pub struct AllocError;

/// Flags for a physical frame request.
#[bitfield(u8, default = 0)]
pub struct PallocFlags {
    /// Take the frame from the user pool.
    #[bit(0, rw)]
    user: bool,
    /// Fill the frame with zeroes before handing it out.
    #[bit(1, rw)]
    zero: bool,
}

impl PallocFlags {
    /// A request for one user frame, zero-filled if `zero` is set.
    pub fn for_user(zero: bool) -> Self {
        Self::DEFAULT.with_user(true).with_zero(zero)
    }

    pub fn is_user(&self) -> bool {
        self.user()
    }

    pub fn is_zero(&self) -> bool {
        self.zero()
    }
}

/// One page-sized physical frame, addressed through its kernel mapping.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    kva: NonNull<u8>,
    pfn: u32,
}

// SAFETY: A frame is a handle to memory owned by the physical allocator. Who may
// touch the bytes behind it is decided by the frame table, not by this type.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    /// # Safety
    ///
    /// `kva` must point to `PAGE_FRAME_SIZE` bytes that stay valid for as long as
    /// the frame can be handed out.
    pub const unsafe fn new(kva: NonNull<u8>, pfn: u32) -> Self {
        Self { kva, pfn }
    }

    /// Physical frame number.
    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    pub fn phys_addr(&self) -> usize {
        self.pfn as usize * PAGE_FRAME_SIZE
    }

    /// Kernel virtual address of the first byte of the frame.
    pub fn kva(&self) -> NonNull<u8> {
        self.kva
    }

    /// # Safety
    ///
    /// Nobody may write to the frame while the returned slice is alive.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        slice::from_raw_parts(self.kva.as_ptr(), PAGE_FRAME_SIZE)
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the frame while the returned
    /// slice is alive, e.g. because the page it backs is pinned.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        slice::from_raw_parts_mut(self.kva.as_ptr(), PAGE_FRAME_SIZE)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.phys_addr())
    }
}

/// The physical frame allocator the frame table draws from.
pub trait FrameAllocator: Send {
    /// Allocate one frame.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if no frame matching `flags` is free.
    fn alloc(&mut self, flags: PallocFlags) -> Result<Frame, AllocError>;

    /// Return a frame obtained from [`FrameAllocator::alloc`].
    fn dealloc(&mut self, frame: Frame);

    /// Number of frames currently handed out.
    fn frames_allocated(&self) -> usize;

    /// Number of frames managed by the allocator.
    fn total_frames(&self) -> usize;
}
