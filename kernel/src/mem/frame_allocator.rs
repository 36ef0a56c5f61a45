use super::{AllocError, Frame, FrameAllocator, PallocFlags};
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use core::ptr::NonNull;
use kidneyos_shared::{mem::PAGE_FRAME_SIZE, sizes::MB};
use log::trace;

/// Physical address the hosted user pool pretends to start at: upper memory.
const HOSTED_PHYS_BASE: usize = MB;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    zeroed: bool,
}

/// The pool of frames handed out to user processes, one core map entry per frame.
///
/// Frames are placed next-fit: the search for a free frame resumes after the
/// last one handed out.
pub struct UserPool {
    start: NonNull<u8>,
    first_pfn: usize,
    core_map: Box<[CoreMapEntry]>,
    /// Where the next search starts.
    next: usize,
    frames_allocated: usize,
}

// SAFETY: The pool owns the memory behind `start` exclusively.
unsafe impl Send for UserPool {}

impl UserPool {
    /// Create a pool managing `frames` frames starting at `start`, whose first
    /// frame sits at physical address `phys_base`.
    ///
    /// # Safety
    ///
    /// `start` must point to `frames * PAGE_FRAME_SIZE` bytes that nothing else uses for the
    /// rest of the kernel's lifetime.
    pub unsafe fn new_in(start: NonNull<u8>, frames: usize, phys_base: usize) -> Self {
        assert_eq!(phys_base % PAGE_FRAME_SIZE, 0, "unaligned user pool");
        assert!(
            phys_base / PAGE_FRAME_SIZE + frames <= u32::MAX as usize,
            "user pool exceeds the physical address space"
        );

        Self {
            start,
            first_pfn: phys_base / PAGE_FRAME_SIZE,
            core_map: vec![CoreMapEntry::default(); frames].into_boxed_slice(),
            next: 0,
            frames_allocated: 0,
        }
    }

    /// Carve a pool of `frames` frames out of the kernel heap. The memory is never
    /// returned, like physical memory handed to the user pool at boot.
    pub fn with_frames(frames: usize) -> Self {
        let memory: &'static mut [u8] =
            Box::leak(vec![0u8; frames * PAGE_FRAME_SIZE].into_boxed_slice());
        let start = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());
        // SAFETY: `memory` was leaked above and is referenced from nowhere else.
        unsafe { Self::new_in(start, frames, HOSTED_PHYS_BASE) }
    }

    fn frame_at(&self, idx: usize) -> Frame {
        #[allow(clippy::cast_possible_truncation)]
        let pfn = (self.first_pfn + idx) as u32;
        // SAFETY: `idx` is within the core map, so the frame lies within the region given
        // to `new_in`.
        unsafe {
            let kva = NonNull::new_unchecked(self.start.as_ptr().add(idx * PAGE_FRAME_SIZE));
            Frame::new(kva, pfn)
        }
    }

    /// Index of the first free frame at or after the cursor, wrapping around once.
    fn next_fit(&mut self) -> Result<usize, AllocError> {
        let total = self.core_map.len();
        let idx = (0..total)
            .map(|i| (self.next + i) % total)
            .find(|idx| !self.core_map[*idx].allocated())
            .ok_or(AllocError)?;
        self.next = (idx + 1) % total;
        Ok(idx)
    }

    fn index_of(&self, frame: Frame) -> usize {
        let idx = (frame.pfn() as usize)
            .checked_sub(self.first_pfn)
            .filter(|idx| *idx < self.core_map.len())
            .unwrap_or_else(|| panic!("{frame:?} does not belong to the user pool"));
        debug_assert_eq!(self.frame_at(idx).kva(), frame.kva());
        idx
    }
}

impl FrameAllocator for UserPool {
    fn alloc(&mut self, flags: PallocFlags) -> Result<Frame, AllocError> {
        // Kernel allocations never come out of the user pool.
        if !flags.is_user() {
            return Err(AllocError);
        }

        let idx = self.next_fit()?;
        assert!(!self.core_map[idx].allocated());
        self.core_map[idx] = self.core_map[idx]
            .with_allocated(true)
            .with_zeroed(flags.is_zero());
        self.frames_allocated += 1;

        let frame = self.frame_at(idx);
        if flags.is_zero() {
            // SAFETY: The frame was free until now, so nobody else references it.
            unsafe { frame.as_mut_slice().fill(0) };
        }
        trace!("user pool: allocated {frame:?} ({} in use)", self.frames_allocated);
        Ok(frame)
    }

    fn dealloc(&mut self, frame: Frame) {
        let idx = self.index_of(frame);
        assert!(self.core_map[idx].allocated(), "double free of {frame:?}");
        self.core_map[idx] = CoreMapEntry::default();
        self.frames_allocated -= 1;
        trace!("user pool: freed {frame:?} ({} in use)", self.frames_allocated);
    }

    fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }

    fn total_frames(&self) -> usize {
        self.core_map.len()
    }
}
