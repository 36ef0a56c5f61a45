//! Checking and copying user pointers handed to system calls.
//!
//! A user range is valid if every page of it can be made resident the way a
//! page fault would: by paging it in or by growing the stack.

use crate::user_program::fault::FaultError;
use crate::user_program::process::ProcessMemory;
use crate::vm::Vm;
use alloc::vec::Vec;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, OFFSET, PAGE_FRAME_SIZE};

/// Makes the page containing `addr` resident and calls `f` with its contents
/// from `addr` to the end of the page, with the page pinned.
fn with_user_page<R>(
    vm: &Vm,
    process: &mut ProcessMemory,
    addr: usize,
    esp: usize,
    write: bool,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, FaultError> {
    if !is_user_vaddr(addr) {
        return Err(FaultError::NotUser(addr));
    }
    loop {
        if let Some(page) = process.spt().lookup(addr) {
            if write && !page.is_writable() {
                return Err(FaultError::ReadOnly(addr));
            }
            page.pin();
            if let Some(frame) = page.frame() {
                // SAFETY: The page is pinned, so the frame stays put, and this thread
                // is the only one running in the process.
                let data = unsafe { &frame.as_slice()[page_offset(addr)..] };
                let result = f(data);
                page.unpin();
                return Ok(result);
            }
            page.unpin();
        }
        process.handle_page_fault(vm, addr, esp, write)?;
    }
}

/// The end of the user range `[ptr, ptr + len)`.
fn user_range_end(ptr: usize, len: usize) -> Result<usize, FaultError> {
    ptr.checked_add(len)
        .filter(|end| *end <= OFFSET)
        .ok_or(FaultError::NotUser(ptr))
}

/// Splits `[ptr, end)` at page boundaries.
fn page_chunks(ptr: usize, end: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut addr = ptr;
    core::iter::from_fn(move || {
        if addr >= end {
            return None;
        }
        let len = (PAGE_FRAME_SIZE - page_offset(addr)).min(end - addr);
        let chunk = (addr, len);
        addr += len;
        Some(chunk)
    })
}

pub fn validate_user_address(
    vm: &Vm,
    process: &mut ProcessMemory,
    addr: usize,
    esp: usize,
    write: bool,
) -> Result<(), FaultError> {
    with_user_page(vm, process, addr, esp, write, |_| ())
}

/// Checks that all of `[ptr, ptr + len)` may be read, or written if `write` is
/// set.
pub fn validate_user_buffer(
    vm: &Vm,
    process: &mut ProcessMemory,
    ptr: usize,
    len: usize,
    esp: usize,
    write: bool,
) -> Result<(), FaultError> {
    let end = user_range_end(ptr, len)?;
    for (addr, _) in page_chunks(ptr, end) {
        validate_user_address(vm, process, addr, esp, write)?;
    }
    Ok(())
}

/// Checks the NUL-terminated string at `ptr` and returns its length, not counting
/// the terminator.
pub fn validate_user_string(
    vm: &Vm,
    process: &mut ProcessMemory,
    ptr: usize,
    esp: usize,
) -> Result<usize, FaultError> {
    let mut len = 0;
    loop {
        let addr = ptr.checked_add(len).ok_or(FaultError::NotUser(ptr))?;
        let found = with_user_page(vm, process, addr, esp, false, |data| {
            data.iter().position(|b| *b == 0)
        })?;
        match found {
            Some(nul) => return Ok(len + nul),
            None => len += PAGE_FRAME_SIZE - page_offset(addr),
        }
    }
}

/// Copies `count` bytes of user memory at `pointer` into the kernel.
pub fn check_and_copy_user_memory(
    vm: &Vm,
    process: &mut ProcessMemory,
    pointer: usize,
    count: usize,
    esp: usize,
) -> Result<Vec<u8>, FaultError> {
    let end = user_range_end(pointer, count)?;
    let mut bytes = Vec::with_capacity(count);
    for (addr, len) in page_chunks(pointer, end) {
        with_user_page(vm, process, addr, esp, false, |data| {
            bytes.extend_from_slice(&data[..len]);
        })?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::File;
    use crate::test_util::{self, fault_store, MemFile, TestVm};
    use alloc::sync::Arc;
    use kidneyos_shared::mem::{USER_BASE, USER_STACK_TOP};

    #[test]
    fn copies_across_pages_and_evictions() {
        let vm = TestVm::new(1, 8);
        let (mut process, pm) = test_util::process(1);
        let esp = USER_STACK_TOP - 2 * PAGE_FRAME_SIZE;
        let start = USER_STACK_TOP - PAGE_FRAME_SIZE - 3;
        // With a single frame, each store has to stay within one page.
        fault_store(&vm, &mut process, &pm, start, b"abc", esp);
        fault_store(&vm, &mut process, &pm, start + 3, b"def", esp);
        assert_eq!(vm.frames.resident_frames(), 1);

        let bytes = check_and_copy_user_memory(&vm, &mut process, start, 6, esp).unwrap();
        assert_eq!(bytes, b"abcdef");
        assert_eq!(vm.frames.resident_frames(), 1);
    }

    #[test]
    fn strings() {
        let vm = TestVm::new(2, 8);
        let (mut process, _) = test_util::process(1);
        let mut data = [b'x'; PAGE_FRAME_SIZE + 10];
        data[PAGE_FRAME_SIZE + 4] = 0;
        let file: Arc<dyn File> = MemFile::new(&data);
        let mmap = 0x1000_0000;
        process.mmap(&vm, &file, mmap).unwrap();

        assert_eq!(
            validate_user_string(&vm, &mut process, mmap + 100, USER_STACK_TOP),
            Ok(PAGE_FRAME_SIZE - 100 + 4)
        );
        assert_eq!(
            validate_user_string(&vm, &mut process, USER_BASE, USER_STACK_TOP),
            Err(FaultError::Unmapped(USER_BASE))
        );
    }

    #[test]
    fn buffers() {
        let vm = TestVm::new(2, 8);
        let (mut process, _) = test_util::process(1);
        let file: Arc<dyn File> = MemFile::new(&[1; PAGE_FRAME_SIZE]);
        process
            .spt_mut()
            .add_file_backed(USER_BASE, file, 0, PAGE_FRAME_SIZE, 0, false)
            .unwrap();

        assert_eq!(
            validate_user_buffer(&vm, &mut process, USER_BASE, 16, USER_STACK_TOP, false),
            Ok(())
        );
        assert_eq!(
            validate_user_buffer(&vm, &mut process, USER_BASE, 16, USER_STACK_TOP, true),
            Err(FaultError::ReadOnly(USER_BASE))
        );
        assert_eq!(
            validate_user_buffer(&vm, &mut process, USER_BASE + 8, PAGE_FRAME_SIZE, USER_STACK_TOP, false),
            Err(FaultError::Unmapped(USER_BASE + PAGE_FRAME_SIZE))
        );
        assert_eq!(
            validate_user_buffer(&vm, &mut process, OFFSET - 4, 8, USER_STACK_TOP, false),
            Err(FaultError::NotUser(OFFSET - 4))
        );
        assert_eq!(
            validate_user_address(&vm, &mut process, OFFSET, USER_STACK_TOP, false),
            Err(FaultError::NotUser(OFFSET))
        );
        assert_eq!(
            validate_user_buffer(&vm, &mut process, USER_BASE, 0, USER_STACK_TOP, true),
            Ok(())
        );
    }
}
