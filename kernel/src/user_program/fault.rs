//! User page faults.

use super::process::ProcessMemory;
use crate::vm::{Vm, VmError};
use kidneyos_shared::mem::{is_user_vaddr, STACK_SLACK};
use log::warn;
use thiserror::Error;

/// Exit status of a process killed for an invalid memory access.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Why a fault could not be resolved. Every variant kills the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("{0:#x} is not a user address")]
    NotUser(usize),
    #[error("write to read-only page at {0:#x}")]
    ReadOnly(usize),
    #[error("{0:#x} is not mapped")]
    Unmapped(usize),
    #[error("{addr:#x}: {source}")]
    PageIn {
        addr: usize,
        #[source]
        source: VmError,
    },
}

impl FaultError {
    pub fn exit_code(&self) -> i32 {
        KILLED_EXIT_CODE
    }
}

impl ProcessMemory {
    /// Handles a page fault at `addr` raised while the user stack pointer was
    /// `esp`.
    ///
    /// Accesses just below the stack pointer grow the stack. On error the
    /// process must be killed with [`KILLED_EXIT_CODE`].
    pub fn handle_page_fault(
        &mut self,
        vm: &Vm,
        addr: usize,
        esp: usize,
        write: bool,
    ) -> Result<(), FaultError> {
        let result = self.try_handle_page_fault(vm, addr, esp, write);
        if let Err(e) = &result {
            warn!("pid {}: page fault: {e}", self.pid());
        }
        result
    }

    fn try_handle_page_fault(
        &mut self,
        vm: &Vm,
        addr: usize,
        esp: usize,
        write: bool,
    ) -> Result<(), FaultError> {
        if !is_user_vaddr(addr) {
            return Err(FaultError::NotUser(addr));
        }

        if let Some(page) = self.spt.lookup(addr) {
            if write && !page.is_writable() {
                return Err(FaultError::ReadOnly(addr));
            }
            return self
                .spt
                .resolve(vm, &page)
                .map_err(|source| FaultError::PageIn { addr, source });
        }

        if addr.saturating_add(STACK_SLACK) >= esp && self.spt.grow_stack(vm, addr).is_some() {
            return Ok(());
        }
        Err(FaultError::Unmapped(addr))
    }
}
