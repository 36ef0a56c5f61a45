//! Demand-paged virtual memory for the KidneyOS kernel: frame table, swap,
//! supplemental page tables, memory-mapped files and the user page fault path.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod user_program;
pub mod vm;

#[cfg(test)]
mod test_util;
