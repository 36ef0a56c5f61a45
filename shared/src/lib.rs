#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bit_array;
pub mod mem;
pub mod sizes;
