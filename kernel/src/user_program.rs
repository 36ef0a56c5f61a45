pub mod fault;
pub mod process;
