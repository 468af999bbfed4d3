#![forbid(unsafe_code)]

pub mod memory;
pub mod pma;
pub mod utils;
pub mod vmem;
