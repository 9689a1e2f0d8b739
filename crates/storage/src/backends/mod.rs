//! Data backend implementations.

pub mod filesystem;
pub mod memory;
