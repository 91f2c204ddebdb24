//! Adapters implementing the domain ports.

pub mod checkpoint;
pub mod memory;
pub mod sqlite;
