//! Repository traits and implementations.

pub mod job;
pub mod memory;

pub use job::{JobAdmin, JobRow, JobStore, PgJobStore};
pub use memory::MemoryJobStore;
