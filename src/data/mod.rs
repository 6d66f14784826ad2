//! Data persistence.

pub mod storage;

pub use storage::{DataSerializer, FileSerializer, MemorySerializer};
