//! Storage layer - the container file, blocks, and the buddy allocator.
//!
//! This module handles persistent storage:
//! - [`ContainerFile`] - Low-level positioned I/O
//! - [`Block`] - Bounded, dirty-tracked views of allocated ranges
//! - [`FreeLists`] - The buddy allocator
//! - [`Store`] - The paged container tying them together

mod block;
mod buddy;
mod file;
mod store;

pub use block::Block;
pub use buddy::FreeLists;
pub use file::ContainerFile;
pub use store::Store;
