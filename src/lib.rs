//! dsstore - buddy-allocated container files with an ordered on-disk
//! B-tree directory.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        dsstore                           │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │               Directory Tree (tree/)              │   │
//! │  │   insert / delete / split / rebalance / iterate   │   │
//! │  └──────────────────────────────────────────────────┘   │
//! │                          ↓                               │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │                Records (record/)                  │   │
//! │  │   (name, structure id, typed payload) + ordering  │   │
//! │  └──────────────────────────────────────────────────┘   │
//! │                          ↓                               │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │              Paged Store (storage/)               │   │
//! │  │  Store: header + root block + TOC + indirection   │   │
//! │  │  FreeLists: buddy allocator   Block: byte ranges  │   │
//! │  │  ContainerFile: positioned I/O                    │   │
//! │  └──────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (Address, BlockNumber, Error, config)
//! - [`storage`] - Container file, blocks, buddy allocator, paged store
//! - [`record`] - Record wire format, typed payloads, name comparator
//! - [`tree`] - The on-disk B-tree engine
//!
//! # Quick Start
//! ```no_run
//! use dsstore::{FourCC, Record, Store, Tree, Value};
//!
//! let store = Store::open_or_create("my.store").unwrap();
//! let mut tree = Tree::open(store).unwrap();
//!
//! tree.insert(Record::new("photo.jpg", FourCC(*b"vSrn"), Value::Long(1))).unwrap();
//! for record in tree.iter().unwrap() {
//!     println!("{:?}", record.unwrap());
//! }
//! tree.close().unwrap();
//! ```
//!
//! # Concurrency
//! Single-threaded, synchronous: one exclusive writer (or one reader on an
//! unmodified file) per open session. Callers needing concurrent access
//! must serialize externally.

pub mod common;
pub mod record;
pub mod storage;
pub mod tree;

// Re-export commonly used items at crate root for convenience
pub use common::config::DEFAULT_PAGE_SIZE;
pub use common::{Address, BlockNumber, Error, Result};
pub use record::{compare_names, FourCC, Record, Value};
pub use storage::{Block, Store};
pub use tree::{Records, Tree};
