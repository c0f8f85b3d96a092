//! ChalkDB core: the storage and concurrency-control engine of a teaching
//! relational database.
//!
//! Three subsystems make up the crate, layered bottom-up:
//!
//! - [`buffer`]: a fixed-capacity page cache over the disk file, with an
//!   LRU-K replacement policy, an extendible-hash page directory, and
//!   RAII page guards that pair pinning with the per-frame latch.
//! - [`storage`]: the paged disk manager and its background I/O
//!   scheduler, page codecs, and a latch-crabbed B+tree index with a
//!   forward range iterator.
//! - [`transaction`]: hierarchical two-phase locking over tables and
//!   rows, with upgrade handling and isolation-level enforcement.

pub mod buffer;
pub mod config;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod utils;
