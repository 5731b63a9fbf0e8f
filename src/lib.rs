//! `ext-mem` is a library of building blocks for algorithms whose working sets
//! live on disk and are moved through memory in large sequential chunks.
//!
//! # Overview
//!
//! Three tightly coupled subsystems make up the engine core:
//!
//! * **Typed block streams:**
//!   [`Stream`] is a seekable, append-and-truncate view of fixed-size,
//!   bit-copyable items persisted as aligned blocks in a single backing file.
//!   Exactly one block is cached per stream and written back on eviction.
//! * **External merge sorting:**
//!   [`MergeSorter`] forms memory-sized sorted runs, spills them to a rotating
//!   bank of temporary streams and merges them back with a k-way heap, all
//!   within caller-provided memory budgets. Inputs small enough to fit in
//!   memory never touch disk.
//! * **Parallel pipelines:**
//!   [`pipeline`] composes push- and pull-based processing nodes with `|`,
//!   runs them in phases with proportional memory assignment, and fans
//!   buffered batches out to worker threads via [`pipeline::parallel`].
//!
//! # Example
//!
//! ```no_run
//! use ext_mem::{MergeSorter, OpenMode, Stream, DEFAULT_BLOCK_BYTES};
//!
//! fn main() {
//!     let mut input: Stream<u64> = Stream::open("input.dat", OpenMode::Read, DEFAULT_BLOCK_BYTES).unwrap();
//!
//!     let mut sorter = MergeSorter::<u64, _>::natural();
//!     sorter.set_available_memory(64 * 1024 * 1024).unwrap();
//!     sorter.begin().unwrap();
//!     while input.tell() < input.stream_len() {
//!         sorter.push(*input.read_item().unwrap()).unwrap();
//!     }
//!     sorter.end().unwrap();
//!     sorter.calc().unwrap();
//!
//!     let mut output: Stream<u64> = Stream::open("output.dat", OpenMode::Write, DEFAULT_BLOCK_BYTES).unwrap();
//!     while sorter.can_pull() {
//!         output.write_item(sorter.pull().unwrap()).unwrap();
//!     }
//!     output.close().unwrap();
//! }
//! ```

pub mod block;
pub mod error;
pub mod heap;
pub mod merger;
pub mod pipeline;
pub mod sort;
pub mod stream;
pub mod temp;

pub use block::OpenMode;
pub use error::{Error, Result};
pub use heap::{MergeHeap, OverflowHeap};
pub use merger::Merger;
pub use pipeline::{parallel, sort_by, ParallelOptions, Pipeline};
pub use sort::{MergeSorter, SortOptions, SortParameters};
pub use stream::{Item, Stream, DEFAULT_BLOCK_BYTES};
pub use temp::{temp_root, TempFile, TEMP_DIR_ENV};
