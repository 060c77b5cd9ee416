//! Hierarchical radix sort of fixed-stride records by 16-bit depth keys.
//!
//! The sort is a least-significant-digit radix sort consuming 2 key bits per
//! pass, for 8 passes. Each pass is a stable partition of the records into 4
//! buckets, computed with a hierarchical exclusive prefix scan:
//!
//! 1. The records are split into blocks of `B` items. Each block computes,
//!    for every record, how many earlier records of the block fall into each
//!    bucket, and writes the block totals into a sum buffer.
//! 2. The sum buffer is scanned the same way as the items of the next level,
//!    until a level fits in a single block.
//! 3. The scans are resolved from the top level down, so that level 0 holds
//!    for each record the global count of earlier records per bucket.
//! 4. Each record is scattered to the first slot of its bucket, offset by
//!    that count.
//!
//! The sequence of kernel dispatches and barriers is described once by a
//! [`SortSchedule`], then executed either on the CPU by
//! [`RadixSortEngine`], or on the GPU by [`GpuRadixSort`].
//!
//! [`GpuRadixSort`]: crate::GpuRadixSort

use bevy::tasks::TaskPool;

mod engine;
mod hierarchy;
mod key;
mod record;
mod reorder;
mod resolve;
mod scan;
mod schedule;

pub use engine::RadixSortEngine;
pub use hierarchy::{
    bucket_bases, digit, BucketCounts, LevelHierarchy, ScanLevel, BUCKET_COUNT, KEY_BITS,
    PASS_COUNT, RADIX_BITS,
};
pub use key::{DepthProjector, DepthRange, KeyProjector, KEY_MAX};
pub use record::{RecordLayout, SortRecord};
pub use scan::block_scan;
pub use schedule::{
    BufferSlot, Dispatch, PingPong, SortBarrier, SortCommand, SortKernel, SortSchedule,
};

/// Number of consecutive items processed by each task of a host dispatch.
///
/// Spreads `count` items evenly over the threads of the pool.
pub(crate) fn batch_size(pool: &TaskPool, count: usize) -> usize {
    count.div_ceil(pool.thread_num().max(1)).max(1)
}
