use bevy::tasks::TaskPool;

use super::{batch_size, BucketCounts, ScanLevel};

/// Add the resolved scan of a parent level into the blocks of its child.
///
/// Entry `b` of `parent_scan` counts, per bucket, all the child items located
/// in blocks before block `b`. Adding it to every entry of child block `b`
/// turns the child's block-local scan into a scan global to the level.
pub(crate) fn resolve(
    pool: &TaskPool,
    child: &ScanLevel,
    block_size: u32,
    parent_scan: &[BucketCounts],
    child_scan: &mut [BucketCounts],
) {
    let block_size = block_size as usize;
    let block_count = child.block_count as usize;
    let blocks_per_task = batch_size(pool, block_count);
    let chunk = blocks_per_task * block_size;
    debug_assert_eq!(child_scan.len(), block_count * block_size);

    pool.scope(|s| {
        let tasks = child_scan
            .chunks_mut(chunk)
            .zip(parent_scan[..block_count].chunks(blocks_per_task));
        for (child_scan, parent_scan) in tasks {
            s.spawn(async move {
                for (block, offset) in child_scan.chunks_mut(block_size).zip(parent_scan) {
                    for counts in block {
                        for (count, add) in counts.iter_mut().zip(offset) {
                            *count += add;
                        }
                    }
                }
            });
        }
    });
}
