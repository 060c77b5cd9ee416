use bevy::tasks::TaskPool;

use super::{batch_size, digit, BucketCounts, KeyProjector, ScanLevel, BUCKET_COUNT};

/// Lane-parallel exclusive scan of one block, in place.
///
/// Runs the Hillis–Steele steps a workgroup would run: at step `k` every lane
/// `l >= 2^k` adds the value lane `l - 2^k` held after step `k - 1`. The
/// inclusive result is then shifted one lane up. Returns the block total.
pub fn block_scan(block: &mut [BucketCounts]) -> BucketCounts {
    let len = block.len();
    if len == 0 {
        return [0; BUCKET_COUNT];
    }
    let mut offset = 1;
    while offset < len {
        // Walking lanes downward, lane `l - offset` still holds the previous
        // step's value when lane `l` reads it.
        for lane in (offset..len).rev() {
            let prev = block[lane - offset];
            for (count, add) in block[lane].iter_mut().zip(prev) {
                *count += add;
            }
        }
        offset <<= 1;
    }
    let total = block[len - 1];
    block.copy_within(0..len - 1, 1);
    block[0] = [0; BUCKET_COUNT];
    total
}

/// Membership counts of a single digit.
#[inline]
fn one_hot(digit: u32) -> BucketCounts {
    let mut counts = [0; BUCKET_COUNT];
    counts[digit as usize] = 1;
    counts
}

/// Derive the key of every element.
pub(crate) fn project_keys<T, P>(pool: &TaskPool, records: &[T], projector: &P, keys: &mut [u16])
where
    T: Sync,
    P: KeyProjector<T>,
{
    let chunk = batch_size(pool, records.len());
    pool.scope(|s| {
        for (records, keys) in records.chunks(chunk).zip(keys.chunks_mut(chunk)) {
            s.spawn(async move {
                for (record, key) in records.iter().zip(keys.iter_mut()) {
                    *key = projector.sort_key(record);
                }
            });
        }
    });
}

/// Scan level 0 for the digit at `bit_offset`.
///
/// Writes the digit of each element into `flags`, the per-block exclusive
/// scan of the digit memberships into `scan`, and the block totals into
/// `sums`. `keys`, `flags` and `scan` cover whole blocks; lanes past the
/// level's item count are empty.
pub(crate) fn scan_first(
    pool: &TaskPool,
    level: &ScanLevel,
    block_size: u32,
    bit_offset: u32,
    keys: &[u16],
    flags: &mut [u32],
    scan: &mut [BucketCounts],
    sums: &mut [BucketCounts],
) {
    let block_size = block_size as usize;
    let item_count = level.item_count as usize;
    let block_count = level.block_count as usize;
    let blocks_per_task = batch_size(pool, block_count);
    let chunk = blocks_per_task * block_size;
    debug_assert_eq!(keys.len(), block_count * block_size);

    pool.scope(|s| {
        let tasks = keys
            .chunks(chunk)
            .zip(flags.chunks_mut(chunk))
            .zip(scan.chunks_mut(chunk))
            .zip(sums[..block_count].chunks_mut(blocks_per_task));
        for (task, (((keys, flags), scan), sums)) in tasks.enumerate() {
            s.spawn(async move {
                let blocks = keys
                    .chunks(block_size)
                    .zip(flags.chunks_mut(block_size))
                    .zip(scan.chunks_mut(block_size))
                    .zip(sums.iter_mut());
                for (block, (((keys, flags), scan), total)) in blocks.enumerate() {
                    let base = task * chunk + block * block_size;
                    let lanes = keys.iter().zip(flags.iter_mut()).zip(scan.iter_mut());
                    for (lane, ((key, flag), counts)) in lanes.enumerate() {
                        if base + lane < item_count {
                            *flag = digit(*key, bit_offset);
                            *counts = one_hot(*flag);
                        } else {
                            *flag = 0;
                            *counts = [0; BUCKET_COUNT];
                        }
                    }
                    *total = block_scan(scan);
                }
            });
        }
    });
}

/// Scan the block sums of the level below as the items of `level`.
///
/// `items` is the sum buffer of level `i - 1`, which has exactly the padded
/// length of level `i`'s scan buffer.
pub(crate) fn scan_level(
    pool: &TaskPool,
    level: &ScanLevel,
    block_size: u32,
    items: &[BucketCounts],
    scan: &mut [BucketCounts],
    sums: &mut [BucketCounts],
) {
    let block_size = block_size as usize;
    let item_count = level.item_count as usize;
    let block_count = level.block_count as usize;
    let blocks_per_task = batch_size(pool, block_count);
    let chunk = blocks_per_task * block_size;
    debug_assert_eq!(items.len(), block_count * block_size);

    pool.scope(|s| {
        let tasks = items
            .chunks(chunk)
            .zip(scan.chunks_mut(chunk))
            .zip(sums[..block_count].chunks_mut(blocks_per_task));
        for (task, ((items, scan), sums)) in tasks.enumerate() {
            s.spawn(async move {
                let blocks = items
                    .chunks(block_size)
                    .zip(scan.chunks_mut(block_size))
                    .zip(sums.iter_mut());
                for (block, ((items, scan), total)) in blocks.enumerate() {
                    let base = task * chunk + block * block_size;
                    for (lane, (item, counts)) in items.iter().zip(scan.iter_mut()).enumerate() {
                        *counts = if base + lane < item_count {
                            *item
                        } else {
                            [0; BUCKET_COUNT]
                        };
                    }
                    *total = block_scan(scan);
                }
            });
        }
    });
}
