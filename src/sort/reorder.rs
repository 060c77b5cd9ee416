use bevy::tasks::TaskPool;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::{batch_size, BucketCounts, BUCKET_COUNT};

/// Source and destination of one digit pass.
pub(crate) struct ReorderBuffers<'a, T> {
    pub src: &'a [T],
    pub src_keys: &'a [u16],
    pub dst: &'a mut [T],
    pub dst_keys: &'a mut [u16],
}

/// Split `rest` into the regions of the 4 buckets, of `totals` items each.
fn split_buckets<'a, U>(
    mut rest: &'a mut [U],
    totals: &BucketCounts,
) -> [&'a mut [U]; BUCKET_COUNT] {
    let mut regions: [&'a mut [U]; BUCKET_COUNT] = Default::default();
    for (region, &total) in regions.iter_mut().zip(totals) {
        *region = take_front(&mut rest, total as usize);
    }
    debug_assert!(rest.is_empty());
    regions
}

fn take_front<'a, U>(slice: &mut &'a mut [U], len: usize) -> &'a mut [U] {
    let (head, tail) = std::mem::take(slice).split_at_mut(len);
    *slice = tail;
    head
}

/// Scatter every element and its key to its slot in the output buffer.
///
/// The destination of element `i` with digit `d` is `bucket_bases(totals)[d]
/// + scan[i][d]`, where `scan` is the resolved level-0 scan.
pub(crate) fn reorder<T: Copy + Send + Sync>(
    pool: &TaskPool,
    totals: &BucketCounts,
    flags: &[u32],
    scan: &[BucketCounts],
    buffers: ReorderBuffers<'_, T>,
) {
    let chunk = batch_size(pool, buffers.src.len());
    reorder_chunks(pool, chunk, totals, flags, scan, buffers);
}

/// Scatter elements by chunks of `chunk` elements, one task per chunk.
///
/// The elements of a chunk with digit `d` land in a contiguous run of bucket
/// `d`, which starts at the scan of the chunk's first element and ends at the
/// scan of the next chunk's first element. So each task owns 4 disjoint runs
/// of the output.
fn reorder_chunks<T: Copy + Send + Sync>(
    pool: &TaskPool,
    chunk: usize,
    totals: &BucketCounts,
    flags: &[u32],
    scan: &[BucketCounts],
    buffers: ReorderBuffers<'_, T>,
) {
    let ReorderBuffers {
        src,
        src_keys,
        dst,
        dst_keys,
    } = buffers;
    let element_count = src.len();
    let chunk = chunk.max(1);
    debug_assert_eq!(dst.len(), element_count);
    debug_assert_eq!(totals.iter().sum::<u32>() as usize, element_count);

    let mut buckets = split_buckets(dst, totals);
    let mut key_buckets = split_buckets(dst_keys, totals);
    pool.scope(|s| {
        for start in (0..element_count).step_by(chunk) {
            let end = (start + chunk).min(element_count);
            let first = scan[start];
            let mut runs: [&mut [T]; BUCKET_COUNT] = Default::default();
            let mut key_runs: [&mut [u16]; BUCKET_COUNT] = Default::default();
            for digit in 0..BUCKET_COUNT {
                let next = if end < element_count {
                    scan[end][digit]
                } else {
                    totals[digit]
                };
                let len = (next - first[digit]) as usize;
                runs[digit] = take_front(&mut buckets[digit], len);
                key_runs[digit] = take_front(&mut key_buckets[digit], len);
            }

            let src = &src[start..end];
            let src_keys = &src_keys[start..end];
            let flags = &flags[start..end];
            let scan = &scan[start..end];
            s.spawn(async move {
                #[cfg(debug_assertions)]
                let mut written: [FixedBitSet; BUCKET_COUNT] =
                    std::array::from_fn(|digit| FixedBitSet::with_capacity(runs[digit].len()));
                for (index, &flag) in flags.iter().enumerate() {
                    let digit = flag as usize;
                    let slot = (scan[index][digit] - first[digit]) as usize;
                    #[cfg(debug_assertions)]
                    debug_assert!(
                        !written[digit].put(slot),
                        "Slot {slot} of bucket {digit} written twice"
                    );
                    runs[digit][slot] = src[index];
                    key_runs[digit][slot] = src_keys[index];
                }
                #[cfg(debug_assertions)]
                for (written, run) in written.iter().zip(&runs) {
                    debug_assert_eq!(written.count_ones(..), run.len());
                }
            });
        }
    });
    debug_assert!(buckets.iter().all(|bucket| bucket.is_empty()));
}
