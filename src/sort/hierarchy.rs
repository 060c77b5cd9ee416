use crate::SortError;

/// Number of key bits consumed by one digit pass.
pub const RADIX_BITS: u32 = 2;

/// Number of buckets a digit can fall into.
pub const BUCKET_COUNT: usize = 1 << RADIX_BITS;

/// Width of a sort key, in bits.
pub const KEY_BITS: u32 = u16::BITS;

/// Number of digit passes needed to sort full 16-bit keys.
pub const PASS_COUNT: u32 = KEY_BITS / RADIX_BITS;

/// Per-bucket counters of one scan entry.
pub type BucketCounts = [u32; BUCKET_COUNT];

/// Extract the digit of `key` sorted by the pass starting at `bit_offset`.
#[inline]
pub fn digit(key: u16, bit_offset: u32) -> u32 {
    (key as u32 >> bit_offset) & (BUCKET_COUNT as u32 - 1)
}

/// Exclusive prefix sum of the 4 bucket totals of a level.
///
/// Entry `d` is the index of the first output slot of bucket `d`.
pub fn bucket_bases(totals: &BucketCounts) -> BucketCounts {
    let mut bases = [0; BUCKET_COUNT];
    let mut sum = 0;
    for (base, total) in bases.iter_mut().zip(totals) {
        *base = sum;
        sum += total;
    }
    bases
}

/// One level of the scan hierarchy.
///
/// Level 0 scans the `N` sorted elements. Level `i + 1` scans the block sums
/// of level `i`, one item per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanLevel {
    /// Number of meaningful items in the level.
    pub item_count: u32,
    /// Number of blocks covering the items, `ceil(item_count / B)`.
    pub block_count: u32,
}

impl ScanLevel {
    fn new(item_count: u32, block_size: u32) -> Self {
        Self {
            item_count,
            block_count: item_count.div_ceil(block_size),
        }
    }

    /// Length of the level's scan buffer, padded to whole blocks.
    #[inline]
    pub fn scan_len(&self, block_size: u32) -> usize {
        self.block_count as usize * block_size as usize
    }

    /// Length of the level's sum buffer.
    ///
    /// One entry per block, padded to whole blocks so the buffer can be
    /// scanned as-is by the next level.
    #[inline]
    pub fn sums_len(&self, block_size: u32) -> usize {
        crate::next_multiple_of(self.block_count as usize, block_size as usize)
    }
}

/// Levels of the scan hierarchy for a given element count and block size.
///
/// The levels are stored in a flat array, built once by folding block counts
/// until a level fits in a single block. Level `LevelCount - 1` therefore
/// always has a single block, and its only block sum holds the 4 global
/// bucket totals of the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelHierarchy {
    element_count: u32,
    block_size: u32,
    levels: Vec<ScanLevel>,
}

impl LevelHierarchy {
    /// Build the hierarchy for `element_count` elements scanned in blocks of
    /// `block_size` items.
    pub fn new(element_count: u32, block_size: u32) -> Result<Self, SortError> {
        if element_count == 0 {
            return Err(SortError::ZeroElementCount);
        }
        if block_size < 2 {
            return Err(SortError::BlockSizeTooSmall(block_size));
        }
        let mut levels = vec![ScanLevel::new(element_count, block_size)];
        while let Some(level) = levels.last().filter(|level| level.block_count > 1) {
            let next = ScanLevel::new(level.block_count, block_size);
            levels.push(next);
        }
        Ok(Self {
            element_count,
            block_size,
            levels,
        })
    }

    /// Number of sorted elements.
    #[inline]
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Number of items per scan block.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of levels, always at least 1.
    #[inline]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// All levels, from the element level 0 to the single-block top level.
    #[inline]
    pub fn levels(&self) -> &[ScanLevel] {
        &self.levels
    }

    /// Get a level by index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= level_count()`.
    #[inline]
    pub fn level(&self, index: usize) -> &ScanLevel {
        &self.levels[index]
    }

    /// Index of the top level, whose single block sum holds the bucket
    /// totals.
    #[inline]
    pub fn top_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Number of elements rounded up to whole level-0 blocks.
    #[inline]
    pub fn padded_element_count(&self) -> usize {
        self.levels[0].scan_len(self.block_size)
    }
}
