use bevy::math::Vec3;
use bytemuck::Pod;

/// A fixed-stride record the sort engine can reorder.
///
/// The engine never inspects a record beyond its position, which is read once
/// per sort to derive the record's depth key. Records are moved as whole
/// plain-old-data values, which is why the trait requires [`Pod`].
pub trait SortRecord: Pod + Send + Sync {
    /// Byte offset of the `[f32; 3]` position inside the record.
    ///
    /// Used by the GPU kernels, which see records as untyped 32-bit words.
    const POSITION_OFFSET: usize;

    /// Position of the record, in the same space as the sort axis.
    fn position(&self) -> Vec3;
}

/// Layout of a record as seen by the GPU kernels, in 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordLayout {
    /// Size of one record, in 32-bit words.
    pub stride_words: u32,
    /// Offset of the position inside the record, in 32-bit words.
    pub position_offset_words: u32,
}

impl RecordLayout {
    /// Get the layout of a record type.
    ///
    /// # Panics
    ///
    /// Panics if the record size or position offset is not a multiple of 4
    /// bytes, or if the position does not fit inside the record.
    pub fn of<T: SortRecord>() -> Self {
        let size = size_of::<T>();
        assert!(size % 4 == 0, "record size must be a multiple of 4 bytes");
        assert!(T::POSITION_OFFSET % 4 == 0);
        assert!(T::POSITION_OFFSET + 12 <= size);
        Self {
            stride_words: (size / 4) as u32,
            position_offset_words: (T::POSITION_OFFSET / 4) as u32,
        }
    }

    /// Size of one record, in bytes.
    #[inline]
    pub fn stride_bytes(&self) -> u64 {
        self.stride_words as u64 * 4
    }
}
