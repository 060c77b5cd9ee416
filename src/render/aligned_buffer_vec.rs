use bevy::{
    log::trace,
    render::{
        render_resource::{Buffer, BufferAddress, BufferDescriptor, BufferUsages},
        renderer::{RenderDevice, RenderQueue},
    },
};
use bytemuck::{cast_slice, Pod};

use crate::next_multiple_of;

/// Like Bevy's `BufferVec`, but with an explicit item alignment.
///
/// This is a helper to ensure each item starts at an offset usable as a
/// dynamic offset, depending on the device constraints. Generally the
/// alignment is `min_uniform_buffer_offset_alignment` of the device limits.
pub(crate) struct AlignedBufferVec<T: Pod> {
    values: Vec<T>,
    buffer: Option<Buffer>,
    capacity: usize,
    item_size: usize,
    aligned_size: usize,
    buffer_usage: BufferUsages,
    label: Option<String>,
}

impl<T: Pod> AlignedBufferVec<T> {
    pub fn new(buffer_usage: BufferUsages, item_align: usize, label: Option<String>) -> Self {
        let item_size = size_of::<T>();
        let aligned_size = next_multiple_of(item_size, item_align);
        assert!(aligned_size >= item_size);
        assert!(aligned_size % item_align == 0);
        Self {
            values: Vec::new(),
            buffer: None,
            capacity: 0,
            item_size,
            aligned_size,
            buffer_usage,
            label,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn aligned_size(&self) -> usize {
        self.aligned_size
    }

    /// Byte offset of the item at `index`, as a dynamic offset.
    #[inline]
    pub fn dynamic_offset(&self, index: usize) -> u32 {
        (index * self.aligned_size()) as u32
    }

    pub fn push(&mut self, value: T) -> usize {
        let index = self.values.len();
        self.values.push(value);
        index
    }

    /// Overwrite an existing item.
    pub fn set(&mut self, index: usize, value: T) {
        self.values[index] = value;
    }

    /// Make sure the GPU buffer can hold `capacity` items, and return it.
    pub fn reserve(&mut self, capacity: usize, device: &RenderDevice) -> &Buffer {
        if capacity > self.capacity {
            self.capacity = capacity;
            self.buffer = None;
        }
        let size = (self.aligned_size * self.capacity.max(1)) as BufferAddress;
        let label = self.label.as_deref();
        let usage = BufferUsages::COPY_DST | self.buffer_usage;
        self.buffer.get_or_insert_with(|| {
            trace!("Allocating aligned buffer {:?} of {} bytes", label, size);
            device.create_buffer(&BufferDescriptor {
                label,
                size,
                usage,
                mapped_at_creation: false,
            })
        })
    }

    pub fn write_buffer(&mut self, device: &RenderDevice, queue: &RenderQueue) {
        if self.values.is_empty() {
            return;
        }
        trace!(
            "write_buffer: values.len={} item_size={} aligned_size={}",
            self.values.len(),
            self.item_size,
            self.aligned_size
        );
        let bytes = self.aligned_bytes();
        let buffer = self.reserve(self.values.len(), device);
        queue.write_buffer(buffer, 0, &bytes);
    }

    /// Content of the buffer, with each item padded to the aligned size.
    fn aligned_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.aligned_size * self.values.len()];
        for (value, dst) in self.values.iter().zip(bytes.chunks_mut(self.aligned_size)) {
            let src: &[u8] = cast_slice(std::slice::from_ref(value));
            dst[..self.item_size].copy_from_slice(src);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTS: &[usize] = &[1, 2, 4, 8, 9, 15, 16, 17, 23, 24, 31, 32, 33];

    #[test]
    fn abv_align() {
        for &align in INTS {
            let abv = AlignedBufferVec::<u8>::new(BufferUsages::UNIFORM, align, None);
            assert_eq!(abv.aligned_size(), align);
        }

        for &align in INTS {
            let abv = AlignedBufferVec::<[u8; 27]>::new(BufferUsages::UNIFORM, align, None);
            assert_eq!(abv.aligned_size(), next_multiple_of(27, align));
        }
    }

    #[test]
    fn abv_offsets() {
        let mut abv = AlignedBufferVec::<[u32; 4]>::new(BufferUsages::UNIFORM, 256, None);
        assert_eq!(abv.push([1, 2, 3, 4]), 0);
        assert_eq!(abv.push([5, 6, 7, 8]), 1);
        assert_eq!(abv.len(), 2);
        assert_eq!(abv.dynamic_offset(0), 0);
        assert_eq!(abv.dynamic_offset(1), 256);
        assert!(abv.buffer.is_none());
    }

    #[test]
    fn abv_padding() {
        let mut abv = AlignedBufferVec::<[u8; 3]>::new(BufferUsages::UNIFORM, 8, None);
        abv.push([1, 2, 3]);
        abv.push([4, 5, 6]);
        abv.set(0, [7, 8, 9]);
        assert_eq!(
            abv.aligned_bytes(),
            [7, 8, 9, 0, 0, 0, 0, 0, 4, 5, 6, 0, 0, 0, 0, 0]
        );
    }
}

#[cfg(all(test, feature = "gpu_tests"))]
mod gpu_tests {
    use super::*;
    use crate::test_utils::MockRenderer;

    #[test]
    fn abv_write() {
        let renderer = MockRenderer::new();
        let device = renderer.render_device();
        let queue = renderer.render_queue();

        const ALIGN: usize = 256;
        let mut abv = AlignedBufferVec::<[u32; 4]>::new(
            BufferUsages::UNIFORM | BufferUsages::COPY_SRC,
            ALIGN,
            Some("test".to_string()),
        );
        abv.push([9; 4]);
        abv.push([6; 4]);
        abv.push([3; 4]);
        abv.write_buffer(device, queue);

        let bytes = renderer.read_buffer(abv.reserve(3, device));
        assert_eq!(bytes.len(), ALIGN * 3);
        for (i, value) in [9u32, 6, 3].iter().enumerate() {
            let item = &bytes[i * ALIGN..i * ALIGN + 16];
            assert_eq!(item, bytemuck::bytes_of(&[*value; 4]));
        }
    }
}
