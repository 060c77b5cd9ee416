use thiserror::Error;

/// Error raised when the sort engine is configured or invoked with arguments
/// violating its preconditions.
///
/// Apart from [`SortError::PipelineNotReady`], which clears once the GPU
/// pipelines finished compiling, every variant is a programmer error reported
/// as early as possible (at construction, or at the start of a call before
/// any buffer is touched).
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SortError {
    /// The engine was asked to sort zero elements.
    #[error("The element count must be positive")]
    ZeroElementCount,

    /// The block size cannot fold blocks together.
    #[error("The block size must be at least 2, got {0}")]
    BlockSizeTooSmall(u32),

    /// A buffer handed to the engine does not match its capacity.
    #[error("Buffer holds {actual} elements but the engine was built for {expected}")]
    BufferLength {
        /// Number of elements the engine was built for.
        expected: usize,
        /// Number of elements actually available in the buffer.
        actual: usize,
    },

    /// The depth window is not a valid `[min, max]` interval.
    #[error("Invalid depth range [{min}, {max}]")]
    InvalidDepthRange {
        /// Lower bound of the window.
        min: f32,
        /// Upper bound of the window.
        max: f32,
    },

    /// The sort axis cannot be normalized.
    #[error("Invalid sort axis {0:?}")]
    InvalidAxis([f32; 3]),

    /// The GPU device cannot run the sort kernels with this configuration.
    #[error("Device limit {limit} is {supported}, but the sort requires {required}")]
    DeviceLimit {
        /// Name of the device limit, as a field of the `wgpu` limits.
        limit: &'static str,
        /// Value required by the engine.
        required: u32,
        /// Value supported by the device.
        supported: u32,
    },

    /// [`GpuRadixSort::encode()`] was called for a pair of buffers other
    /// than the last one prepared.
    ///
    /// [`GpuRadixSort::encode()`]: crate::GpuRadixSort::encode
    #[error("The buffer pair was not prepared before encoding the sort")]
    NotPrepared,

    /// The sort pipelines are still compiling in the [`PipelineCache`].
    ///
    /// [`PipelineCache`]: bevy::render::render_resource::PipelineCache
    #[error("The sort pipelines are not compiled yet")]
    PipelineNotReady,
}

/// Error loading [`SortSettings`] from a RON document.
///
/// [`SortSettings`]: crate::SortSettings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Error during RON format parsing.
    #[error("A RON format error occurred while parsing the sort settings")]
    Ron(#[from] ron::error::SpannedError),

    /// The settings parsed fine but describe an invalid sort.
    #[error("Invalid sort settings: {0}")]
    Invalid(#[from] SortError),
}
