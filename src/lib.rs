#![deny(
    warnings,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    missing_docs,
    clippy::suboptimal_flops,
    clippy::imprecise_flops,
    clippy::branches_sharing_code,
    clippy::suspicious_operation_groupings,
    clippy::useless_let_if_seq
)]
#![allow(clippy::too_many_arguments, clippy::type_complexity)]

//! Back-to-front depth sorting of point-particle splats for the Bevy game
//! engine.
//!
//! Alpha-blended particles must be drawn from the farthest to the nearest
//! relative to the camera. This library re-sorts up to millions of particles
//! every frame on the GPU, with a hierarchical, multi-pass radix sort running
//! entirely on device-resident buffers.
//!
//! Each particle is keyed by its depth along the sort axis, quantized to 16
//! bits over a depth window. The particles are then sorted by ascending key
//! with a stable least-significant-digit radix sort of 8 passes of 2 bits.
//! The particle buffer passed as input holds the sorted particles once the
//! sort completes, ready to be drawn.
//!
//! # Engines
//!
//! The sort comes with two engines executing the same [`SortSchedule`]:
//!
//! - [`GpuRadixSort`] records the sort kernels as WGSL compute dispatches
//!   into a command encoder, with pipelines compiled by Bevy's
//!   `PipelineCache`;
//! - [`RadixSortEngine`] runs the same kernels on the CPU, spread over Bevy's
//!   `ComputeTaskPool`. It's mostly useful as a reference and for testing.
//!
//! ```
//! # use bevy::math::Vec3;
//! use bevy_splat::prelude::*;
//!
//! let mut particles = scatter_particles(1000, 1.0, 42);
//! let mut scratch = particles.clone();
//!
//! // Camera looking down -Z; sort along the negated view direction.
//! let mut engine = RadixSortEngine::new(1000, 128)?;
//! engine.sort(&mut particles, &mut scratch, Vec3::Z, -2.0, 2.0)?;
//! # Ok::<(), SortError>(())
//! ```
//!
//! # Plugin
//!
//! Add the [`SplatSortPlugin`] to your app to allocate the particle buffers
//! in the render world, and sort them every frame relative to the active
//! camera:
//!
//! ```no_run
//! # use bevy::prelude::*;
//! use bevy_splat::prelude::*;
//!
//! App::default()
//!     .add_plugins(DefaultPlugins)
//!     .add_plugins(SplatSortPlugin {
//!         settings: SortSettings {
//!             particle_count: 65536,
//!             depth_window: DepthWindow::ClipPlanes,
//!             ..default()
//!         },
//!     })
//!     .run();
//! ```
//!
//! Renderers draw from [`ParticleBuffers::primary`] after the sort node ran.

mod error;
mod particle;
mod plugin;
mod render;
mod settings;
mod sort;

#[cfg(test)]
mod test_utils;

pub use error::{SettingsError, SortError};
pub use particle::{scatter_particles, Particle};
pub use plugin::{
    ExtractedSortView, ParticleBuffers, ParticleSortLabel, ParticleSortNode, ParticleSorter,
    SplatSortPlugin,
};
pub use render::{check_device_limits, GpuRadixSort, SortShaders};
pub use settings::{DepthWindow, SortSettings};
pub use sort::{
    block_scan, bucket_bases, digit, BucketCounts, BufferSlot, DepthProjector, DepthRange,
    Dispatch, KeyProjector, LevelHierarchy, PingPong, RadixSortEngine, RecordLayout, ScanLevel,
    SortBarrier, SortCommand, SortKernel, SortRecord, SortSchedule, BUCKET_COUNT, KEY_BITS,
    KEY_MAX, PASS_COUNT, RADIX_BITS,
};

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::*;
}

/// Get the smallest multiple of `align` greater than or equal to `value`.
pub(crate) fn next_multiple_of(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_multiple() {
        // Element counts padded to whole blocks
        assert_eq!(next_multiple_of(1000, 128), 1024);
        assert_eq!(next_multiple_of(1024, 128), 1024);
        assert_eq!(next_multiple_of(7, 4), 8);
        assert_eq!(next_multiple_of(2, 4), 4);
        assert_eq!(next_multiple_of(1, 2), 2);
        assert_eq!(next_multiple_of(0, 4), 0);

        // Uniform items padded to the dynamic offset alignment
        assert_eq!(next_multiple_of(32, 256), 256);
        assert_eq!(next_multiple_of(16, 256), 256);

        // Sum buffers hold one entry per block, padded so the next level
        // scans whole blocks.
        let hierarchy = LevelHierarchy::new(100, 4).unwrap();
        let block_counts: Vec<u32> = hierarchy.levels().iter().map(|l| l.block_count).collect();
        assert_eq!(block_counts, [25, 7, 2, 1]);
        let sums: Vec<usize> = hierarchy.levels().iter().map(|l| l.sums_len(4)).collect();
        assert_eq!(sums, [28, 8, 4, 4]);
        let scans: Vec<usize> = hierarchy.levels().iter().map(|l| l.scan_len(4)).collect();
        assert_eq!(scans, [100, 28, 8, 4]);
        for (level, next) in hierarchy.levels().iter().zip(&hierarchy.levels()[1..]) {
            assert_eq!(level.sums_len(4), next.scan_len(4));
        }
    }
}
