use bevy::{
    log::trace,
    math::Vec3,
    tasks::{ComputeTaskPool, TaskPool},
};

use super::{
    reorder::{reorder, ReorderBuffers},
    resolve::resolve,
    scan::{project_keys, scan_first, scan_level},
    BucketCounts, BufferSlot, DepthProjector, KeyProjector, LevelHierarchy, SortCommand,
    SortKernel, SortRecord, SortSchedule, BUCKET_COUNT,
};
use crate::SortError;

/// The slice of a slot.
fn slot_mut<'a, X>(slot: BufferSlot, primary: &'a mut [X], secondary: &'a mut [X]) -> &'a mut [X] {
    match slot {
        BufferSlot::Primary => primary,
        BufferSlot::Secondary => secondary,
    }
}

/// Pick the slice read and the slice written by a pass.
fn split_slots<'a, X>(
    input: BufferSlot,
    primary: &'a mut [X],
    secondary: &'a mut [X],
) -> (&'a [X], &'a mut [X]) {
    match input {
        BufferSlot::Primary => (primary, secondary),
        BufferSlot::Secondary => (secondary, primary),
    }
}

/// Radix sort engine running the sort kernels on the CPU.
///
/// Each kernel runs as independent workgroups of `B` lanes spread over
/// Bevy's [`ComputeTaskPool`], and each dispatch joins before the next one
/// starts, which is the host equivalent of a storage barrier. The engine
/// executes the exact same [`SortSchedule`] as the GPU engine, over the same
/// level hierarchy, and is the reference the GPU results are checked
/// against.
///
/// The engine owns all the scratch memory of the sort (keys, flags, scan and
/// sum buffers), allocated once at construction for a fixed capacity. It
/// never owns the elements; they are borrowed for the duration of a call.
///
/// # Example
///
/// ```
/// # use bevy::math::Vec3;
/// # use bevy_splat::{BufferSlot, Particle, RadixSortEngine};
/// let mut particles: Vec<Particle> = (0..300)
///     .map(|i| Particle::at(Vec3::new(0., 0., (i % 7) as f32 * 0.1)))
///     .collect();
/// let mut scratch = particles.clone();
///
/// let mut engine = RadixSortEngine::new(300, 64)?;
/// let slot = engine.sort(&mut particles, &mut scratch, Vec3::Z, -1., 1.)?;
/// assert_eq!(slot, BufferSlot::Primary);
/// assert!(particles.windows(2).all(|w| w[0].position[2] <= w[1].position[2]));
/// # Ok::<(), bevy_splat::SortError>(())
/// ```
#[derive(Debug)]
pub struct RadixSortEngine {
    hierarchy: LevelHierarchy,
    schedule: SortSchedule,
    /// Ping-pong pair of keys, indexed like the element slots.
    keys: [Vec<u16>; 2],
    flags: Vec<u32>,
    scans: Vec<Vec<BucketCounts>>,
    sums: Vec<Vec<BucketCounts>>,
}

impl RadixSortEngine {
    /// Create an engine sorting exactly `element_count` elements, scanned in
    /// blocks of `block_size` items.
    pub fn new(element_count: u32, block_size: u32) -> Result<Self, SortError> {
        let hierarchy = LevelHierarchy::new(element_count, block_size)?;
        let schedule = SortSchedule::new(&hierarchy);
        let padded = hierarchy.padded_element_count();
        let scans = hierarchy
            .levels()
            .iter()
            .map(|level| vec![[0; BUCKET_COUNT]; level.scan_len(block_size)])
            .collect();
        let sums = hierarchy
            .levels()
            .iter()
            .map(|level| vec![[0; BUCKET_COUNT]; level.sums_len(block_size)])
            .collect();
        trace!(
            "Created radix sort engine: N={} B={} levels={:?}",
            element_count,
            block_size,
            hierarchy.levels()
        );
        Ok(Self {
            keys: [vec![0; padded], vec![0; padded]],
            flags: vec![0; padded],
            scans,
            sums,
            hierarchy,
            schedule,
        })
    }

    /// Number of elements sorted by each call.
    #[inline]
    pub fn element_count(&self) -> u32 {
        self.hierarchy.element_count()
    }

    /// Number of items per scan block.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.hierarchy.block_size()
    }

    /// The level hierarchy the engine was built with.
    #[inline]
    pub fn hierarchy(&self) -> &LevelHierarchy {
        &self.hierarchy
    }

    /// The command list executed by each sort.
    #[inline]
    pub fn schedule(&self) -> &SortSchedule {
        &self.schedule
    }

    /// Sort records back-to-front along `axis`.
    ///
    /// Each record is keyed by its depth `dot(position, axis)` quantized over
    /// the `[z_min, z_max]` window, then the records are stably sorted by
    /// ascending key. Both `input` and `output` must hold exactly
    /// [`element_count()`] records; `output` is used as scratch. Returns the
    /// slot holding the result, which is always [`BufferSlot::Primary`]
    /// (that is, `input`).
    ///
    /// [`element_count()`]: RadixSortEngine::element_count
    pub fn sort<T: SortRecord>(
        &mut self,
        input: &mut [T],
        output: &mut [T],
        axis: Vec3,
        z_min: f32,
        z_max: f32,
    ) -> Result<BufferSlot, SortError> {
        let projector = DepthProjector::from_window(axis, z_min, z_max)?;
        self.sort_with(input, output, &projector)
    }

    /// Stably sort records by ascending key, as derived by `projector`.
    ///
    /// The projector is invoked exactly once per record.
    pub fn sort_with<T, P>(
        &mut self,
        input: &mut [T],
        output: &mut [T],
        projector: &P,
    ) -> Result<BufferSlot, SortError>
    where
        T: Copy + Send + Sync,
        P: KeyProjector<T>,
    {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("radix_sort").entered();

        let expected = self.element_count() as usize;
        for actual in [input.len(), output.len()] {
            if actual != expected {
                return Err(SortError::BufferLength { expected, actual });
            }
        }

        let pool = ComputeTaskPool::get_or_init(TaskPool::default);
        let Self {
            hierarchy,
            schedule,
            keys,
            flags,
            scans,
            sums,
        } = self;
        let block_size = hierarchy.block_size();
        let [primary_keys, secondary_keys] = keys;
        let top = hierarchy.top_level();

        // Set by a dispatch, cleared by a barrier.
        let mut pending = false;
        for command in schedule.commands() {
            let dispatch = match command {
                SortCommand::Barrier(_) => {
                    pending = false;
                    continue;
                }
                SortCommand::Dispatch(dispatch) => dispatch,
            };
            debug_assert!(!pending, "Missing barrier before {:?}", dispatch);
            pending = true;

            let level = dispatch.level as usize;
            match dispatch.kernel {
                SortKernel::ScanFirst => {
                    let (records, _) = split_slots(dispatch.input, input, output);
                    let keys = slot_mut(dispatch.input, primary_keys, secondary_keys);
                    if dispatch.projects_keys() {
                        project_keys(pool, records, projector, &mut keys[..expected]);
                    }
                    scan_first(
                        pool,
                        hierarchy.level(0),
                        block_size,
                        dispatch.bit_offset(),
                        keys,
                        flags,
                        &mut scans[0],
                        &mut sums[0],
                    );
                }
                SortKernel::Scan => {
                    let (below, above) = sums.split_at_mut(level);
                    scan_level(
                        pool,
                        hierarchy.level(level),
                        block_size,
                        &below[level - 1],
                        &mut scans[level],
                        &mut above[0],
                    );
                }
                SortKernel::Resolve => {
                    let (below, above) = scans.split_at_mut(level);
                    resolve(
                        pool,
                        hierarchy.level(level - 1),
                        block_size,
                        &above[0],
                        &mut below[level - 1],
                    );
                }
                SortKernel::Reorder => {
                    let (src, dst) = split_slots(dispatch.input, input, output);
                    let (src_keys, dst_keys) =
                        split_slots(dispatch.input, primary_keys, secondary_keys);
                    reorder(
                        pool,
                        &sums[top][0],
                        flags,
                        &scans[0],
                        ReorderBuffers {
                            src,
                            src_keys: &src_keys[..expected],
                            dst,
                            dst_keys: &mut dst_keys[..expected],
                        },
                    );
                }
            }
        }
        debug_assert!(!pending);

        Ok(schedule.result())
    }
}
