// The `ShaderType` derive emits an unused `check` fn on recent toolchains.
#![allow(dead_code)]

use bevy::{
    log::{debug, trace},
    math::Vec3,
    render::{
        render_resource::{
            BindGroup, BindGroupEntry, BindGroupLayout, BindGroupLayoutEntry, BindingResource,
            BindingType, Buffer, BufferBinding, BufferBindingType, BufferDescriptor, BufferId,
            BufferUsages, CachedComputePipelineId, CachedPipelineState, CommandEncoder,
            CommandEncoderDescriptor, ComputePass, ComputePassDescriptor, ComputePipeline,
            ComputePipelineDescriptor, PipelineCache, ShaderStages, ShaderType, WgpuLimits,
        },
        renderer::{RenderDevice, RenderQueue},
    },
};
use bytemuck::{Pod, Zeroable};

pub(crate) mod aligned_buffer_vec;
mod shaders;

pub use self::shaders::SortShaders;
use self::{aligned_buffer_vec::AlignedBufferVec, shaders::kernel_label};
use crate::{
    BufferSlot, DepthProjector, Dispatch, LevelHierarchy, RecordLayout, SortCommand, SortError,
    SortKernel, SortSchedule, BUCKET_COUNT, PASS_COUNT,
};

/// Per-pass uniform parameters of the sort kernels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable, ShaderType)]
pub(crate) struct GpuPassParams {
    /// Unit sort axis.
    pub axis: Vec3,
    /// Depth mapped to key `0`.
    pub z_min: f32,
    /// Depth mapped to the largest key.
    pub z_max: f32,
    /// First key bit of the digit sorted by the pass.
    pub bit_offset: u32,
    /// Non-zero on the first pass, which derives the keys from the records.
    pub project_keys: u32,
    pub _pad: u32,
}

/// Per-level uniform parameters of the sort kernels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable, ShaderType)]
pub(crate) struct GpuLevelParams {
    /// Number of meaningful items in the level.
    pub item_count: u32,
    /// Size of one element record, in 32-bit words.
    pub record_stride: u32,
    /// Offset of the position inside a record, in 32-bit words.
    pub position_offset: u32,
    pub _pad: u32,
}

/// Number of storage buffers bound by the reorder kernel, the largest of all
/// sort kernels.
const MAX_STORAGE_BUFFERS: u32 = 7;

/// Size of one scan or sum entry on the GPU, a `vec4<u32>`.
const BUCKET_COUNTS_SIZE: u64 = (BUCKET_COUNT * 4) as u64;

/// Check the device can run the sort kernels for the given hierarchy, and
/// bind whole element buffers of the given record layout.
pub fn check_device_limits(
    limits: &WgpuLimits,
    hierarchy: &LevelHierarchy,
    record_layout: RecordLayout,
) -> Result<(), SortError> {
    let block_size = hierarchy.block_size();
    let checks = [
        (
            "max_storage_buffers_per_shader_stage",
            MAX_STORAGE_BUFFERS,
            limits.max_storage_buffers_per_shader_stage,
        ),
        (
            "max_compute_invocations_per_workgroup",
            block_size,
            limits.max_compute_invocations_per_workgroup,
        ),
        (
            "max_compute_workgroup_size_x",
            block_size,
            limits.max_compute_workgroup_size_x,
        ),
        (
            "max_compute_workgroups_per_dimension",
            hierarchy.level(0).block_count,
            limits.max_compute_workgroups_per_dimension,
        ),
    ];
    for (limit, required, supported) in checks {
        if supported < required {
            return Err(SortError::DeviceLimit {
                limit,
                required,
                supported,
            });
        }
    }

    // The level 0 scan and the element buffers are the largest bindings.
    let scan_bytes = hierarchy.padded_element_count() as u64 * BUCKET_COUNTS_SIZE;
    let record_bytes = hierarchy.element_count() as u64 * record_layout.stride_bytes();
    let max_binding = limits.max_storage_buffer_binding_size as u64;
    for required in [scan_bytes, record_bytes] {
        if required > max_binding {
            return Err(SortError::DeviceLimit {
                limit: "max_storage_buffer_binding_size",
                required: u32::try_from(required).unwrap_or(u32::MAX),
                supported: limits.max_storage_buffer_binding_size,
            });
        }
    }
    Ok(())
}

fn storage_entry(binding: u32, read_only: bool) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_buffer(render_device: &RenderDevice, label: &str, size: u64) -> Buffer {
    render_device.create_buffer(&BufferDescriptor {
        label: Some(label),
        size,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn bind_buffers(
    render_device: &RenderDevice,
    label: &'static str,
    layout: &BindGroupLayout,
    buffers: &[&Buffer],
) -> BindGroup {
    let entries: Vec<BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    render_device.create_bind_group(label, layout, &entries)
}

/// Compute pipeline of one sort kernel, with the layout of its storage bind
/// group (group 0).
struct KernelPipeline {
    storage_layout: BindGroupLayout,
    pipeline_id: CachedComputePipelineId,
}

impl KernelPipeline {
    /// Queue the pipeline of `kernel` for compiling. `read_only` lists the
    /// access of the storage bindings, in binding order.
    fn new(
        render_device: &RenderDevice,
        pipeline_cache: &PipelineCache,
        shaders: &SortShaders,
        kernel: SortKernel,
        read_only: &[bool],
        uniform_layout: &BindGroupLayout,
    ) -> Self {
        let label = kernel_label(kernel);
        let entries: Vec<BindGroupLayoutEntry> = read_only
            .iter()
            .enumerate()
            .map(|(binding, read_only)| storage_entry(binding as u32, *read_only))
            .collect();
        let storage_layout = render_device.create_bind_group_layout(label, &entries);
        trace!("Queuing pipeline {} for B={}", label, shaders.block_size());
        let pipeline_id = pipeline_cache.queue_compute_pipeline(ComputePipelineDescriptor {
            label: Some(label.into()),
            layout: vec![storage_layout.clone(), uniform_layout.clone()],
            push_constant_ranges: vec![],
            shader: shaders.get(kernel).clone(),
            shader_defs: vec![],
            entry_point: "main".into(),
        });
        Self {
            storage_layout,
            pipeline_id,
        }
    }

    fn is_ready(&self, pipeline_cache: &PipelineCache, processed: usize) -> bool {
        // Queued pipelines can't be looked up until the cache processed them.
        self.pipeline_id.id() < processed
            && matches!(
                pipeline_cache.get_compute_pipeline_state(self.pipeline_id),
                CachedPipelineState::Ok(_)
            )
    }
}

/// Storage bind groups of a pair of element buffers, indexed by the slot
/// read by the pass.
struct PairBindGroups {
    scan_first: [BindGroup; 2],
    reorder: [BindGroup; 2],
}

type PairKey = (BufferId, BufferId);

#[inline]
fn slot_index(slot: BufferSlot) -> usize {
    match slot {
        BufferSlot::Primary => 0,
        BufferSlot::Secondary => 1,
    }
}

/// Radix sort engine running the sort kernels on the GPU.
///
/// Each kernel of the [`SortSchedule`] is a WGSL compute shader with a
/// workgroup of `B` invocations. The kernel pipelines are queued into Bevy's
/// [`PipelineCache`] on creation and compile in the background; the engine
/// can only encode once [`is_ready()`] returns `true`. Each barrier of the
/// schedule closes the current compute pass, so the writes of a stage are
/// visible to the next one.
///
/// The engine owns its scratch buffers (keys, flags, scan and sum buffers of
/// every level), allocated once for a fixed capacity. The element buffers
/// are owned by the caller, and must be created with
/// [`BufferUsages::STORAGE`] (and `VERTEX` to be drawn after sorting).
///
/// A sort is split in two steps:
/// - [`prepare()`] uploads the per-pass parameters and creates the bind
///   groups of the element buffer pair. Only the bind groups of the last pair
///   are kept, and are re-created when the pair changes;
/// - [`encode()`] records the 8 passes into a command encoder.
///
/// [`sort()`] does both and submits the commands.
///
/// [`is_ready()`]: GpuRadixSort::is_ready
/// [`prepare()`]: GpuRadixSort::prepare
/// [`encode()`]: GpuRadixSort::encode
/// [`sort()`]: GpuRadixSort::sort
pub struct GpuRadixSort {
    hierarchy: LevelHierarchy,
    schedule: SortSchedule,
    record_layout: RecordLayout,
    scan_first: KernelPipeline,
    scan: KernelPipeline,
    resolve: KernelPipeline,
    reorder: KernelPipeline,
    pass_params: AlignedBufferVec<GpuPassParams>,
    level_params: AlignedBufferVec<GpuLevelParams>,
    uniform_bind_group: BindGroup,
    keys: [Buffer; 2],
    flags: Buffer,
    scans: Vec<Buffer>,
    sums: Vec<Buffer>,
    /// Bind groups of the scan of each level; none for level 0.
    scan_bind_groups: Vec<Option<BindGroup>>,
    /// Bind groups of the resolve from each parent level; none for level 0.
    resolve_bind_groups: Vec<Option<BindGroup>>,
    /// Bind groups of the last prepared element buffer pair.
    pair: Option<(PairKey, PairBindGroups)>,
}

impl std::fmt::Debug for GpuRadixSort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuRadixSort")
            .field("hierarchy", &self.hierarchy)
            .field("record_layout", &self.record_layout)
            .field("pair", &self.pair.as_ref().map(|(key, _)| key))
            .finish_non_exhaustive()
    }
}

impl GpuRadixSort {
    /// Create a GPU engine sorting exactly `element_count` records of the
    /// given layout, with the kernels of `shaders`.
    ///
    /// The workgroup size is the block size `shaders` were composed for. The
    /// kernel pipelines are queued into `pipeline_cache`, and are usually
    /// ready after the next frame rendered.
    ///
    /// Fails if the device limits cannot accommodate the sort kernels.
    pub fn new(
        render_device: &RenderDevice,
        pipeline_cache: &PipelineCache,
        shaders: &SortShaders,
        element_count: u32,
        record_layout: RecordLayout,
    ) -> Result<Self, SortError> {
        let block_size = shaders.block_size();
        let hierarchy = LevelHierarchy::new(element_count, block_size)?;
        let limits = render_device.limits();
        check_device_limits(&limits, &hierarchy, record_layout)?;
        let schedule = SortSchedule::new(&hierarchy);

        // Uniforms, shared by all kernels as group 1
        let uniform_entry = |binding, min_binding_size| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: Some(min_binding_size),
            },
            count: None,
        };
        let uniform_layout = render_device.create_bind_group_layout(
            "splat_sort_uniforms",
            &[
                uniform_entry(0, GpuPassParams::min_size()),
                uniform_entry(1, GpuLevelParams::min_size()),
            ],
        );
        let align = limits.min_uniform_buffer_offset_alignment as usize;
        let mut pass_params = AlignedBufferVec::new(
            BufferUsages::UNIFORM,
            align,
            Some("splat_sort_pass_params".to_string()),
        );
        for _ in 0..PASS_COUNT {
            pass_params.push(GpuPassParams::default());
        }
        let mut level_params = AlignedBufferVec::new(
            BufferUsages::UNIFORM,
            align,
            Some("splat_sort_level_params".to_string()),
        );
        for level in hierarchy.levels() {
            level_params.push(GpuLevelParams {
                item_count: level.item_count,
                record_stride: record_layout.stride_words,
                position_offset: record_layout.position_offset_words,
                _pad: 0,
            });
        }
        let uniform_bind_group = render_device.create_bind_group(
            "splat_sort_uniforms",
            &uniform_layout,
            &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::Buffer(BufferBinding {
                        buffer: pass_params.reserve(PASS_COUNT as usize, render_device),
                        offset: 0,
                        size: Some(GpuPassParams::min_size()),
                    }),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Buffer(BufferBinding {
                        buffer: level_params.reserve(hierarchy.level_count(), render_device),
                        offset: 0,
                        size: Some(GpuLevelParams::min_size()),
                    }),
                },
            ],
        );

        let kernel = |kernel, read_only: &[bool]| {
            KernelPipeline::new(
                render_device,
                pipeline_cache,
                shaders,
                kernel,
                read_only,
                &uniform_layout,
            )
        };
        let scan_first = kernel(SortKernel::ScanFirst, &[true, false, false, false, false]);
        let scan = kernel(SortKernel::Scan, &[true, false, false]);
        let resolve = kernel(SortKernel::Resolve, &[true, false]);
        let reorder = kernel(
            SortKernel::Reorder,
            &[true, true, false, false, true, true, true],
        );

        // Scratch buffers
        let key_bytes = hierarchy.padded_element_count() as u64 * 4;
        let keys = [
            storage_buffer(render_device, "splat_sort_keys_primary", key_bytes),
            storage_buffer(render_device, "splat_sort_keys_secondary", key_bytes),
        ];
        let flags = storage_buffer(render_device, "splat_sort_flags", key_bytes);
        let mut scans = Vec::with_capacity(hierarchy.level_count());
        let mut sums = Vec::with_capacity(hierarchy.level_count());
        for (index, level) in hierarchy.levels().iter().enumerate() {
            let scan_bytes = level.scan_len(block_size) as u64 * BUCKET_COUNTS_SIZE;
            let sums_bytes = level.sums_len(block_size) as u64 * BUCKET_COUNTS_SIZE;
            scans.push(storage_buffer(
                render_device,
                &format!("splat_sort_scan{index}"),
                scan_bytes,
            ));
            sums.push(storage_buffer(
                render_device,
                &format!("splat_sort_sums{index}"),
                sums_bytes,
            ));
        }

        // Bind groups of the upper levels only depend on scratch buffers
        let mut scan_bind_groups = vec![None];
        let mut resolve_bind_groups = vec![None];
        for index in 1..hierarchy.level_count() {
            scan_bind_groups.push(Some(bind_buffers(
                render_device,
                kernel_label(SortKernel::Scan),
                &scan.storage_layout,
                &[&sums[index - 1], &scans[index], &sums[index]],
            )));
            resolve_bind_groups.push(Some(bind_buffers(
                render_device,
                kernel_label(SortKernel::Resolve),
                &resolve.storage_layout,
                &[&scans[index], &scans[index - 1]],
            )));
        }

        debug!(
            "Created GPU radix sort: N={} B={} levels={} record_stride={}B",
            element_count,
            block_size,
            hierarchy.level_count(),
            record_layout.stride_bytes(),
        );

        Ok(Self {
            hierarchy,
            schedule,
            record_layout,
            scan_first,
            scan,
            resolve,
            reorder,
            pass_params,
            level_params,
            uniform_bind_group,
            keys,
            flags,
            scans,
            sums,
            scan_bind_groups,
            resolve_bind_groups,
            pair: None,
        })
    }

    /// Number of records sorted by each call.
    #[inline]
    pub fn element_count(&self) -> u32 {
        self.hierarchy.element_count()
    }

    /// The level hierarchy the engine was built with.
    #[inline]
    pub fn hierarchy(&self) -> &LevelHierarchy {
        &self.hierarchy
    }

    /// The command list encoded by each sort.
    #[inline]
    pub fn schedule(&self) -> &SortSchedule {
        &self.schedule
    }

    /// Layout of the sorted records.
    #[inline]
    pub fn record_layout(&self) -> RecordLayout {
        self.record_layout
    }

    /// Check whether all kernel pipelines finished compiling.
    pub fn is_ready(&self, pipeline_cache: &PipelineCache) -> bool {
        let processed = pipeline_cache.pipelines().count();
        [&self.scan_first, &self.scan, &self.resolve, &self.reorder]
            .iter()
            .all(|kernel| kernel.is_ready(pipeline_cache, processed))
    }

    fn check_buffer(&self, buffer: &Buffer) -> Result<(), SortError> {
        let stride = self.record_layout.stride_bytes();
        let expected = self.element_count() as usize;
        let actual = (buffer.size() / stride) as usize;
        if actual < expected {
            return Err(SortError::BufferLength { expected, actual });
        }
        Ok(())
    }

    /// Upload the sort parameters, and create the bind groups of the
    /// `input`/`output` pair if it differs from the previous one.
    ///
    /// Must be called before [`encode()`] each time the projection changes,
    /// and each time the buffer pair changes.
    ///
    /// [`encode()`]: GpuRadixSort::encode
    pub fn prepare(
        &mut self,
        render_device: &RenderDevice,
        render_queue: &RenderQueue,
        input: &Buffer,
        output: &Buffer,
        projector: &DepthProjector,
    ) -> Result<(), SortError> {
        self.check_buffer(input)?;
        self.check_buffer(output)?;

        let key = (input.id(), output.id());
        if self.pair.as_ref().map(|(cached, _)| *cached) != Some(key) {
            trace!("Creating sort bind groups for buffer pair {:?}", key);
            let groups = self.create_pair_bind_groups(render_device, input, output);
            self.pair = Some((key, groups));
        }

        let range = projector.range();
        for pass in 0..PASS_COUNT {
            self.pass_params.set(
                pass as usize,
                GpuPassParams {
                    axis: projector.axis(),
                    z_min: range.min(),
                    z_max: range.max(),
                    bit_offset: pass * crate::RADIX_BITS,
                    project_keys: (pass == 0) as u32,
                    _pad: 0,
                },
            );
        }
        debug_assert_eq!(self.pass_params.len(), PASS_COUNT as usize);
        debug_assert_eq!(self.level_params.len(), self.hierarchy.level_count());
        self.pass_params.write_buffer(render_device, render_queue);
        self.level_params.write_buffer(render_device, render_queue);
        Ok(())
    }

    fn create_pair_bind_groups(
        &self,
        render_device: &RenderDevice,
        input: &Buffer,
        output: &Buffer,
    ) -> PairBindGroups {
        let top = self.hierarchy.top_level();
        let records = [input, output];
        let scan_first = |slot: usize| {
            bind_buffers(
                render_device,
                kernel_label(SortKernel::ScanFirst),
                &self.scan_first.storage_layout,
                &[
                    records[slot],
                    &self.keys[slot],
                    &self.flags,
                    &self.scans[0],
                    &self.sums[0],
                ],
            )
        };
        let reorder = |slot: usize| {
            let other = 1 - slot;
            bind_buffers(
                render_device,
                kernel_label(SortKernel::Reorder),
                &self.reorder.storage_layout,
                &[
                    records[slot],
                    &self.keys[slot],
                    records[other],
                    &self.keys[other],
                    &self.flags,
                    &self.scans[0],
                    &self.sums[top],
                ],
            )
        };
        PairBindGroups {
            scan_first: [scan_first(0), scan_first(1)],
            reorder: [reorder(0), reorder(1)],
        }
    }

    fn compute_pipeline<'a>(
        &self,
        pipeline_cache: &'a PipelineCache,
        kernel: SortKernel,
    ) -> Result<&'a ComputePipeline, SortError> {
        let pipeline = match kernel {
            SortKernel::ScanFirst => &self.scan_first,
            SortKernel::Scan => &self.scan,
            SortKernel::Resolve => &self.resolve,
            SortKernel::Reorder => &self.reorder,
        };
        pipeline_cache
            .get_compute_pipeline(pipeline.pipeline_id)
            .ok_or(SortError::PipelineNotReady)
    }

    /// Record one dispatch into a compute pass.
    fn record<'a>(
        &'a self,
        compute_pass: &mut ComputePass<'a>,
        pipeline: &'a ComputePipeline,
        dispatch: &Dispatch,
        groups: &'a PairBindGroups,
    ) -> Result<(), SortError> {
        let slot = slot_index(dispatch.input);
        let level = dispatch.level as usize;
        let (bind_group, level_index) = match dispatch.kernel {
            SortKernel::ScanFirst => (Some(&groups.scan_first[slot]), 0),
            SortKernel::Scan => (self.scan_bind_groups[level].as_ref(), level),
            SortKernel::Resolve => (self.resolve_bind_groups[level].as_ref(), level - 1),
            SortKernel::Reorder => (Some(&groups.reorder[slot]), 0),
        };
        let bind_group = bind_group.ok_or(SortError::NotPrepared)?;
        trace!(
            "dispatch {:?} pass={} level={} workgroups={}",
            dispatch.kernel,
            dispatch.pass,
            dispatch.level,
            dispatch.workgroups
        );
        compute_pass.set_pipeline(pipeline);
        compute_pass.set_bind_group(0, bind_group, &[]);
        compute_pass.set_bind_group(
            1,
            &self.uniform_bind_group,
            &[
                self.pass_params.dynamic_offset(dispatch.pass as usize),
                self.level_params.dynamic_offset(level_index),
            ],
        );
        compute_pass.dispatch_workgroups(dispatch.workgroups, 1, 1);
        Ok(())
    }

    /// Encode the full sort of `input` into `encoder`.
    ///
    /// The pair must be the last one passed to [`prepare()`], and the kernel
    /// pipelines must be compiled (see [`is_ready()`]). `output` is used as
    /// scratch. Returns the slot holding the result, which is always
    /// [`BufferSlot::Primary`] (that is, `input`).
    ///
    /// [`prepare()`]: GpuRadixSort::prepare
    /// [`is_ready()`]: GpuRadixSort::is_ready
    pub fn encode(
        &self,
        pipeline_cache: &PipelineCache,
        encoder: &mut CommandEncoder,
        input: &Buffer,
        output: &Buffer,
    ) -> Result<BufferSlot, SortError> {
        #[cfg(feature = "trace")]
        let _span = bevy::log::info_span!("encode_gpu_sort").entered();

        let groups = match &self.pair {
            Some((key, groups)) if *key == (input.id(), output.id()) => groups,
            _ => return Err(SortError::NotPrepared),
        };
        if !self.is_ready(pipeline_cache) {
            return Err(SortError::PipelineNotReady);
        }

        // Each run of dispatches between two barriers is one compute pass.
        let stages = self
            .schedule
            .commands()
            .split(|command| matches!(command, SortCommand::Barrier(_)));
        for stage in stages.filter(|stage| !stage.is_empty()) {
            let mut compute_pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("splat_sort"),
                timestamp_writes: None,
            });
            for command in stage {
                if let SortCommand::Dispatch(dispatch) = command {
                    let pipeline = self.compute_pipeline(pipeline_cache, dispatch.kernel)?;
                    self.record(&mut compute_pass, pipeline, dispatch, groups)?;
                }
            }
        }
        Ok(self.schedule.result())
    }

    /// Sort `input` along `axis` and submit the work to `render_queue`.
    ///
    /// Convenience for [`prepare()`] and [`encode()`] with a new encoder.
    ///
    /// [`prepare()`]: GpuRadixSort::prepare
    /// [`encode()`]: GpuRadixSort::encode
    pub fn sort(
        &mut self,
        render_device: &RenderDevice,
        render_queue: &RenderQueue,
        pipeline_cache: &PipelineCache,
        input: &Buffer,
        output: &Buffer,
        axis: Vec3,
        z_min: f32,
        z_max: f32,
    ) -> Result<BufferSlot, SortError> {
        let projector = DepthProjector::from_window(axis, z_min, z_max)?;
        self.prepare(render_device, render_queue, input, output, &projector)?;
        let mut encoder = render_device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("splat_sort"),
        });
        let slot = self.encode(pipeline_cache, &mut encoder, input, output)?;
        render_queue.submit(Some(encoder.finish()));
        Ok(slot)
    }
}


#[cfg(all(test, feature = "gpu_tests"))]
mod gpu_tests {
    use super::*;
    use crate::{scatter_particles, test_utils::MockRenderer, Particle, RadixSortEngine, SortRecord};

    fn position_bits(particles: &[Particle]) -> Vec<[u32; 3]> {
        let mut bits: Vec<[u32; 3]> = particles
            .iter()
            .map(|p| p.position.map(f32::to_bits))
            .collect();
        bits.sort_unstable();
        bits
    }

    /// Sort `particles` on the GPU, and return the sorted particles.
    fn sort_on_gpu(
        particles: &[Particle],
        block_size: u32,
        axis: Vec3,
        z_min: f32,
        z_max: f32,
    ) -> Vec<Particle> {
        let count = particles.len() as u32;
        let mut renderer = MockRenderer::new();
        let mut gpu = renderer.sort_engine(count, block_size, RecordLayout::of::<Particle>());

        let input = renderer.storage_buffer(bytemuck::cast_slice(particles));
        let output = renderer.storage_buffer(bytemuck::cast_slice(particles));
        let slot = gpu
            .sort(
                renderer.render_device(),
                renderer.render_queue(),
                renderer.pipeline_cache(),
                &input,
                &output,
                axis,
                z_min,
                z_max,
            )
            .unwrap();
        assert_eq!(slot, BufferSlot::Primary);
        bytemuck::pod_collect_to_vec(&renderer.read_buffer(&input))
    }

    fn sort_scattered(count: u32, block_size: u32, axis: Vec3, z_min: f32, z_max: f32) {
        let particles = scatter_particles(count as usize, 1.5, count as u64);
        let sorted = sort_on_gpu(&particles, block_size, axis, z_min, z_max);

        // Same particles, in key order. Arbitrary depths may round to a
        // neighbor key on the GPU, so allow one key step.
        assert_eq!(position_bits(&sorted), position_bits(&particles));
        let projector = DepthProjector::from_window(axis, z_min, z_max).unwrap();
        for pair in sorted.windows(2) {
            let k0 = projector.key(pair[0].position());
            let k1 = projector.key(pair[1].position());
            assert!(k0 <= k1.saturating_add(1), "keys out of order: {k0} > {k1}");
        }
    }

    /// Sort particles sharing few depths, each tagged with its index in its
    /// scale, and check the GPU result equals the host one record for record.
    ///
    /// Depths are on a 0.25 grid of `[-2, 2)`, which quantizes to keys with a
    /// fractional part of at least 1/16 before truncation, so the GPU and the
    /// host derive the same keys.
    fn sort_ties(count: u32, block_size: u32) {
        let particles: Vec<Particle> = (0..count)
            .map(|index| {
                let step = (index * 7 + index / 5) % 16;
                Particle {
                    scale: index as f32,
                    ..Particle::at(Vec3::new(0., 0., -2. + 0.25 * step as f32))
                }
            })
            .collect();
        let sorted = sort_on_gpu(&particles, block_size, Vec3::Z, -2., 2.);

        let mut host = particles.clone();
        let mut scratch = particles.clone();
        RadixSortEngine::new(count, block_size)
            .unwrap()
            .sort(&mut host, &mut scratch, Vec3::Z, -2., 2.)
            .unwrap();
        assert_eq!(sorted.len(), host.len());
        for (index, (gpu, host)) in sorted.iter().zip(&host).enumerate() {
            assert_eq!(gpu, host, "record {index} differs from the host sort");
        }

        // Within each depth, the original order is kept.
        for pair in sorted.windows(2) {
            if pair[0].position == pair[1].position {
                assert!(pair[0].scale < pair[1].scale);
            }
        }
    }

    #[test]
    fn matches_host_single_block() {
        sort_scattered(128, 128, Vec3::Z, -2., 2.);
    }

    #[test]
    fn matches_host_padded() {
        sort_scattered(1000, 128, Vec3::new(1., 1., 0.), -2., 2.);
    }

    #[test]
    fn matches_host_deep() {
        sort_scattered(5000, 4, Vec3::NEG_Y, -1., 1.);
    }

    #[test]
    fn stable_ties_deep() {
        sort_ties(5000, 4);
    }

    #[test]
    fn stable_ties_padded() {
        sort_ties(1000, 128);
    }

    #[test]
    fn stable_ties_two_levels() {
        sort_ties(4096, 64);
    }

    #[test]
    fn pair_cache_bounded() {
        let mut renderer = MockRenderer::new();
        let mut gpu = renderer.sort_engine(256, 32, RecordLayout::of::<Particle>());
        let particles = scatter_particles(256, 1., 3);
        let projector = DepthProjector::from_window(Vec3::Z, -1., 1.).unwrap();

        let mut previous = None;
        for _ in 0..8 {
            let input = renderer.storage_buffer(bytemuck::cast_slice(&particles));
            let output = renderer.storage_buffer(bytemuck::cast_slice(&particles));
            gpu.prepare(
                renderer.render_device(),
                renderer.render_queue(),
                &input,
                &output,
                &projector,
            )
            .unwrap();
            // Only the bind groups of the last pair are kept.
            let key = gpu.pair.as_ref().map(|(key, _)| *key);
            assert_eq!(key, Some((input.id(), output.id())));
            let mut encoder = renderer
                .render_device()
                .create_command_encoder(&CommandEncoderDescriptor::default());
            assert_eq!(
                gpu.encode(renderer.pipeline_cache(), &mut encoder, &input, &output),
                Ok(BufferSlot::Primary)
            );
            if let Some((old_input, old_output)) = previous.take() {
                assert_eq!(
                    gpu.encode(
                        renderer.pipeline_cache(),
                        &mut encoder,
                        &old_input,
                        &old_output
                    ),
                    Err(SortError::NotPrepared)
                );
            }
            renderer.render_queue().submit(Some(encoder.finish()));
            previous = Some((input, output));
        }

        // Swapping the roles is a different pair.
        let (input, output) = previous.unwrap();
        gpu.prepare(
            renderer.render_device(),
            renderer.render_queue(),
            &output,
            &input,
            &projector,
        )
        .unwrap();
        let key = gpu.pair.as_ref().map(|(key, _)| *key);
        assert_eq!(key, Some((output.id(), input.id())));
    }

    #[test]
    fn encode_requires_prepare() {
        let mut renderer = MockRenderer::new();
        let gpu = renderer.sort_engine(64, 32, RecordLayout::of::<Particle>());
        let particles = scatter_particles(64, 1., 0);
        let input = renderer.storage_buffer(bytemuck::cast_slice(&particles));
        let output = renderer.storage_buffer(bytemuck::cast_slice(&particles));
        let mut encoder = renderer
            .render_device()
            .create_command_encoder(&CommandEncoderDescriptor::default());
        assert_eq!(
            gpu.encode(renderer.pipeline_cache(), &mut encoder, &input, &output),
            Err(SortError::NotPrepared)
        );
    }

    #[test]
    fn encode_requires_pipelines() {
        let mut renderer = MockRenderer::new();
        let shaders = renderer.shaders(32);
        let mut gpu = GpuRadixSort::new(
            renderer.render_device(),
            renderer.pipeline_cache(),
            &shaders,
            64,
            RecordLayout::of::<Particle>(),
        )
        .unwrap();
        // Queued, but not compiled before the next frame
        assert!(!gpu.is_ready(renderer.pipeline_cache()));

        let particles = scatter_particles(64, 1., 0);
        let input = renderer.storage_buffer(bytemuck::cast_slice(&particles));
        let output = renderer.storage_buffer(bytemuck::cast_slice(&particles));
        let projector = DepthProjector::from_window(Vec3::Z, -1., 1.).unwrap();
        gpu.prepare(
            renderer.render_device(),
            renderer.render_queue(),
            &input,
            &output,
            &projector,
        )
        .unwrap();
        let mut encoder = renderer
            .render_device()
            .create_command_encoder(&CommandEncoderDescriptor::default());
        assert_eq!(
            gpu.encode(renderer.pipeline_cache(), &mut encoder, &input, &output),
            Err(SortError::PipelineNotReady)
        );

        renderer.wait_until_ready(&gpu);
        assert_eq!(
            gpu.encode(renderer.pipeline_cache(), &mut encoder, &input, &output),
            Ok(BufferSlot::Primary)
        );
    }

    #[test]
    fn buffer_too_small() {
        let mut renderer = MockRenderer::new();
        let mut gpu = renderer.sort_engine(64, 32, RecordLayout::of::<Particle>());
        let particles = scatter_particles(64, 1., 0);
        let input = renderer.storage_buffer(bytemuck::cast_slice(&particles));
        let output = renderer.storage_buffer(bytemuck::cast_slice(&particles[..32]));
        let projector = DepthProjector::from_window(Vec3::Z, -1., 1.).unwrap();
        assert_eq!(
            gpu.prepare(
                renderer.render_device(),
                renderer.render_queue(),
                &input,
                &output,
                &projector
            ),
            Err(SortError::BufferLength {
                expected: 64,
                actual: 32
            })
        );
    }
}
