use bevy::{
    prelude::*,
    render::{
        extract_resource::ExtractResourcePlugin,
        render_graph::{Node, NodeRunError, RenderGraph, RenderGraphContext, RenderLabel},
        render_resource::{Buffer, BufferInitDescriptor, BufferUsages, PipelineCache, Shader},
        renderer::{RenderAdapterInfo, RenderContext, RenderDevice, RenderQueue},
        Extract, ExtractSchedule, Render, RenderApp, RenderSet,
    },
};

use crate::{
    check_device_limits, scatter_particles, DepthProjector, GpuRadixSort, Particle, RecordLayout,
    SortSettings, SortShaders,
};

/// Render graph label of the [`ParticleSortNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, RenderLabel)]
pub struct ParticleSortLabel;

/// Plugin sorting the particle buffers back-to-front every frame.
///
/// The plugin inserts its [`SortSettings`] into the main world, and extracts
/// them each frame into the render world, along with the view of the active
/// camera with the lowest order. Once the renderer is initialized, it
/// allocates [`ParticleBuffers`] and a [`ParticleSorter`] in the render
/// world, and queues the sort kernels for compiling. Once they're compiled,
/// the sort is encoded each frame before the camera driver node, so all views
/// draw sorted particles.
#[derive(Debug, Default, Clone, Copy)]
pub struct SplatSortPlugin {
    /// Sort configuration. The particle count and block size are read once
    /// when the renderer is initialized.
    pub settings: SortSettings,
}

impl Plugin for SplatSortPlugin {
    fn build(&self, app: &mut App) {
        if let Err(err) = self.settings.validate() {
            warn!("Invalid particle sort settings, the sort will be disabled: {}", err);
        }
        app.insert_resource(self.settings)
            .add_plugins(ExtractResourcePlugin::<SortSettings>::default());
    }

    fn finish(&self, app: &mut App) {
        let Some(render_app) = app.get_sub_app(RenderApp) else {
            return;
        };
        let render_device = render_app.world().resource::<RenderDevice>().clone();
        let adapter_name = render_app
            .world()
            .get_resource::<RenderAdapterInfo>()
            .map(|ai| ai.name.clone())
            .unwrap_or_else(|| "<unknown>".to_string());

        let settings = self.settings;
        let hierarchy = match settings.hierarchy() {
            Ok(hierarchy) => hierarchy,
            Err(err) => {
                error!("Cannot sort particles: {}", err);
                return;
            }
        };
        let record_layout = RecordLayout::of::<Particle>();
        if let Err(err) = check_device_limits(&render_device.limits(), &hierarchy, record_layout) {
            error!(
                "The particle sort is not supported by the GPU device.\n  Current adapter: {}\n  {}",
                adapter_name, err
            );
            return;
        }
        info!(
            "Initializing particle sort of {} particles for GPU adapter {}",
            settings.particle_count, adapter_name
        );

        // The renderer extracts the kernel shaders from the main world.
        let shaders = SortShaders::new(
            &mut app.world_mut().resource_mut::<Assets<Shader>>(),
            settings.block_size,
        );
        app.insert_resource(shaders.clone());

        let render_app = app.sub_app_mut(RenderApp);
        let engine = match GpuRadixSort::new(
            &render_device,
            render_app.world().resource::<PipelineCache>(),
            &shaders,
            settings.particle_count,
            record_layout,
        ) {
            Ok(engine) => engine,
            Err(err) => {
                error!("Failed to create the particle sort: {}", err);
                return;
            }
        };

        let particles = scatter_particles(settings.particle_count as usize, 1., settings.seed);
        let usage = BufferUsages::STORAGE
            | BufferUsages::VERTEX
            | BufferUsages::COPY_DST
            | BufferUsages::COPY_SRC;
        let create = |label: &'static str| {
            render_device.create_buffer_with_data(&BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(&particles),
                usage,
            })
        };
        let buffers = ParticleBuffers {
            primary: create("splat_particles_primary"),
            secondary: create("splat_particles_secondary"),
            count: settings.particle_count,
        };

        render_app
            .insert_resource(buffers)
            .insert_resource(ParticleSorter {
                engine,
                armed: false,
            })
            .add_systems(ExtractSchedule, extract_sort_view)
            .add_systems(Render, prepare_particle_sort.in_set(RenderSet::Prepare));

        let mut graph = render_app.world_mut().resource_mut::<RenderGraph>();
        graph.add_node(ParticleSortLabel, ParticleSortNode);
        graph.add_node_edge(ParticleSortLabel, bevy::render::graph::CameraDriverLabel);
    }
}

/// View of the camera the particles are sorted for, extracted into the
/// render world.
///
/// Absent when no camera is active.
#[derive(Debug, Clone, Copy, PartialEq, Resource)]
pub struct ExtractedSortView {
    /// Unit forward direction of the camera.
    pub view_direction: Vec3,
    /// World-space position of the camera.
    pub eye: Vec3,
    /// Distance to the near clipping plane.
    pub near: f32,
    /// Distance to the far clipping plane.
    pub far: f32,
}

impl ExtractedSortView {
    /// Build the view of a camera.
    pub fn from_camera(transform: &GlobalTransform, projection: &Projection) -> Self {
        let (near, far) = match projection {
            Projection::Perspective(p) => (p.near, p.far),
            Projection::Orthographic(o) => (o.near, o.far),
        };
        Self {
            view_direction: *transform.forward(),
            eye: transform.translation(),
            near,
            far,
        }
    }

    /// Sort axis along which keys grow toward the camera, so that farther
    /// particles sort first.
    #[inline]
    pub fn sort_axis(&self) -> Vec3 {
        -self.view_direction
    }
}

/// Ping-pong pair of particle buffers in the render world.
///
/// After the [`ParticleSortNode`] ran, [`primary`] holds the particles sorted
/// back-to-front.
///
/// [`primary`]: ParticleBuffers::primary
#[derive(Debug, Resource)]
pub struct ParticleBuffers {
    /// Particles drawn each frame; input and result of the sort.
    pub primary: Buffer,
    /// Scratch buffer of the sort.
    pub secondary: Buffer,
    /// Number of particles in each buffer.
    pub count: u32,
}

/// Render world resource owning the GPU sort of the [`ParticleBuffers`].
#[derive(Debug, Resource)]
pub struct ParticleSorter {
    /// The sort engine.
    pub engine: GpuRadixSort,
    /// Whether this frame's sort was prepared and should be encoded.
    pub armed: bool,
}

fn extract_sort_view(
    mut commands: Commands,
    cameras: Extract<Query<(&Camera, &GlobalTransform, &Projection)>>,
) {
    let view = cameras
        .iter()
        .filter(|(camera, _, _)| camera.is_active)
        .min_by_key(|(camera, _, _)| camera.order)
        .map(|(_, transform, projection)| ExtractedSortView::from_camera(transform, projection));
    match view {
        Some(view) => commands.insert_resource(view),
        None => commands.remove_resource::<ExtractedSortView>(),
    }
}

fn prepare_particle_sort(
    settings: Option<Res<SortSettings>>,
    view: Option<Res<ExtractedSortView>>,
    buffers: Res<ParticleBuffers>,
    mut sorter: ResMut<ParticleSorter>,
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
) {
    #[cfg(feature = "trace")]
    let _span = bevy::log::info_span!("prepare_particle_sort").entered();

    sorter.armed = false;
    let (Some(settings), Some(view)) = (settings, view) else {
        return;
    };
    if !settings.enabled {
        return;
    }

    let axis = view.sort_axis();
    let projector = settings
        .depth_window
        .resolve(view.eye, axis, view.near, view.far)
        .and_then(|range| DepthProjector::new(axis, range));
    let projector = match projector {
        Ok(projector) => projector,
        Err(err) => {
            warn!("Skipping particle sort this frame: {}", err);
            return;
        }
    };
    trace!(
        "prepare_particle_sort: axis={:?} range={:?}",
        projector.axis(),
        projector.range()
    );

    match sorter.engine.prepare(
        &render_device,
        &render_queue,
        &buffers.primary,
        &buffers.secondary,
        &projector,
    ) {
        Ok(()) => sorter.armed = true,
        Err(err) => error!("Failed to prepare the particle sort: {}", err),
    }
}

/// Render graph node encoding the particle sort.
///
/// Does nothing until the sort kernels are compiled.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParticleSortNode;

impl Node for ParticleSortNode {
    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let (Some(sorter), Some(buffers)) = (
            world.get_resource::<ParticleSorter>(),
            world.get_resource::<ParticleBuffers>(),
        ) else {
            return Ok(());
        };
        let pipeline_cache = world.resource::<PipelineCache>();
        if !sorter.armed || !sorter.engine.is_ready(pipeline_cache) {
            return Ok(());
        }
        if let Err(err) = sorter.engine.encode(
            pipeline_cache,
            render_context.command_encoder(),
            &buffers.primary,
            &buffers.secondary,
        ) {
            error!("Failed to encode the particle sort: {}", err);
        }
        Ok(())
    }
}
