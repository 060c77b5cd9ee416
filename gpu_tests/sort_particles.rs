//! Test that the particle buffers sorted each frame by the plugin end up
//! back-to-front, and agree with the host engine.
//!
//! - Add the sort plugin with a camera on +Z looking at the origin.
//! - Render frames until the sort kernels are compiled and ran.
//! - Read back the primary particle buffer and compare with the host sort.

use anyhow::{bail, Context};
use bevy::{
    app::PluginsState,
    log::{info, LogPlugin},
    prelude::*,
    render::{
        render_resource::{
            BufferDescriptor, BufferUsages, CommandEncoderDescriptor, Maintain, MapMode,
            PipelineCache,
        },
        renderer::{RenderDevice, RenderQueue},
        RenderApp,
    },
    tasks::tick_global_task_pools_on_main_thread,
    window::ExitCondition,
    winit::WinitPlugin,
};
use bevy_splat::prelude::*;
use futures::{channel::oneshot, executor::block_on};

const PARTICLE_COUNT: u32 = 1 << 16;
const MAX_FRAMES: u32 = 500;

fn setup(mut commands: Commands) {
    commands.spawn(Camera3dBundle {
        transform: Transform::from_xyz(0., 0., 5.).looking_at(Vec3::ZERO, Vec3::Y),
        ..default()
    });
}

fn read_back(world: &World) -> anyhow::Result<Vec<Particle>> {
    let render_device = world.resource::<RenderDevice>();
    let render_queue = world.resource::<RenderQueue>();
    let buffer = &world.resource::<ParticleBuffers>().primary;
    let size = buffer.size();
    let staging = render_device.create_buffer(&BufferDescriptor {
        label: Some("readback"),
        size,
        usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = render_device.create_command_encoder(&CommandEncoderDescriptor::default());
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    render_queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = oneshot::channel();
    slice.map_async(MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    let _ = render_device.poll(Maintain::Wait);
    block_on(receiver)??;
    let particles = bytemuck::pod_collect_to_vec(&slice.get_mapped_range()[..]);
    staging.unmap();
    Ok(particles)
}

/// Whether the sort node encoded the sort during the last frame.
fn sorted_this_frame(world: &World) -> bool {
    let sorter = world.resource::<ParticleSorter>();
    sorter.armed && sorter.engine.is_ready(world.resource::<PipelineCache>())
}

fn main() -> anyhow::Result<()> {
    let settings = SortSettings {
        particle_count: PARTICLE_COUNT,
        ..default()
    };

    let mut app = App::default();
    app.add_plugins(
        DefaultPlugins
            .build()
            .disable::<WinitPlugin>()
            .set(LogPlugin {
                level: bevy::log::Level::INFO,
                filter: "bevy_splat=trace,wgpu_hal=warn".to_string(),
                ..default()
            })
            .set(WindowPlugin {
                primary_window: None,
                exit_condition: ExitCondition::DontExit,
                ..default()
            }),
    )
    .add_plugins(SplatSortPlugin { settings })
    .add_systems(Startup, setup);

    while app.plugins_state() == PluginsState::Adding {
        tick_global_task_pools_on_main_thread();
    }
    app.finish();
    app.cleanup();
    if app
        .get_sub_app(RenderApp)
        .context("no renderer")?
        .world()
        .get_resource::<ParticleSorter>()
        .is_none()
    {
        bail!("the particle sort failed to initialize");
    }

    // Sort at least twice, so the last sort starts from an already sorted
    // buffer.
    let mut sorted_frames = 0;
    for _ in 0..MAX_FRAMES {
        app.update();
        if sorted_this_frame(app.sub_app(RenderApp).world()) {
            sorted_frames += 1;
            if sorted_frames == 2 {
                break;
            }
        }
    }
    if sorted_frames < 2 {
        bail!("particles not sorted after {} frames", MAX_FRAMES);
    }
    let sorted = read_back(app.sub_app(RenderApp).world())?;

    // Camera on +Z looking at the origin: the sort axis is +Z, and farther
    // particles have lower depth.
    let axis = Vec3::Z;
    let range = DepthRange::PARTICLE_WINDOW;
    let projector = DepthProjector::new(axis, range)?;
    for (index, pair) in sorted.windows(2).enumerate() {
        let k0 = projector.key(pair[0].position());
        let k1 = projector.key(pair[1].position());
        // Arbitrary depths may round to a neighbor key on the GPU
        if k0 > k1.saturating_add(1) {
            bail!(
                "particles {} and {} out of order: {} > {}",
                index,
                index + 1,
                k0,
                k1
            );
        }
    }

    let particles = scatter_particles(PARTICLE_COUNT as usize, 1., settings.seed);
    let mut host = particles.clone();
    let mut scratch = particles;
    RadixSortEngine::new(PARTICLE_COUNT, settings.block_size)?
        .sort(&mut host, &mut scratch, axis, range.min(), range.max())?;
    let position_bits = |particles: &[Particle]| {
        let mut bits: Vec<[u32; 3]> = particles
            .iter()
            .map(|p| p.position.map(f32::to_bits))
            .collect();
        bits.sort_unstable();
        bits
    };
    if position_bits(&sorted) != position_bits(&host) {
        bail!("GPU sort is not a permutation of the particles");
    }
    let mismatches = sorted.iter().zip(&host).filter(|(a, b)| a != b).count();
    info!(
        "{} of {} particles placed differently from the host sort",
        mismatches, PARTICLE_COUNT
    );

    let near = sorted.last().context("empty particle buffer")?;
    info!("Nearest particle at {:?}", near.position);
    info!("SUCCESS!");
    Ok(())
}
