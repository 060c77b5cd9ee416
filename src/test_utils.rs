use bevy::math::Vec3;
use bytemuck::{Pod, Zeroable};

use crate::SortRecord;

/// Record carrying its original index, to check permutations and stability.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pod, Zeroable)]
pub(crate) struct Tagged {
    pub tag: u32,
    pub position: [f32; 3],
}

impl Tagged {
    pub fn new(tag: u32, position: Vec3) -> Self {
        Self {
            tag,
            position: position.to_array(),
        }
    }
}

impl SortRecord for Tagged {
    const POSITION_OFFSET: usize = std::mem::offset_of!(Tagged, position);

    fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// Points on the Z axis at the given depths.
pub(crate) fn positions_along_z(z: &[f32]) -> Vec<Vec3> {
    z.iter().map(|z| Vec3::new(0., 0., *z)).collect()
}

/// Records on the Z axis at the given depths, tagged with their index.
pub(crate) fn tagged(z: &[f32]) -> Vec<Tagged> {
    positions_along_z(z)
        .into_iter()
        .enumerate()
        .map(|(index, position)| Tagged::new(index as u32, position))
        .collect()
}

#[cfg(feature = "gpu_tests")]
pub(crate) use self::gpu::MockRenderer;

#[cfg(feature = "gpu_tests")]
mod gpu {
    use std::time::Duration;

    use bevy::{
        app::PluginsState,
        log::LogPlugin,
        prelude::*,
        render::{
            render_resource::{
                Buffer, BufferDescriptor, BufferInitDescriptor, BufferUsages,
                CommandEncoderDescriptor, Maintain, MapMode, PipelineCache, Shader,
            },
            renderer::{RenderDevice, RenderQueue},
            RenderApp,
        },
        tasks::tick_global_task_pools_on_main_thread,
        window::ExitCondition,
        winit::WinitPlugin,
    };
    use futures::{channel::oneshot, executor::block_on};

    use crate::{GpuRadixSort, RecordLayout, SortShaders};

    /// Frames to render before giving up on the sort pipelines compiling.
    const MAX_COMPILE_FRAMES: u32 = 500;

    /// Headless Bevy app with a renderer, for GPU tests.
    pub(crate) struct MockRenderer {
        app: App,
    }

    impl MockRenderer {
        pub fn new() -> Self {
            let mut app = App::new();
            app.add_plugins(
                DefaultPlugins
                    .build()
                    .disable::<LogPlugin>()
                    .disable::<WinitPlugin>()
                    .set(WindowPlugin {
                        primary_window: None,
                        exit_condition: ExitCondition::DontExit,
                        ..default()
                    }),
            );

            // Wait for the renderer to be created
            while app.plugins_state() == PluginsState::Adding {
                tick_global_task_pools_on_main_thread();
            }
            app.finish();
            app.cleanup();
            assert!(
                app.get_sub_app(RenderApp).is_some(),
                "Failed to create the renderer"
            );

            MockRenderer { app }
        }

        fn render_world(&self) -> &World {
            self.app.sub_app(RenderApp).world()
        }

        pub fn render_device(&self) -> &RenderDevice {
            self.render_world().resource::<RenderDevice>()
        }

        pub fn render_queue(&self) -> &RenderQueue {
            self.render_world().resource::<RenderQueue>()
        }

        pub fn pipeline_cache(&self) -> &PipelineCache {
            self.render_world().resource::<PipelineCache>()
        }

        /// Add the sort kernels for a block size to the app's shaders.
        pub fn shaders(&mut self, block_size: u32) -> SortShaders {
            let mut shaders = self.app.world_mut().resource_mut::<Assets<Shader>>();
            SortShaders::new(&mut shaders, block_size)
        }

        /// Create a GPU sort engine, and wait until its pipelines compiled.
        pub fn sort_engine(
            &mut self,
            element_count: u32,
            block_size: u32,
            record_layout: RecordLayout,
        ) -> GpuRadixSort {
            let shaders = self.shaders(block_size);
            let gpu = GpuRadixSort::new(
                self.render_device(),
                self.pipeline_cache(),
                &shaders,
                element_count,
                record_layout,
            )
            .expect("Failed to create the GPU sort");
            self.wait_until_ready(&gpu);
            gpu
        }

        /// Render frames until the pipeline cache compiled the pipelines of
        /// `gpu`.
        pub fn wait_until_ready(&mut self, gpu: &GpuRadixSort) {
            for _ in 0..MAX_COMPILE_FRAMES {
                self.app.update();
                if gpu.is_ready(self.pipeline_cache()) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            panic!(
                "Sort pipelines not compiled after {} frames",
                MAX_COMPILE_FRAMES
            );
        }

        /// Create a buffer usable as sort input or output, initialized with
        /// `contents`.
        pub fn storage_buffer(&self, contents: &[u8]) -> Buffer {
            self.render_device()
                .create_buffer_with_data(&BufferInitDescriptor {
                    label: Some("mock_storage"),
                    contents,
                    usage: BufferUsages::STORAGE
                        | BufferUsages::VERTEX
                        | BufferUsages::COPY_SRC
                        | BufferUsages::COPY_DST,
                })
        }

        /// Read back the content of a buffer created with `COPY_SRC`,
        /// waiting for all submitted work to complete.
        pub fn read_buffer(&self, buffer: &Buffer) -> Vec<u8> {
            let render_device = self.render_device();
            let size = buffer.size();
            let staging = render_device.create_buffer(&BufferDescriptor {
                label: Some("mock_readback"),
                size,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder =
                render_device.create_command_encoder(&CommandEncoderDescriptor::default());
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            self.render_queue().submit(Some(encoder.finish()));

            let slice = staging.slice(..);
            let (sender, receiver) = oneshot::channel();
            slice.map_async(MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
            let _ = render_device.poll(Maintain::Wait);
            block_on(receiver)
                .expect("Readback channel closed")
                .expect("Failed to map readback buffer");

            let bytes = slice.get_mapped_range().to_vec();
            staging.unmap();
            bytes
        }
    }
}
