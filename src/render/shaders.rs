use bevy::{
    asset::{Assets, Handle},
    ecs::system::Resource,
    render::render_resource::Shader,
};

use crate::SortKernel;

const SORT_COMMON: &str = include_str!("sort_common.wgsl");
const SORT_SCAN_FIRST: &str = include_str!("sort_scan_first.wgsl");
const SORT_SCAN: &str = include_str!("sort_scan.wgsl");
const SORT_RESOLVE: &str = include_str!("sort_resolve.wgsl");
const SORT_REORDER: &str = include_str!("sort_reorder.wgsl");

/// Debug label of a kernel's GPU objects.
pub(crate) fn kernel_label(kernel: SortKernel) -> &'static str {
    match kernel {
        SortKernel::ScanFirst => "splat_sort_scan_first",
        SortKernel::Scan => "splat_sort_scan",
        SortKernel::Resolve => "splat_sort_resolve",
        SortKernel::Reorder => "splat_sort_reorder",
    }
}

/// Compose the WGSL source of a kernel for a given workgroup size.
pub(crate) fn kernel_source(kernel: SortKernel, block_size: u32) -> String {
    let body = match kernel {
        SortKernel::ScanFirst => SORT_SCAN_FIRST,
        SortKernel::Scan => SORT_SCAN,
        SortKernel::Resolve => SORT_RESOLVE,
        SortKernel::Reorder => SORT_REORDER,
    };
    format!("{}\n{}", SORT_COMMON, body).replace("{{BLOCK_SIZE}}", &block_size.to_string())
}

/// Shaders of the sort kernels, composed for one workgroup size.
///
/// The shaders are added to the [`Assets<Shader>`] of the main world, from
/// where the renderer extracts them to compile the kernel pipelines of a
/// [`GpuRadixSort`]. Keep this alive as long as the sort is in use.
///
/// [`GpuRadixSort`]: crate::GpuRadixSort
#[derive(Debug, Clone, Resource)]
pub struct SortShaders {
    block_size: u32,
    scan_first: Handle<Shader>,
    scan: Handle<Shader>,
    resolve: Handle<Shader>,
    reorder: Handle<Shader>,
}

impl SortShaders {
    /// Compose the kernels for workgroups of `block_size` invocations, and
    /// add them to `shaders`.
    pub fn new(shaders: &mut Assets<Shader>, block_size: u32) -> Self {
        let mut add = |kernel| {
            shaders.add(Shader::from_wgsl(
                kernel_source(kernel, block_size),
                format!("{}.wgsl", kernel_label(kernel)),
            ))
        };
        Self {
            block_size,
            scan_first: add(SortKernel::ScanFirst),
            scan: add(SortKernel::Scan),
            resolve: add(SortKernel::Resolve),
            reorder: add(SortKernel::Reorder),
        }
    }

    /// Workgroup size the kernels were composed for.
    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Handle of the shader of a kernel.
    pub fn get(&self, kernel: SortKernel) -> &Handle<Shader> {
        match kernel {
            SortKernel::ScanFirst => &self.scan_first,
            SortKernel::Scan => &self.scan,
            SortKernel::Resolve => &self.resolve,
            SortKernel::Reorder => &self.reorder,
        }
    }
}

#[cfg(test)]
mod tests {
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    use super::*;

    const KERNELS: [SortKernel; 4] = [
        SortKernel::ScanFirst,
        SortKernel::Scan,
        SortKernel::Resolve,
        SortKernel::Reorder,
    ];

    #[test]
    fn block_size_substituted() {
        for kernel in KERNELS {
            let source = kernel_source(kernel, 64);
            assert!(!source.contains("{{BLOCK_SIZE}}"));
            assert!(source.contains("const BLOCK_SIZE: u32 = 64u;"));
            assert!(source.contains("fn main("));
        }
    }

    #[test]
    fn kernels_validate() {
        for block_size in [2, 4, 64, 128, 256] {
            for kernel in KERNELS {
                let source = kernel_source(kernel, block_size);
                let module = match naga::front::wgsl::parse_str(&source) {
                    Ok(module) => module,
                    Err(err) => panic!(
                        "{} (B={}) failed to parse:\n{}",
                        kernel_label(kernel),
                        block_size,
                        err.emit_to_string(&source)
                    ),
                };
                let mut validator = Validator::new(ValidationFlags::all(), Capabilities::empty());
                if let Err(err) = validator.validate(&module) {
                    panic!(
                        "{} (B={}) failed to validate:\n{}",
                        kernel_label(kernel),
                        block_size,
                        err.emit_to_string(&source)
                    );
                }
                assert_eq!(module.entry_points.len(), 1);
                assert_eq!(
                    module.entry_points[0].workgroup_size,
                    [block_size, 1, 1]
                );
            }
        }
    }

    #[test]
    fn shader_assets() {
        let mut assets = Assets::<Shader>::default();
        let shaders = SortShaders::new(&mut assets, 64);
        assert_eq!(shaders.block_size(), 64);
        assert_eq!(assets.len(), 4);
        for kernel in KERNELS {
            let shader = assets.get(shaders.get(kernel)).unwrap();
            assert_eq!(shader.path, format!("{}.wgsl", kernel_label(kernel)));
        }
        assert_ne!(
            shaders.get(SortKernel::Scan),
            shaders.get(SortKernel::Resolve)
        );
    }
}
