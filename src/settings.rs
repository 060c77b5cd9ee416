use bevy::{
    ecs::system::Resource, math::Vec3, render::extract_resource::ExtractResource,
};
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};

use crate::{DepthRange, LevelHierarchy, SettingsError, SortError};

/// Source of the depth window keys are quantized over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DepthWindow {
    /// A fixed window, independent of the camera.
    Fixed {
        /// Depth mapped to key `0`.
        min: f32,
        /// Depth mapped to the largest key.
        max: f32,
    },
    /// The range covered by the camera between its near and far planes.
    ClipPlanes,
}

impl Default for DepthWindow {
    fn default() -> Self {
        let range = DepthRange::PARTICLE_WINDOW;
        Self::Fixed {
            min: range.min(),
            max: range.max(),
        }
    }
}

impl DepthWindow {
    /// Resolve the window for a view.
    ///
    /// `axis` is the unit sort axis (the negated view direction), `eye` the
    /// camera position. With [`DepthWindow::ClipPlanes`], a point at distance
    /// `t` in front of the camera has depth `dot(eye, axis) - t`, so the
    /// window spans `[dot(eye, axis) - far, dot(eye, axis) - near]`.
    pub fn resolve(
        &self,
        eye: Vec3,
        axis: Vec3,
        near: f32,
        far: f32,
    ) -> Result<DepthRange, SortError> {
        match *self {
            DepthWindow::Fixed { min, max } => DepthRange::new(min, max),
            DepthWindow::ClipPlanes => {
                let c = eye.dot(axis);
                DepthRange::new(c - far, c - near)
            }
        }
    }
}

/// Configuration of the particle sort.
///
/// Loaded from RON with [`SortSettings::from_ron()`]; any missing field takes
/// its default value.
///
/// ```
/// # use bevy_splat::{DepthWindow, SortSettings};
/// let settings = SortSettings::from_ron(
///     "(particle_count: 4096, depth_window: ClipPlanes)",
/// )?;
/// assert_eq!(settings.particle_count, 4096);
/// assert_eq!(settings.block_size, 128);
/// assert_eq!(settings.depth_window, DepthWindow::ClipPlanes);
/// # Ok::<(), bevy_splat::SettingsError>(())
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Resource, ExtractResource, Serialize, Deserialize,
)]
#[serde(default)]
pub struct SortSettings {
    /// Number of particles allocated and sorted each frame. Fixed once the
    /// render app is initialized.
    pub particle_count: u32,
    /// Block size of the scan, also the workgroup size of the sort kernels.
    pub block_size: u32,
    /// Depth window the sort keys are quantized over.
    pub depth_window: DepthWindow,
    /// Sort the particles each frame. When disabled, the particle buffer keeps
    /// its previous order.
    pub enabled: bool,
    /// Seed of the initial particle distribution, see [`scatter_particles()`].
    ///
    /// [`scatter_particles()`]: crate::scatter_particles
    pub seed: u64,
}

impl Default for SortSettings {
    fn default() -> Self {
        Self {
            particle_count: 1 << 20,
            block_size: 128,
            depth_window: DepthWindow::default(),
            enabled: true,
            seed: 0x5eed_5917,
        }
    }
}

impl SortSettings {
    /// Parse and validate settings from a RON document.
    pub fn from_ron(text: &str) -> Result<Self, SettingsError> {
        let settings: SortSettings = ron::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize the settings into a pretty-printed RON document.
    pub fn to_ron(&self) -> ron::Result<String> {
        ron::ser::to_string_pretty(self, PrettyConfig::default())
    }

    /// Check the settings describe a valid sort.
    pub fn validate(&self) -> Result<(), SortError> {
        self.hierarchy()?;
        if let DepthWindow::Fixed { min, max } = self.depth_window {
            DepthRange::new(min, max)?;
        }
        Ok(())
    }

    /// Build the scan hierarchy of the configured sort.
    pub fn hierarchy(&self) -> Result<LevelHierarchy, SortError> {
        LevelHierarchy::new(self.particle_count, self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = SortSettings::default();
        assert_eq!(settings.particle_count, 1_048_576);
        assert_eq!(settings.block_size, 128);
        assert_eq!(
            settings.depth_window,
            DepthWindow::Fixed {
                min: -2.,
                max: 2.
            }
        );
        assert!(settings.enabled);
        assert_eq!(settings.seed, 0x5eed_5917);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn ron_round_trip() {
        let settings = SortSettings {
            particle_count: 1000,
            block_size: 64,
            depth_window: DepthWindow::ClipPlanes,
            enabled: false,
            seed: 42,
        };
        let text = settings.to_ron().unwrap();
        assert_eq!(SortSettings::from_ron(&text).unwrap(), settings);
    }

    #[test]
    fn ron_errors() {
        assert!(matches!(
            SortSettings::from_ron("(particle_count: \"many\")"),
            Err(SettingsError::Ron(_))
        ));
        assert!(matches!(
            SortSettings::from_ron("(block_size: 1)"),
            Err(SettingsError::Invalid(SortError::BlockSizeTooSmall(1)))
        ));
        assert!(matches!(
            SortSettings::from_ron("(particle_count: 0)"),
            Err(SettingsError::Invalid(SortError::ZeroElementCount))
        ));
        assert!(matches!(
            SortSettings::from_ron("(depth_window: Fixed(min: 1.0, max: -1.0))"),
            Err(SettingsError::Invalid(SortError::InvalidDepthRange { .. }))
        ));
    }

    #[test]
    fn clip_planes_window() {
        // Camera at z=10 looking down -Z, so the sort axis is +Z.
        let range = DepthWindow::ClipPlanes
            .resolve(Vec3::new(0., 0., 10.), Vec3::Z, 0.5, 20.)
            .unwrap();
        assert_eq!(range.min(), -10.);
        assert_eq!(range.max(), 9.5);

        let fixed = DepthWindow::default()
            .resolve(Vec3::new(0., 0., 10.), Vec3::Z, 0.5, 20.)
            .unwrap();
        assert_eq!(fixed, DepthRange::PARTICLE_WINDOW);

        assert!(DepthWindow::ClipPlanes
            .resolve(Vec3::ZERO, Vec3::Z, 0.1, f32::INFINITY)
            .is_err());
    }
}
