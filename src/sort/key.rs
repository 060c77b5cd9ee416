use bevy::math::Vec3;
use serde::{Deserialize, Serialize};

use super::SortRecord;
use crate::SortError;

/// Largest sort key, assigned to records at or beyond the far end of the
/// depth window.
pub const KEY_MAX: u16 = u16::MAX;

/// Window of projected depths mapped onto the full key range.
///
/// Depths below [`min()`] map to key `0`, depths above [`max()`] map to
/// [`KEY_MAX`]. A degenerate window (`min == max`) is valid and behaves as if
/// `max = min + f32::EPSILON`; it only degrades the sort to a stable
/// partition around `min`.
///
/// [`min()`]: DepthRange::min
/// [`max()`]: DepthRange::max
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthRange {
    min: f32,
    max: f32,
}

impl Default for DepthRange {
    fn default() -> Self {
        Self::PARTICLE_WINDOW
    }
}

impl DepthRange {
    /// Fixed `[-2, 2]` window used for the particle volume.
    pub const PARTICLE_WINDOW: DepthRange = DepthRange {
        min: -2.0,
        max: 2.0,
    };

    /// Create a new depth window.
    ///
    /// Fails if either bound is not finite, or if `max < min`.
    pub fn new(min: f32, max: f32) -> Result<Self, SortError> {
        if !min.is_finite() || !max.is_finite() || max < min {
            return Err(SortError::InvalidDepthRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Lower bound of the window.
    #[inline]
    pub fn min(&self) -> f32 {
        self.min
    }

    /// Upper bound of the window.
    #[inline]
    pub fn max(&self) -> f32 {
        self.max
    }

    /// Width of the window, never less than [`f32::EPSILON`].
    #[inline]
    pub fn span(&self) -> f32 {
        (self.max - self.min).max(f32::EPSILON)
    }

    /// Quantize a projected depth into a sort key.
    ///
    /// This is monotonic in `depth`, and saturates outside the window.
    pub fn quantize(&self, depth: f32) -> u16 {
        let t = ((depth - self.min) / self.span()).clamp(0., 1.);
        // NaN depths saturate to 0 through the float-to-int cast.
        (t * KEY_MAX as f32) as u16
    }
}

/// Derives the 16-bit sort key of a record.
///
/// The engine calls this exactly once per record and per sort, during the
/// first digit pass. Any implementation works as long as it is pure; the sort
/// orders records by ascending key, keeping the input order of equal keys.
pub trait KeyProjector<T>: Sync {
    /// Compute the key of `record`.
    fn sort_key(&self, record: &T) -> u16;
}

impl<T, F> KeyProjector<T> for F
where
    F: Fn(&T) -> u16 + Sync,
{
    fn sort_key(&self, record: &T) -> u16 {
        self(record)
    }
}

/// Projects positions onto a sort axis and quantizes the depth.
///
/// The key of a record at `position` is
/// `range.quantize(dot(position, axis))`. To draw back-to-front, use the
/// negated view direction as axis: farther records get smaller keys and sort
/// first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthProjector {
    axis: Vec3,
    range: DepthRange,
}

impl DepthProjector {
    /// Create a projector from an axis and a depth window.
    ///
    /// The axis is normalized; fails if it has zero length or is not finite.
    pub fn new(axis: Vec3, range: DepthRange) -> Result<Self, SortError> {
        let axis = axis
            .try_normalize()
            .ok_or(SortError::InvalidAxis(axis.to_array()))?;
        Ok(Self { axis, range })
    }

    /// Create a projector from an axis and the bounds of a depth window.
    pub fn from_window(axis: Vec3, z_min: f32, z_max: f32) -> Result<Self, SortError> {
        Self::new(axis, DepthRange::new(z_min, z_max)?)
    }

    /// Unit sort axis.
    #[inline]
    pub fn axis(&self) -> Vec3 {
        self.axis
    }

    /// Depth window.
    #[inline]
    pub fn range(&self) -> DepthRange {
        self.range
    }

    /// Signed depth of a position along the sort axis.
    #[inline]
    pub fn depth(&self, position: Vec3) -> f32 {
        position.dot(self.axis)
    }

    /// Key of a position.
    #[inline]
    pub fn key(&self, position: Vec3) -> u16 {
        self.range.quantize(self.depth(position))
    }
}

impl<T: SortRecord> KeyProjector<T> for DepthProjector {
    fn sort_key(&self, record: &T) -> u16 {
        self.key(record.position())
    }
}
