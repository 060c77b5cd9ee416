use bevy::math::Vec3;
use bytemuck::{Pod, Zeroable};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use crate::SortRecord;

/// A single point-sprite particle, as stored in GPU memory.
///
/// The layout matches the storage buffer read by the sort kernels and the
/// sprite vertex fetch: 32 bytes, no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Particle {
    /// World-space position.
    pub position: [f32; 3],
    /// Sprite scale factor.
    pub scale: f32,
    /// Linear RGBA color.
    pub color: [f32; 4],
}

impl Default for Particle {
    fn default() -> Self {
        Self::at(Vec3::ZERO)
    }
}

impl Particle {
    /// Create a white particle of unit scale at the given position.
    pub fn at(position: Vec3) -> Self {
        Self {
            position: position.to_array(),
            scale: 1.,
            color: [1.; 4],
        }
    }
}

impl SortRecord for Particle {
    const POSITION_OFFSET: usize = std::mem::offset_of!(Particle, position);

    #[inline]
    fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// Scatter `count` particles uniformly over the sphere of the given radius.
///
/// The distribution is deterministic for a given `seed`.
pub fn scatter_particles(count: usize, radius: f32, seed: u64) -> Vec<Particle> {
    let mut rng = Pcg32::seed_from_u64(seed);
    let mut particles = Vec::with_capacity(count);
    while particles.len() < count {
        // Rejection-sample the unit ball, then project onto the sphere.
        let v = Vec3::new(
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
        );
        let len_sq = v.length_squared();
        if len_sq > 1. || len_sq < 1e-6 {
            continue;
        }
        particles.push(Particle::at(v / len_sq.sqrt() * radius));
    }
    particles
}
