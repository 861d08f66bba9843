// sampler.rs — low-discrepancy hemisphere direction sampling

use myrad_common::mathlib::{build_basis, vector_add, vector_scale, Vec3};
use rand::Rng;

/// Base hemisphere ray count for indirect gathering; fast mode divides
/// this by four and the sky sample scale multiplies it.
pub const BASE_HEMISPHERE_SAMPLES: usize = 162;

/// Radical-inverse in the given base; the classic Halton construction.
fn radical_inverse(mut i: u32, base: u32) -> f32 {
    let mut result = 0.0f64;
    let mut f = 1.0f64 / base as f64;
    while i > 0 {
        result += f * (i % base) as f64;
        i /= base;
        f /= base as f64;
    }
    result as f32
}

/// Stateful Halton-sequence hemisphere sampler. Successive calls cover
/// the hemisphere progressively without clumping, so truncating the
/// sequence (fast mode) still gives even coverage.
#[derive(Debug, Clone)]
pub struct DirectionalSampler {
    index: u32,
}

impl Default for DirectionalSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionalSampler {
    pub fn new() -> DirectionalSampler {
        // Index 0 maps to the degenerate (0,0) sample; skip it
        DirectionalSampler { index: 1 }
    }

    /// Next direction on the unit hemisphere around +Z, uniform by
    /// solid angle.
    pub fn next_direction(&mut self) -> Vec3 {
        let u1 = radical_inverse(self.index, 2);
        let u2 = radical_inverse(self.index, 3);
        self.index = self.index.wrapping_add(1);

        let z = u1; // cos(theta), uniform in [0,1)
        let r = (1.0 - z * z).max(0.0).sqrt();
        let phi = 2.0 * std::f32::consts::PI * u2;
        [r * phi.cos(), r * phi.sin(), z]
    }

    /// Next direction transformed into the hemisphere above `normal`.
    pub fn next_direction_around(&mut self, normal: &Vec3) -> Vec3 {
        let local = self.next_direction();
        let (tangent, binormal) = build_basis(normal);
        let mut out = vector_scale(&tangent, local[0]);
        out = vector_add(&out, &vector_scale(&binormal, local[1]));
        vector_add(&out, &vector_scale(normal, local[2]))
    }
}

/// Jitter a sun direction within a disk of `spread` radians for soft
/// shadows. Uses thread-local randomness; sun sampling is the one spot
/// where determinism across runs is not required.
pub fn jitter_direction<R: Rng>(rng: &mut R, dir: &Vec3, spread: f32) -> Vec3 {
    if spread <= 0.0 {
        return *dir;
    }
    let (tangent, binormal) = build_basis(dir);
    let r = spread * rng.gen::<f32>().sqrt();
    let phi = 2.0 * std::f32::consts::PI * rng.gen::<f32>();
    let mut out = *dir;
    out = vector_add(&out, &vector_scale(&tangent, r * phi.cos()));
    out = vector_add(&out, &vector_scale(&binormal, r * phi.sin()));
    myrad_common::mathlib::vector_normalize(&mut out);
    out
}

/// Hemisphere ray count for the current settings.
pub fn hemisphere_sample_count(fast: bool, sky_sample_scale: f32) -> usize {
    let base = if fast {
        BASE_HEMISPHERE_SAMPLES / 4
    } else {
        BASE_HEMISPHERE_SAMPLES
    };
    ((base as f32 * sky_sample_scale) as usize).max(8)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use myrad_common::mathlib::{dot_product, vector_length};

    #[test]
    fn test_radical_inverse_base2() {
        assert!((radical_inverse(1, 2) - 0.5).abs() < 1e-6);
        assert!((radical_inverse(2, 2) - 0.25).abs() < 1e-6);
        assert!((radical_inverse(3, 2) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_directions_unit_length_upper_hemisphere() {
        let mut sampler = DirectionalSampler::new();
        for _ in 0..200 {
            let d = sampler.next_direction();
            assert!((vector_length(&d) - 1.0).abs() < 1e-4);
            assert!(d[2] >= 0.0);
        }
    }

    #[test]
    fn test_directions_around_normal() {
        let normal = [1.0, 0.0, 0.0];
        let mut sampler = DirectionalSampler::new();
        for _ in 0..100 {
            let d = sampler.next_direction_around(&normal);
            assert!(dot_product(&d, &normal) >= -1e-4);
        }
    }

    #[test]
    fn test_sequence_covers_azimuth() {
        // Crude uniformity check: all four azimuth quadrants get hit
        let mut sampler = DirectionalSampler::new();
        let mut quadrants = [false; 4];
        for _ in 0..64 {
            let d = sampler.next_direction();
            let q = match (d[0] >= 0.0, d[1] >= 0.0) {
                (true, true) => 0,
                (false, true) => 1,
                (false, false) => 2,
                (true, false) => 3,
            };
            quadrants[q] = true;
        }
        assert!(quadrants.iter().all(|&q| q));
    }

    #[test]
    fn test_sample_counts() {
        assert_eq!(hemisphere_sample_count(false, 1.0), 162);
        assert_eq!(hemisphere_sample_count(true, 1.0), 40);
        assert_eq!(hemisphere_sample_count(false, 2.0), 324);
    }
}
