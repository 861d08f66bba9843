// lightval.rs — per-luxel lighting values and the bump basis

use myrad_common::mathlib::{vector_add, vector_scale, Vec3};

/// Number of bump basis directions. A bump-mapped luxel stores one flat
/// value plus one value per basis direction.
pub const NUM_BUMP_VECTS: usize = 3;
pub const MAX_LIGHT_CHANNELS: usize = NUM_BUMP_VECTS + 1;

// sqrt(2/3), 1/sqrt(2), 1/sqrt(3), 1/sqrt(6)
const OO_SQRT_2: f32 = 0.707_106_77;
const OO_SQRT_3: f32 = 0.577_350_26;
const OO_SQRT_6: f32 = 0.408_248_29;
const SQRT_2_OVER_3: f32 = 0.816_496_58;

/// Tangent-space bump basis directions (the standard three-basis set).
pub const BUMP_BASIS: [Vec3; NUM_BUMP_VECTS] = [
    [SQRT_2_OVER_3, 0.0, OO_SQRT_3],
    [-OO_SQRT_6, OO_SQRT_2, OO_SQRT_3],
    [-OO_SQRT_6, -OO_SQRT_2, OO_SQRT_3],
];

/// Isotropic down-weight applied when a flat sample feeds a bumped
/// channel set (and vice versa at seams).
pub const BUMP_SEAM_SCALE: f32 = OO_SQRT_3;

/// Fixed-capacity set of lighting channels with an explicit active
/// count: 1 for flat surfaces, 4 (flat + three basis directions) for
/// bump-mapped ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightChannels {
    pub vals: [Vec3; MAX_LIGHT_CHANNELS],
    pub count: usize,
}

impl Default for LightChannels {
    fn default() -> Self {
        Self::flat()
    }
}

impl LightChannels {
    pub fn flat() -> Self {
        Self {
            vals: [[0.0; 3]; MAX_LIGHT_CHANNELS],
            count: 1,
        }
    }

    pub fn bumped() -> Self {
        Self {
            vals: [[0.0; 3]; MAX_LIGHT_CHANNELS],
            count: MAX_LIGHT_CHANNELS,
        }
    }

    pub fn with_count(count: usize) -> Self {
        debug_assert!(count == 1 || count == MAX_LIGHT_CHANNELS);
        Self {
            vals: [[0.0; 3]; MAX_LIGHT_CHANNELS],
            count,
        }
    }

    pub fn is_bumped(&self) -> bool {
        self.count == MAX_LIGHT_CHANNELS
    }

    /// Add another channel set scaled by `scale`. Counts must agree;
    /// seam mismatches are resolved by the caller before accumulation.
    pub fn add_scaled(&mut self, other: &LightChannels, scale: f32) {
        debug_assert_eq!(self.count, other.count);
        for i in 0..self.count {
            self.vals[i] = vector_add(&self.vals[i], &vector_scale(&other.vals[i], scale));
        }
    }

    pub fn add_to_channel(&mut self, channel: usize, light: &Vec3) {
        debug_assert!(channel < self.count);
        self.vals[channel] = vector_add(&self.vals[channel], light);
    }

    pub fn scale(&mut self, scale: f32) {
        for i in 0..self.count {
            self.vals[i] = vector_scale(&self.vals[i], scale);
        }
    }

    /// The flat (style-agnostic) channel.
    pub fn flat_value(&self) -> Vec3 {
        self.vals[0]
    }

    /// Largest component across the active channels; used to decide
    /// whether a patch still carries enough energy to bounce.
    pub fn max_component(&self) -> f32 {
        let mut max = 0.0f32;
        for i in 0..self.count {
            for c in self.vals[i] {
                max = max.max(c);
            }
        }
        max
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use myrad_common::mathlib::{dot_product, vector_length};

    #[test]
    fn test_bump_basis_unit_length() {
        for b in &BUMP_BASIS {
            assert!((vector_length(b) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bump_basis_z_symmetry() {
        // All three share the same elevation
        for b in &BUMP_BASIS {
            assert!((b[2] - OO_SQRT_3).abs() < 1e-5);
        }
        // And are mutually orthogonal
        for i in 0..NUM_BUMP_VECTS {
            for j in i + 1..NUM_BUMP_VECTS {
                assert!(dot_product(&BUMP_BASIS[i], &BUMP_BASIS[j]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_add_scaled() {
        let mut a = LightChannels::flat();
        let mut b = LightChannels::flat();
        b.vals[0] = [1.0, 2.0, 3.0];
        a.add_scaled(&b, 0.5);
        assert_eq!(a.vals[0], [0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_max_component_bumped() {
        let mut c = LightChannels::bumped();
        c.vals[3] = [0.0, 7.0, 0.0];
        assert_eq!(c.max_component(), 7.0);
    }
}
