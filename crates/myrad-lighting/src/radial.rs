// radial.rs — per-face luxel accumulation with radial weighting
//
// Samples land at irregular positions; the radial grid splats them into
// the face's regular luxel grid and normalizes by accumulated weight.
// One grid lives for one face for one pass, then is dropped.

use myrad_common::mathlib::Vec3;

use crate::lightval::{LightChannels, BUMP_SEAM_SCALE, MAX_LIGHT_CHANNELS};

/// Cells accumulating less weight than this are invalid; sampling them
/// yields the debug sentinel instead of a divide by almost-zero.
pub const WEIGHT_EPS: f32 = 0.00001;

/// Bounce splat kernel radius squared, in luxel units.
pub const RADIAL_DIST2: f32 = 2.0;

/// Hot pink. Deliberately garish so bad luxels are visible in-game
/// instead of silently black.
pub const INVALID_SAMPLE_COLOR: Vec3 = [255.0, 0.0, 255.0];

pub struct Radial {
    pub width: usize,
    pub height: usize,
    light: Vec<LightChannels>,
    weight: Vec<f32>,
    bumped: bool,
}

impl Radial {
    pub fn new(width: usize, height: usize, bumped: bool) -> Radial {
        let n = width * height;
        let proto = if bumped {
            LightChannels::bumped()
        } else {
            LightChannels::flat()
        };
        Radial {
            width,
            height,
            light: vec![proto; n],
            weight: vec![0.0; n],
            bumped,
        }
    }

    fn channel_count(&self) -> usize {
        if self.bumped {
            MAX_LIGHT_CHANNELS
        } else {
            1
        }
    }

    /// Splat one direct-lighting sample. `mins`/`maxs` bound the
    /// sample's footprint and `pos` its center, all in luxel
    /// coordinates. Weight per cell is footprint overlap over distance,
    /// with the distance floored at 0.1 so on-center samples dominate
    /// without dividing by zero.
    pub fn add_direct(
        &mut self,
        mins: [f32; 2],
        maxs: [f32; 2],
        pos: [f32; 2],
        light: &LightChannels,
    ) {
        let s0 = (mins[0].floor().max(0.0)) as usize;
        let t0 = (mins[1].floor().max(0.0)) as usize;
        let s1 = (maxs[0].ceil().min(self.width as f32)) as usize;
        let t1 = (maxs[1].ceil().min(self.height as f32)) as usize;

        for t in t0..t1 {
            for s in s0..s1 {
                // Overlap of the footprint with this cell
                let cell_min_s = s as f32;
                let cell_min_t = t as f32;
                let os = (maxs[0].min(cell_min_s + 1.0) - mins[0].max(cell_min_s)).max(0.0);
                let ot = (maxs[1].min(cell_min_t + 1.0) - mins[1].max(cell_min_t)).max(0.0);
                let overlap = os * ot;
                if overlap <= 0.0 {
                    continue;
                }
                let ds = pos[0] - (cell_min_s + 0.5);
                let dt = pos[1] - (cell_min_t + 0.5);
                let dist = (ds * ds + dt * dt).sqrt().max(0.1);
                let w = overlap / dist;

                self.accumulate(s, t, light, w);
            }
        }
    }

    /// Splat one bounced-lighting contribution at `pos` (luxel
    /// coordinates). Bounce patches carry no exact footprint, so a
    /// radial falloff kernel stands in for overlap area.
    pub fn add_bounced(&mut self, pos: [f32; 2], light: &LightChannels) {
        let r = RADIAL_DIST2.sqrt();
        let s0 = ((pos[0] - r).floor().max(0.0)) as usize;
        let t0 = ((pos[1] - r).floor().max(0.0)) as usize;
        let s1 = ((pos[0] + r).ceil().min(self.width as f32)) as usize;
        let t1 = ((pos[1] + r).ceil().min(self.height as f32)) as usize;

        for t in t0..t1 {
            for s in s0..s1 {
                let ds = pos[0] - (s as f32 + 0.5);
                let dt = pos[1] - (t as f32 + 0.5);
                let w = RADIAL_DIST2 - (ds * ds + dt * dt);
                if w > 0.0 {
                    self.accumulate(s, t, light, w);
                }
            }
        }
    }

    /// Channel-count-aware weighted accumulate. A flat contribution
    /// feeding a bumped grid spreads isotropically across the basis
    /// channels, down-weighted so total energy matches.
    fn accumulate(&mut self, s: usize, t: usize, light: &LightChannels, w: f32) {
        let idx = t * self.width + s;
        let cell = &mut self.light[idx];
        if light.count == cell.count {
            cell.add_scaled(light, w);
        } else if cell.count == MAX_LIGHT_CHANNELS {
            // Flat sample into bumped cell
            let flat = light.flat_value();
            for i in 0..MAX_LIGHT_CHANNELS {
                let scale = if i == 0 { w } else { w * BUMP_SEAM_SCALE };
                cell.vals[i] = myrad_common::mathlib::vector_ma(&cell.vals[i], scale, &flat);
            }
        } else {
            // Bumped sample into flat cell: only the flat channel lands
            cell.vals[0] =
                myrad_common::mathlib::vector_ma(&cell.vals[0], w, &light.vals[0]);
        }
        self.weight[idx] += w;
    }

    /// Normalized value at a cell, or None when the cell accumulated
    /// no meaningful weight. Pure: re-sampling without re-accumulating
    /// returns the identical value.
    pub fn sample(&self, s: usize, t: usize) -> Option<LightChannels> {
        let idx = t * self.width + s;
        let w = self.weight[idx];
        if w < WEIGHT_EPS {
            return None;
        }
        let mut out = self.light[idx];
        out.scale(1.0 / w);
        Some(out)
    }

    /// Sample with the invalid-cell sentinel applied: defective luxels
    /// come back hot pink so they are visible downstream.
    pub fn sample_or_sentinel(&self, s: usize, t: usize) -> LightChannels {
        match self.sample(s, t) {
            Some(v) => v,
            None => {
                let mut out = LightChannels::with_count(self.channel_count());
                for i in 0..out.count {
                    out.vals[i] = INVALID_SAMPLE_COLOR;
                }
                out
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_sample_normalizes() {
        let mut r = Radial::new(4, 4, false);
        let mut light = LightChannels::flat();
        light.vals[0] = [100.0, 50.0, 25.0];
        // Footprint covering exactly cell (1,1), sample at its center
        r.add_direct([1.0, 1.0], [2.0, 2.0], [1.5, 1.5], &light);

        let v = r.sample(1, 1).unwrap();
        // sum/weight returns the original value regardless of weight
        for i in 0..3 {
            assert!((v.vals[0][i] - light.vals[0][i]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_sample_deterministic() {
        let mut r = Radial::new(4, 4, false);
        let mut light = LightChannels::flat();
        light.vals[0] = [10.0, 10.0, 10.0];
        r.add_direct([0.0, 0.0], [2.0, 2.0], [1.0, 1.0], &light);
        let a = r.sample(0, 0).unwrap();
        let b = r.sample(0, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_cell_invalid() {
        let r = Radial::new(4, 4, false);
        assert!(r.sample(2, 2).is_none());
        let v = r.sample_or_sentinel(2, 2);
        assert_eq!(v.vals[0], INVALID_SAMPLE_COLOR);
    }

    #[test]
    fn test_bounced_kernel_reaches_neighbors() {
        let mut r = Radial::new(5, 5, false);
        let mut light = LightChannels::flat();
        light.vals[0] = [64.0, 64.0, 64.0];
        r.add_bounced([2.5, 2.5], &light);

        // Center cell strongest, direct neighbors still lit
        let center = r.sample(2, 2).unwrap().vals[0][0];
        assert!(center > 0.0);
        assert!(r.sample(3, 2).is_some());
        // Far corner outside kernel radius
        assert!(r.sample(0, 0).is_none());
    }

    #[test]
    fn test_flat_into_bumped_downweights() {
        let mut r = Radial::new(2, 2, true);
        let mut flat = LightChannels::flat();
        flat.vals[0] = [90.0, 90.0, 90.0];
        r.add_direct([0.0, 0.0], [1.0, 1.0], [0.5, 0.5], &flat);

        let v = r.sample(0, 0).unwrap();
        assert_eq!(v.count, MAX_LIGHT_CHANNELS);
        // Flat channel carries the full value; basis channels are
        // attenuated by 1/sqrt(3)
        assert!((v.vals[0][0] - 90.0).abs() < 1e-2);
        assert!((v.vals[1][0] - 90.0 * BUMP_SEAM_SCALE).abs() < 1e-2);
    }
}
