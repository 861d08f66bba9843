// winding.rs — ordered convex polygon math for surface chopping

use crate::mathlib::{
    add_point_to_bounds, clear_bounds, cross_product, dot_product, vector_add, vector_length,
    vector_ma, vector_normalize, vector_scale, vector_subtract, Plane, Vec3,
};

/// Splitting tolerance. Points closer to the plane than this are kept on
/// both sides so thin slivers do not accumulate.
pub const ON_EPSILON: f32 = 0.1;

const SIDE_FRONT: i32 = 0;
const SIDE_BACK: i32 = 1;
const SIDE_ON: i32 = 2;

/// An ordered polygon. Vertices wind counter-clockwise when viewed from
/// the front side of the surface plane.
#[derive(Debug, Clone, Default)]
pub struct Winding {
    pub points: Vec<Vec3>,
}

impl Winding {
    pub fn new(points: Vec<Vec3>) -> Self {
        Self { points }
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Sum of the triangle-fan cross products. Degenerate windings
    /// (fewer than 3 points) report zero.
    pub fn area(&self) -> f32 {
        if self.points.len() < 3 {
            return 0.0;
        }
        let mut total = 0.0;
        for i in 2..self.points.len() {
            let d1 = vector_subtract(&self.points[i - 1], &self.points[0]);
            let d2 = vector_subtract(&self.points[i], &self.points[0]);
            let cross = cross_product(&d1, &d2);
            total += 0.5 * vector_length(&cross);
        }
        total
    }

    pub fn center(&self) -> Vec3 {
        let mut center = [0.0, 0.0, 0.0];
        for p in &self.points {
            center = vector_add(&center, p);
        }
        if !self.points.is_empty() {
            center = vector_scale(&center, 1.0 / self.points.len() as f32);
        }
        center
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        let mut mins = [0.0, 0.0, 0.0];
        let mut maxs = [0.0, 0.0, 0.0];
        clear_bounds(&mut mins, &mut maxs);
        for p in &self.points {
            add_point_to_bounds(p, &mut mins, &mut maxs);
        }
        (mins, maxs)
    }

    /// Plane the winding lies in, derived from the first three
    /// vertices. Counter-clockwise windings face the +normal side.
    pub fn plane(&self) -> Plane {
        let d1 = vector_subtract(&self.points[1], &self.points[0]);
        let d2 = vector_subtract(&self.points[2], &self.points[0]);
        let mut normal = cross_product(&d1, &d2);
        vector_normalize(&mut normal);
        let dist = dot_product(&self.points[0], &normal);
        Plane::from_normal_dist(normal, dist)
    }

    /// Index and length of the longest edge. Edge i runs from point i to
    /// point (i+1) % n.
    pub fn longest_edge(&self) -> (usize, f32) {
        let n = self.points.len();
        let mut best = 0;
        let mut best_len = 0.0;
        for i in 0..n {
            let d = vector_subtract(&self.points[(i + 1) % n], &self.points[i]);
            let len = vector_length(&d);
            if len > best_len {
                best_len = len;
                best = i;
            }
        }
        (best, best_len)
    }

    /// Split a triangle through the midpoint of its longest edge and the
    /// opposite vertex. Both halves keep the original vertex order, so
    /// their areas sum exactly to the parent's.
    pub fn split_triangle_longest_edge(&self) -> (Winding, Winding) {
        debug_assert_eq!(self.points.len(), 3);
        let (edge, _) = self.longest_edge();
        let a = edge;
        let b = (edge + 1) % 3;
        let c = (edge + 2) % 3;
        let mid = vector_scale(&vector_add(&self.points[a], &self.points[b]), 0.5);
        let front = Winding::new(vec![self.points[a], mid, self.points[c]]);
        let back = Winding::new(vec![mid, self.points[b], self.points[c]]);
        (front, back)
    }

    /// Split a quad into two triangles along its shorter diagonal.
    pub fn split_quad(&self) -> (Winding, Winding) {
        debug_assert_eq!(self.points.len(), 4);
        let d02 = vector_length(&vector_subtract(&self.points[2], &self.points[0]));
        let d13 = vector_length(&vector_subtract(&self.points[3], &self.points[1]));
        if d02 <= d13 {
            (
                Winding::new(vec![self.points[0], self.points[1], self.points[2]]),
                Winding::new(vec![self.points[0], self.points[2], self.points[3]]),
            )
        } else {
            (
                Winding::new(vec![self.points[0], self.points[1], self.points[3]]),
                Winding::new(vec![self.points[1], self.points[2], self.points[3]]),
            )
        }
    }

    /// Clip the winding by `split`, returning the pieces in front of and
    /// behind the plane. Either side may be None if the winding does not
    /// cross the plane. Points within ON_EPSILON are shared by both sides.
    pub fn clip(&self, split: &Plane) -> (Option<Winding>, Option<Winding>) {
        let n = self.points.len();
        let mut dists = Vec::with_capacity(n + 1);
        let mut sides = Vec::with_capacity(n + 1);
        let mut counts = [0i32; 3];

        for p in &self.points {
            let dot = split.distance_to(p);
            dists.push(dot);
            let side = if dot > ON_EPSILON {
                SIDE_FRONT
            } else if dot < -ON_EPSILON {
                SIDE_BACK
            } else {
                SIDE_ON
            };
            counts[side as usize] += 1;
            sides.push(side);
        }
        sides.push(sides[0]);
        dists.push(dists[0]);

        if counts[SIDE_FRONT as usize] == 0 {
            return (None, Some(self.clone()));
        }
        if counts[SIDE_BACK as usize] == 0 {
            return (Some(self.clone()), None);
        }

        let mut front = Vec::with_capacity(n + 4);
        let mut back = Vec::with_capacity(n + 4);

        for i in 0..n {
            let p1 = &self.points[i];
            if sides[i] == SIDE_ON {
                front.push(*p1);
                back.push(*p1);
                continue;
            }
            if sides[i] == SIDE_FRONT {
                front.push(*p1);
            } else {
                back.push(*p1);
            }
            if sides[i + 1] == SIDE_ON || sides[i + 1] == sides[i] {
                continue;
            }

            // Generate the crossing point
            let p2 = &self.points[(i + 1) % n];
            let dot = dists[i] / (dists[i] - dists[i + 1]);
            let mut mid = [0.0f32; 3];
            for j in 0..3 {
                // Avoid roundoff on axial planes
                if split.normal[j] == 1.0 {
                    mid[j] = split.dist;
                } else if split.normal[j] == -1.0 {
                    mid[j] = -split.dist;
                } else {
                    mid[j] = p1[j] + dot * (p2[j] - p1[j]);
                }
            }
            front.push(mid);
            back.push(mid);
        }

        (Some(Winding::new(front)), Some(Winding::new(back)))
    }

    /// Flip the facing by reversing vertex order.
    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    /// True if `p` lies inside the winding when both are projected onto
    /// the plane with the given normal. Edge tolerance in world units.
    pub fn contains_point(&self, p: &Vec3, normal: &Vec3, epsilon: f32) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        for i in 0..n {
            let edge = vector_subtract(&self.points[(i + 1) % n], &self.points[i]);
            let to_p = vector_subtract(p, &self.points[i]);
            let cross = cross_product(&edge, &to_p);
            if dot_product(&cross, normal) < -epsilon {
                return false;
            }
        }
        true
    }

    /// Translate every vertex by `offset`.
    pub fn translate(&mut self, offset: &Vec3) {
        for p in &mut self.points {
            *p = vector_add(p, offset);
        }
    }

    /// Shrink the winding toward its center by `amount` world units along
    /// each vertex direction. Used to pull sample points inside the face.
    pub fn shrink_toward_center(&self, amount: f32) -> Winding {
        let center = self.center();
        let points = self
            .points
            .iter()
            .map(|p| {
                let mut dir = vector_subtract(&center, p);
                let len = vector_normalize(&mut dir);
                if len <= amount {
                    center
                } else {
                    vector_ma(p, amount, &dir)
                }
            })
            .collect();
        Winding::new(points)
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_quad(size: f32) -> Winding {
        Winding::new(vec![
            [0.0, 0.0, 0.0],
            [size, 0.0, 0.0],
            [size, size, 0.0],
            [0.0, size, 0.0],
        ])
    }

    #[test]
    fn test_quad_area() {
        let w = unit_quad(10.0);
        assert!((w.area() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_area_is_zero() {
        let w = Winding::new(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        assert_eq!(w.area(), 0.0);
    }

    #[test]
    fn test_center() {
        let w = unit_quad(10.0);
        assert_eq!(w.center(), [5.0, 5.0, 0.0]);
    }

    #[test]
    fn test_plane_faces_up() {
        let w = unit_quad(1.0);
        let p = w.plane();
        assert!((p.normal[2] - 1.0).abs() < 1e-5);
        assert!(p.dist.abs() < 1e-5);
    }

    #[test]
    fn test_triangle_split_preserves_area() {
        let tri = Winding::new(vec![[0.0, 0.0, 0.0], [8.0, 0.0, 0.0], [0.0, 6.0, 0.0]]);
        let parent_area = tri.area();
        let (a, b) = tri.split_triangle_longest_edge();
        assert!((a.area() + b.area() - parent_area).abs() < parent_area * 1e-5);
    }

    #[test]
    fn test_quad_split_preserves_area() {
        let w = unit_quad(16.0);
        let (a, b) = w.split_quad();
        assert!((a.area() + b.area() - w.area()).abs() < 1e-2);
    }

    #[test]
    fn test_clip_through_middle() {
        let w = unit_quad(10.0);
        let split = Plane::from_normal_dist([1.0, 0.0, 0.0], 5.0);
        let (front, back) = w.clip(&split);
        let front = front.expect("front piece");
        let back = back.expect("back piece");
        assert!((front.area() - 50.0).abs() < 1e-2);
        assert!((back.area() - 50.0).abs() < 1e-2);
    }

    #[test]
    fn test_clip_entirely_behind() {
        let w = unit_quad(10.0);
        let split = Plane::from_normal_dist([1.0, 0.0, 0.0], 50.0);
        let (front, back) = w.clip(&split);
        assert!(front.is_none());
        assert!(back.is_some());
    }
}
