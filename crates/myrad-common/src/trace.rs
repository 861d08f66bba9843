// trace.rs — BSP occlusion queries for light rays
//
// Point rays only: lighting never sweeps a box, so the node walk skips
// the extent handling a collision hull needs. A ray is blocked where it
// first enters an opaque leaf; the crossing plane is reported so callers
// can offset repair points off the surface.

use crate::bspfile::{BspData, DVIS_PVS, MASK_LIGHT_OPAQUE, SURF_SKY};
use crate::mathlib::{
    cross_product, dot_product, vector_lerp, vector_ma, vector_subtract, Plane, Vec3,
};

/// Clip positions this far off planes to keep rays from re-entering the
/// surface they start on.
pub const DIST_EPSILON: f32 = 0.03125;

/// Result of a light ray query.
#[derive(Debug, Clone, Default)]
pub struct LightTrace {
    /// 1.0 when the ray reached its destination
    pub fraction: f32,
    pub endpos: Vec3,
    /// Plane of the node crossing where the ray entered solid
    pub plane: Plane,
    /// Contents of the blocking leaf (0 when unblocked)
    pub contents: i32,
    /// Ray origin was already inside solid
    pub startsolid: bool,
    /// True if the blocking surface carries SURF_SKY
    pub hit_sky: bool,
    /// Face struck, when attribution succeeds
    pub face: Option<usize>,
    /// Static prop occluder struck, if any
    pub prop_id: Option<i32>,
}

impl LightTrace {
    pub fn blocked(&self) -> bool {
        self.fraction < 1.0
    }
}

/// A static prop's collision triangles, registered as extra occluders.
/// `prop_id` lets a prop's own lighting rays skip self-shadowing.
#[derive(Debug, Clone)]
pub struct PropOccluder {
    pub prop_id: i32,
    pub tris: Vec<[Vec3; 3]>,
}

/// Borrowing view over the map used for all occlusion and visibility
/// queries. Stateless per query, so rayon workers share one instance.
pub struct TraceContext<'a> {
    bsp: &'a BspData,
    occluders: Vec<PropOccluder>,
}

impl<'a> TraceContext<'a> {
    pub fn new(bsp: &'a BspData) -> Self {
        Self {
            bsp,
            occluders: Vec::new(),
        }
    }

    pub fn add_occluder(&mut self, occluder: PropOccluder) {
        self.occluders.push(occluder);
    }

    // ========================================================
    // Point queries
    // ========================================================

    /// Leaf index containing `p`, walking from the world model headnode.
    pub fn point_leafnum(&self, p: &Vec3) -> usize {
        let mut num = self.headnode();
        while num >= 0 {
            let node = &self.bsp.nodes[num as usize];
            let plane = &self.bsp.planes[node.planenum as usize];
            let d = if (plane.ptype as usize) < 3 {
                p[plane.ptype as usize] - plane.dist
            } else {
                dot_product(&plane.normal, p) - plane.dist
            };
            num = if d < 0.0 {
                node.children[1]
            } else {
                node.children[0]
            };
        }
        (-1 - num) as usize
    }

    pub fn point_cluster(&self, p: &Vec3) -> i32 {
        self.bsp.leafs[self.point_leafnum(p)].cluster as i32
    }

    pub fn point_in_solid(&self, p: &Vec3) -> bool {
        self.bsp.leafs[self.point_leafnum(p)].contents & MASK_LIGHT_OPAQUE != 0
    }

    fn headnode(&self) -> i32 {
        if self.bsp.models.is_empty() {
            0
        } else {
            self.bsp.models[0].headnode
        }
    }

    // ========================================================
    // Ray occlusion
    // ========================================================

    /// Trace from `start` to `end`, stopping at the first opaque leaf or
    /// prop occluder. Attribution of the struck face is attempted when
    /// the world blocks the ray.
    pub fn test_line(&self, start: &Vec3, end: &Vec3) -> LightTrace {
        self.test_line_excluding(start, end, -1)
    }

    pub fn test_line_excluding(&self, start: &Vec3, end: &Vec3, skip_prop: i32) -> LightTrace {
        let mut trace = LightTrace {
            fraction: 1.0,
            endpos: *end,
            ..Default::default()
        };
        if !self.bsp.nodes.is_empty() {
            self.trace_r(self.headnode(), 0.0, 1.0, start, end, &mut trace);
        }

        // Clip against prop occluders; keep whichever hit is nearer
        for occ in &self.occluders {
            if occ.prop_id == skip_prop {
                continue;
            }
            for tri in &occ.tris {
                if let Some(frac) = ray_triangle(start, end, tri) {
                    if frac < trace.fraction {
                        trace.fraction = frac;
                        trace.endpos = vector_lerp(start, end, frac);
                        trace.contents = MASK_LIGHT_OPAQUE;
                        trace.hit_sky = false;
                        trace.face = None;
                        trace.prop_id = Some(occ.prop_id);
                        let e1 = vector_subtract(&tri[1], &tri[0]);
                        let e2 = vector_subtract(&tri[2], &tri[0]);
                        let mut normal = cross_product(&e1, &e2);
                        crate::mathlib::vector_normalize(&mut normal);
                        let dist = dot_product(&normal, &tri[0]);
                        trace.plane = Plane::from_normal_dist(normal, dist);
                    }
                }
            }
        }

        if trace.blocked() && trace.prop_id.is_none() {
            trace.face = self.find_face_at(&trace.endpos);
            if let Some(face) = trace.face {
                let ti = self.bsp.faces[face].texinfo as usize;
                trace.hit_sky = self.bsp.texinfo[ti].flags & SURF_SKY != 0;
            }
        }
        trace
    }

    /// Recursive node walk. Returns true once the trace has terminated.
    fn trace_r(
        &self,
        num: i32,
        p1f: f32,
        p2f: f32,
        p1: &Vec3,
        p2: &Vec3,
        trace: &mut LightTrace,
    ) -> bool {
        if num < 0 {
            let leaf = &self.bsp.leafs[(-1 - num) as usize];
            if leaf.contents & MASK_LIGHT_OPAQUE != 0 {
                if p1f == 0.0 {
                    trace.startsolid = true;
                }
                trace.fraction = p1f;
                trace.endpos = *p1;
                trace.contents = leaf.contents;
                return true;
            }
            return false;
        }

        let node = &self.bsp.nodes[num as usize];
        let plane = self.bsp.planes[node.planenum as usize];

        let (t1, t2) = if (plane.ptype as usize) < 3 {
            let pt = plane.ptype as usize;
            (p1[pt] - plane.dist, p2[pt] - plane.dist)
        } else {
            (
                dot_product(&plane.normal, p1) - plane.dist,
                dot_product(&plane.normal, p2) - plane.dist,
            )
        };

        if t1 >= 0.0 && t2 >= 0.0 {
            return self.trace_r(node.children[0], p1f, p2f, p1, p2, trace);
        }
        if t1 < 0.0 && t2 < 0.0 {
            return self.trace_r(node.children[1], p1f, p2f, p1, p2, trace);
        }

        // The segment straddles the plane: split it with a small overlap
        // so the mid point never lands exactly on the plane.
        let (side, frac) = if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            (1usize, ((t1 + DIST_EPSILON) * idist).clamp(0.0, 1.0))
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            (0usize, ((t1 - DIST_EPSILON) * idist).clamp(0.0, 1.0))
        } else {
            (0usize, 1.0)
        };

        let midf = p1f + (p2f - p1f) * frac;
        let mid = vector_lerp(p1, p2, frac);

        if self.trace_r(node.children[side], p1f, midf, p1, &mid, trace) {
            // Record the crossing plane at the first solid entry
            if trace.plane.normal == [0.0, 0.0, 0.0] {
                trace.plane = plane;
            }
            return true;
        }
        let hit = self.trace_r(node.children[side ^ 1], midf, p2f, &mid, p2, trace);
        if hit && trace.plane.normal == [0.0, 0.0, 0.0] {
            trace.plane = plane;
        }
        hit
    }

    // ========================================================
    // Face attribution
    // ========================================================

    /// Face whose plane contains `point` and whose winding covers it.
    /// Walks the node tree testing faces stored on nodes whose plane
    /// passes within DIST_EPSILON * 2 of the point.
    pub fn find_face_at(&self, point: &Vec3) -> Option<usize> {
        let mut num = self.headnode();
        while num >= 0 {
            let node = &self.bsp.nodes[num as usize];
            let plane = &self.bsp.planes[node.planenum as usize];
            let d = if (plane.ptype as usize) < 3 {
                point[plane.ptype as usize] - plane.dist
            } else {
                dot_product(&plane.normal, point) - plane.dist
            };

            if d.abs() <= DIST_EPSILON * 4.0 {
                // Point lies on this node's plane; check its faces
                for i in 0..node.numfaces as usize {
                    let face_idx = node.firstface as usize + i;
                    let face = &self.bsp.faces[face_idx];
                    let fplane = self.bsp.face_plane(face);
                    let winding = self.bsp.face_winding(face);
                    if winding.contains_point(point, &fplane.normal, 0.1) {
                        return Some(face_idx);
                    }
                }
            }
            num = if d < 0.0 {
                node.children[1]
            } else {
                node.children[0]
            };
        }
        None
    }

    // ========================================================
    // Visibility
    // ========================================================

    /// Decompressed PVS row for a cluster. Returns an all-visible row
    /// when the map shipped without visibility data.
    pub fn cluster_pvs(&self, cluster: i32) -> Vec<u8> {
        let row_bytes = (self.bsp.num_clusters + 7) / 8;
        if cluster < 0 {
            return vec![0u8; row_bytes.max(1)];
        }
        match self.bsp.cluster_vis_offset(cluster as usize, DVIS_PVS) {
            Some(offset) => self.decompress_vis(offset),
            None => vec![0xffu8; row_bytes.max(1)],
        }
    }

    /// Run-length decode a compressed visibility row: literal bytes,
    /// with 0 followed by a zero-run count.
    fn decompress_vis(&self, in_offset: usize) -> Vec<u8> {
        let row = (self.bsp.num_clusters + 7) / 8;
        let data = &self.bsp.visdata;
        let mut out = Vec::with_capacity(row);
        let mut i = in_offset;

        while out.len() < row && i < data.len() {
            if data[i] != 0 {
                out.push(data[i]);
                i += 1;
                continue;
            }
            if i + 1 >= data.len() {
                break;
            }
            let count = data[i + 1] as usize;
            i += 2;
            for _ in 0..count {
                if out.len() >= row {
                    break;
                }
                out.push(0);
            }
        }
        out.resize(row, 0);
        out
    }
}

/// Bit test helper shared by PVS domains.
#[inline]
pub fn cluster_visible(pvs_row: &[u8], cluster: i32) -> bool {
    if cluster < 0 {
        return false;
    }
    let byte = (cluster >> 3) as usize;
    byte < pvs_row.len() && pvs_row[byte] & (1 << (cluster & 7)) != 0
}

/// Moller-Trumbore intersection; returns the hit fraction along
/// start->end, ignoring hits behind the start or past the end.
fn ray_triangle(start: &Vec3, end: &Vec3, tri: &[Vec3; 3]) -> Option<f32> {
    const EPS: f32 = 1e-7;
    let dir = vector_subtract(end, start);
    let e1 = vector_subtract(&tri[1], &tri[0]);
    let e2 = vector_subtract(&tri[2], &tri[0]);
    let pvec = cross_product(&dir, &e2);
    let det = dot_product(&e1, &pvec);
    if det.abs() < EPS {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = vector_subtract(start, &tri[0]);
    let u = dot_product(&tvec, &pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = cross_product(&tvec, &e1);
    let v = dot_product(&dir, &qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = dot_product(&e2, &qvec) * inv_det;
    if !(0.0..1.0).contains(&t) {
        return None;
    }
    Some(t)
}

/// Offset a point off a surface along its normal before tracing, so the
/// ray does not immediately clip the surface it starts on.
pub fn nudge_off_surface(point: &Vec3, normal: &Vec3) -> Vec3 {
    vector_ma(point, DIST_EPSILON * 2.0, normal)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspfile::{BspData, DBrush, DLeaf, DModel, DNode};
    use crate::mathlib::Plane;

    /// Two leafs split by the x=0 plane: x > 0 empty, x < 0 solid.
    fn wall_map() -> BspData {
        let mut bsp = BspData::default();
        bsp.planes.push(Plane::from_normal_dist([1.0, 0.0, 0.0], 0.0));
        bsp.nodes.push(DNode {
            planenum: 0,
            children: [-1, -2], // front -> leaf 0, back -> leaf 1
            ..Default::default()
        });
        bsp.leafs.push(DLeaf {
            contents: 0,
            cluster: 0,
            ..Default::default()
        });
        bsp.leafs.push(DLeaf {
            contents: MASK_LIGHT_OPAQUE,
            cluster: -1,
            ..Default::default()
        });
        bsp.brushes.push(DBrush::default());
        bsp.models.push(DModel {
            headnode: 0,
            ..Default::default()
        });
        bsp
    }

    #[test]
    fn test_unobstructed_ray() {
        let bsp = wall_map();
        let ctx = TraceContext::new(&bsp);
        let tr = ctx.test_line(&[10.0, 0.0, 0.0], &[20.0, 5.0, 5.0]);
        assert!(!tr.blocked());
        assert_eq!(tr.fraction, 1.0);
    }

    #[test]
    fn test_blocked_ray() {
        let bsp = wall_map();
        let ctx = TraceContext::new(&bsp);
        let tr = ctx.test_line(&[10.0, 0.0, 0.0], &[-10.0, 0.0, 0.0]);
        assert!(tr.blocked());
        // Blocked at the x=0 crossing
        assert!((tr.fraction - 0.5).abs() < 0.01);
        assert!(tr.endpos[0].abs() < 0.1);
    }

    #[test]
    fn test_start_in_solid() {
        let bsp = wall_map();
        let ctx = TraceContext::new(&bsp);
        let tr = ctx.test_line(&[-5.0, 0.0, 0.0], &[5.0, 0.0, 0.0]);
        assert!(tr.startsolid);
        assert_eq!(tr.fraction, 0.0);
        assert!(ctx.point_in_solid(&[-5.0, 0.0, 0.0]));
        assert!(!ctx.point_in_solid(&[5.0, 0.0, 0.0]));
    }

    #[test]
    fn test_prop_occluder_blocks() {
        let bsp = wall_map();
        let mut ctx = TraceContext::new(&bsp);
        ctx.add_occluder(PropOccluder {
            prop_id: 3,
            tris: vec![[
                [5.0, -10.0, -10.0],
                [5.0, 10.0, -10.0],
                [5.0, 0.0, 10.0],
            ]],
        });
        let tr = ctx.test_line(&[10.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!(tr.blocked());
        assert_eq!(tr.prop_id, Some(3));

        // Excluding the prop's own id passes through
        let tr = ctx.test_line_excluding(&[10.0, 0.0, 0.0], &[1.0, 0.0, 0.0], 3);
        assert!(!tr.blocked());
    }

    #[test]
    fn test_cluster_pvs_without_visdata_is_all_visible() {
        let mut bsp = wall_map();
        bsp.num_clusters = 16;
        let ctx = TraceContext::new(&bsp);
        let row = ctx.cluster_pvs(0);
        assert!(cluster_visible(&row, 7));
        assert!(cluster_visible(&row, 15));
    }

    #[test]
    fn test_cluster_visible_negative() {
        assert!(!cluster_visible(&[0xff], -1));
    }
}
