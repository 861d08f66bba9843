// patch.rs — radiosity patch store and surface subdivision
//
// Patches are kept in a growable arena addressed by stable integer
// handles. Links between patches (parent, children, per-face chains)
// are handles, never references, so the backing array is free to
// reallocate while subdivision appends.

use myrad_common::console::{fatal_error, warn_once};
use myrad_common::mathlib::{vector_ma, Plane, Vec3};
use myrad_common::winding::Winding;

use crate::lightval::LightChannels;

pub type PatchHandle = i32;
pub const PATCH_NONE: PatchHandle = -1;

/// Default maximum patch edge length in world units.
pub const DEFAULT_CHOP: f32 = 64.0;
/// Subdivision floor: stop once a child would fall below this fraction
/// of a chop-sized square.
pub const MIN_AREA_RATIO: f32 = 0.05;
/// Areas below this are degenerate; subdividing them invites NaNs.
pub const DEGENERATE_AREA: f32 = 1e-5;

/// One radiosity unit: a triangle or quad fragment of an emitting
/// surface.
#[derive(Debug, Clone)]
pub struct Patch {
    pub winding: Winding,
    pub plane: Plane,
    /// Centroid nudged just off the plane, used as the trace origin
    pub origin: Vec3,
    pub face: i32,
    pub area: f32,
    /// Light emitted by the surface itself
    pub baselight: Vec3,
    /// Direct light landing on the patch (seed for the first bounce)
    pub directlight: Vec3,
    /// Total gathered light, per active channel
    pub totallight: LightChannels,
    pub reflectivity: Vec3,
    pub chop: f32,
    pub cluster: i32,
    pub bump: bool,
    pub sky: bool,
    pub parent: PatchHandle,
    pub child1: PatchHandle,
    pub child2: PatchHandle,
    /// Next patch on the same face
    pub ndx_next: PatchHandle,
    /// Form-factor weights into this patch, built per cluster
    pub transfers: Vec<Transfer>,
}

/// Fraction of bounced light flowing from `patch` into the owner of the
/// transfers array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    pub patch: PatchHandle,
    pub weight: f32,
}

impl Patch {
    fn from_winding(winding: Winding, face: i32, chop: f32) -> Patch {
        let plane = winding.plane();
        let area = winding.area();
        let origin = vector_ma(&winding.center(), 2.0, &plane.normal);
        Patch {
            winding,
            plane,
            origin,
            face,
            area,
            baselight: [0.0; 3],
            directlight: [0.0; 3],
            totallight: LightChannels::flat(),
            reflectivity: [0.5, 0.5, 0.5],
            chop,
            cluster: -1,
            bump: false,
            sky: false,
            parent: PATCH_NONE,
            child1: PATCH_NONE,
            child2: PATCH_NONE,
            ndx_next: PATCH_NONE,
            transfers: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.child1 == PATCH_NONE && self.child2 == PATCH_NONE
    }
}

/// Arena of all patches in the map. Handles stay valid for the life of
/// the store; nothing is freed until the run ends.
#[derive(Default)]
pub struct PatchStore {
    patches: Vec<Patch>,
    /// Head of the per-face patch chain, indexed by face number
    face_heads: Vec<PatchHandle>,
}

impl PatchStore {
    pub fn new(num_faces: usize) -> Self {
        Self {
            patches: Vec::new(),
            face_heads: vec![PATCH_NONE; num_faces],
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn get(&self, h: PatchHandle) -> &Patch {
        &self.patches[h as usize]
    }

    pub fn get_mut(&mut self, h: PatchHandle) -> &mut Patch {
        &mut self.patches[h as usize]
    }

    pub fn iter_handles(&self) -> impl Iterator<Item = PatchHandle> {
        0..self.patches.len() as PatchHandle
    }

    /// Leaf patches only; parents exist for hierarchy bookkeeping.
    pub fn iter_leaves(&self) -> impl Iterator<Item = PatchHandle> + '_ {
        (0..self.patches.len() as PatchHandle).filter(|&h| self.get(h).is_leaf())
    }

    pub fn face_patches(&self, face: usize) -> FacePatchIter<'_> {
        FacePatchIter {
            store: self,
            next: self.face_heads.get(face).copied().unwrap_or(PATCH_NONE),
        }
    }

    fn alloc(&mut self, patch: Patch) -> PatchHandle {
        if self.patches.len() >= i32::MAX as usize {
            // Handle arithmetic would wrap; indices must stay contiguous
            fatal_error("patch arena exhausted");
        }
        self.patches.push(patch);
        (self.patches.len() - 1) as PatchHandle
    }

    fn link_to_face(&mut self, face: usize, h: PatchHandle) {
        self.patches[h as usize].ndx_next = self.face_heads[face];
        self.face_heads[face] = h;
    }

    // ========================================================
    // Face subdivision
    // ========================================================

    /// Create the base patch for a face and subdivide it down to chop
    /// size. Returns the root handle, or None for degenerate faces.
    pub fn make_patch_for_face(
        &mut self,
        face: i32,
        winding: Winding,
        chop: f32,
        reflectivity: Vec3,
        baselight: Vec3,
        cluster: i32,
        bump: bool,
        sky: bool,
    ) -> Option<PatchHandle> {
        if winding.num_points() < 3 {
            return None;
        }
        let area = winding.area();
        if area < DEGENERATE_AREA {
            warn_once(
                &format!("degenerate-face-{}", face),
                &format!("face {} has near-zero area, not chopped", face),
            );
            return None;
        }
        let mut patch = Patch::from_winding(winding, face, chop);
        patch.reflectivity = reflectivity;
        patch.baselight = baselight;
        patch.cluster = cluster;
        patch.bump = bump;
        patch.sky = sky;
        let root = self.alloc(patch);
        self.link_to_face(face as usize, root);
        self.subdivide(root);
        Some(root)
    }

    /// Recursive binary subdivision. Quads become two triangles first;
    /// polygons with more sides are clipped at the midplane of their
    /// largest extent; triangles bisect their longest edge.
    fn subdivide(&mut self, h: PatchHandle) {
        let (windings, face) = {
            let patch = self.get(h);
            let (_, longest) = patch.winding.longest_edge();
            if longest <= patch.chop {
                return;
            }
            if patch.area <= patch.chop * patch.chop * MIN_AREA_RATIO {
                return;
            }
            if patch.area < DEGENERATE_AREA {
                return;
            }

            let pieces = match patch.winding.num_points() {
                3 => {
                    let (a, b) = patch.winding.split_triangle_longest_edge();
                    Some((a, b))
                }
                4 => {
                    let (a, b) = patch.winding.split_quad();
                    Some((a, b))
                }
                _ => {
                    // Clip at the midpoint of the largest bounds extent
                    let (mins, maxs) = patch.winding.bounds();
                    let mut axis = 0;
                    for i in 1..3 {
                        if maxs[i] - mins[i] > maxs[axis] - mins[axis] {
                            axis = i;
                        }
                    }
                    let mut normal = [0.0f32; 3];
                    normal[axis] = 1.0;
                    let dist = (mins[axis] + maxs[axis]) * 0.5;
                    let split = Plane::from_normal_dist(normal, dist);
                    match patch.winding.clip(&split) {
                        (Some(a), Some(b)) => Some((a, b)),
                        // Did not actually straddle; fall back to a leaf
                        _ => None,
                    }
                }
            };
            (pieces, patch.face)
        };

        let Some((wa, wb)) = windings else {
            return;
        };
        if wa.area() < DEGENERATE_AREA || wb.area() < DEGENERATE_AREA {
            return;
        }

        let template = self.get(h).clone();
        let mut make_child = |store: &mut PatchStore, winding: Winding| -> PatchHandle {
            let mut child = Patch::from_winding(winding, template.face, template.chop);
            child.plane = template.plane;
            child.reflectivity = template.reflectivity;
            child.baselight = template.baselight;
            child.cluster = template.cluster;
            child.bump = template.bump;
            child.sky = template.sky;
            child.parent = h;
            let ch = store.alloc(child);
            store.link_to_face(face as usize, ch);
            ch
        };

        let c1 = make_child(self, wa);
        let c2 = make_child(self, wb);
        self.get_mut(h).child1 = c1;
        self.get_mut(h).child2 = c2;

        self.subdivide(c1);
        self.subdivide(c2);
    }

    // ========================================================
    // Displacement subdivision
    // ========================================================

    /// Chop a displacement surface. The vertex grid is (2^power + 1)
    /// on a side; splits halve index ranges rather than bisecting world
    /// edges, and recursion is capped at power * 2 levels.
    pub fn make_patches_for_displacement(
        &mut self,
        face: i32,
        disp: &DispGrid,
        chop: f32,
        reflectivity: Vec3,
        cluster: i32,
    ) -> Vec<PatchHandle> {
        let side = disp.side();
        let mut out = Vec::new();
        self.subdivide_disp_rect(
            face,
            disp,
            (0, 0, side - 1, side - 1),
            0,
            disp.power * 2,
            chop,
            &reflectivity,
            cluster,
            &mut out,
        );
        out
    }

    fn subdivide_disp_rect(
        &mut self,
        face: i32,
        disp: &DispGrid,
        rect: (usize, usize, usize, usize),
        depth: i32,
        max_depth: i32,
        chop: f32,
        reflectivity: &Vec3,
        cluster: i32,
        out: &mut Vec<PatchHandle>,
    ) {
        let (i0, j0, i1, j1) = rect;
        let wi = i1 - i0;
        let wj = j1 - j0;

        // A single grid cell, the depth cap, or a small-enough extent
        // ends recursion with one quad patch (split into triangles).
        let corner_a = disp.vert(i0, j0);
        let corner_b = disp.vert(i1, j1);
        let extent = myrad_common::mathlib::vector_length(
            &myrad_common::mathlib::vector_subtract(&corner_b, &corner_a),
        );
        if (wi <= 1 && wj <= 1) || depth >= max_depth || extent <= chop {
            let quad = Winding::new(vec![
                disp.vert(i0, j0),
                disp.vert(i1, j0),
                disp.vert(i1, j1),
                disp.vert(i0, j1),
            ]);
            if quad.area() < DEGENERATE_AREA {
                return;
            }
            let (t1, t2) = quad.split_quad();
            for w in [t1, t2] {
                if w.area() < DEGENERATE_AREA {
                    continue;
                }
                let mut patch = Patch::from_winding(w, face, chop);
                patch.reflectivity = *reflectivity;
                patch.cluster = cluster;
                let h = self.alloc(patch);
                self.link_to_face(face as usize, h);
                out.push(h);
            }
            return;
        }

        // Halve the wider index range
        if wi >= wj {
            let mid = i0 + wi / 2;
            self.subdivide_disp_rect(
                face, disp, (i0, j0, mid, j1), depth + 1, max_depth, chop,
                reflectivity, cluster, out,
            );
            self.subdivide_disp_rect(
                face, disp, (mid, j0, i1, j1), depth + 1, max_depth, chop,
                reflectivity, cluster, out,
            );
        } else {
            let mid = j0 + wj / 2;
            self.subdivide_disp_rect(
                face, disp, (i0, j0, i1, mid), depth + 1, max_depth, chop,
                reflectivity, cluster, out,
            );
            self.subdivide_disp_rect(
                face, disp, (i0, mid, i1, j1), depth + 1, max_depth, chop,
                reflectivity, cluster, out,
            );
        }
    }
}

/// Iterator over a face's patch chain.
pub struct FacePatchIter<'a> {
    store: &'a PatchStore,
    next: PatchHandle,
}

impl<'a> Iterator for FacePatchIter<'a> {
    type Item = PatchHandle;

    fn next(&mut self) -> Option<PatchHandle> {
        if self.next == PATCH_NONE {
            return None;
        }
        let h = self.next;
        self.next = self.store.get(h).ndx_next;
        Some(h)
    }
}

/// Displacement vertex grid: (2^power + 1)^2 positions, row-major.
#[derive(Debug, Clone)]
pub struct DispGrid {
    pub power: i32,
    pub verts: Vec<Vec3>,
}

impl DispGrid {
    pub fn side(&self) -> usize {
        (1usize << self.power) + 1
    }

    pub fn vert(&self, i: usize, j: usize) -> Vec3 {
        self.verts[j * self.side() + i]
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(size: f32) -> Winding {
        Winding::new(vec![
            [0.0, 0.0, 0.0],
            [size, 0.0, 0.0],
            [size, size, 0.0],
            [0.0, size, 0.0],
        ])
    }

    fn make_store() -> PatchStore {
        PatchStore::new(8)
    }

    #[test]
    fn test_small_face_single_patch() {
        let mut store = make_store();
        let root = store
            .make_patch_for_face(0, quad(32.0), 64.0, [0.5; 3], [0.0; 3], 0, false, false)
            .unwrap();
        assert!(store.get(root).is_leaf());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_chop_64_edge_200_subdivides() {
        let mut store = make_store();
        let original_area = quad(200.0).area();
        store
            .make_patch_for_face(0, quad(200.0), 64.0, [0.5; 3], [0.0; 3], 0, false, false)
            .unwrap();

        let leaves: Vec<_> = store.iter_leaves().collect();
        assert!(leaves.len() >= 2, "expected >= 2 leaves, got {}", leaves.len());

        // Combined leaf area matches the face area within 0.1%
        let leaf_area: f32 = leaves.iter().map(|&h| store.get(h).area).sum();
        assert!(
            (leaf_area - original_area).abs() < original_area * 0.001,
            "leaf area {} vs original {}",
            leaf_area,
            original_area
        );

        // Every leaf honors the chop bound
        for &h in &leaves {
            let (_, longest) = store.get(h).winding.longest_edge();
            let p = store.get(h);
            assert!(
                longest <= 64.0 || p.area <= 64.0 * 64.0 * MIN_AREA_RATIO,
                "leaf edge {} exceeds chop",
                longest
            );
        }
    }

    #[test]
    fn test_all_patches_positive_area() {
        let mut store = make_store();
        store
            .make_patch_for_face(0, quad(300.0), 64.0, [0.5; 3], [0.0; 3], 0, false, false)
            .unwrap();
        for h in store.iter_handles() {
            assert!(store.get(h).area > 0.0);
        }
    }

    #[test]
    fn test_children_sum_to_parent_area() {
        let mut store = make_store();
        store
            .make_patch_for_face(0, quad(256.0), 64.0, [0.5; 3], [0.0; 3], 0, false, false)
            .unwrap();
        for h in store.iter_handles() {
            let p = store.get(h);
            if !p.is_leaf() {
                let sum = store.get(p.child1).area + store.get(p.child2).area;
                assert!(
                    (sum - p.area).abs() < p.area * 1e-4,
                    "children {} vs parent {}",
                    sum,
                    p.area
                );
            }
        }
    }

    #[test]
    fn test_degenerate_face_rejected() {
        let mut store = make_store();
        let sliver = Winding::new(vec![
            [0.0, 0.0, 0.0],
            [100.0, 0.0, 0.0],
            [50.0, 1e-6, 0.0],
        ]);
        assert!(store
            .make_patch_for_face(0, sliver, 64.0, [0.5; 3], [0.0; 3], 0, false, false)
            .is_none());
    }

    #[test]
    fn test_face_chain_covers_all_patches() {
        let mut store = make_store();
        store
            .make_patch_for_face(2, quad(200.0), 64.0, [0.5; 3], [0.0; 3], 0, false, false)
            .unwrap();
        let chain: Vec<_> = store.face_patches(2).collect();
        assert_eq!(chain.len(), store.len());
        assert!(store.face_patches(3).next().is_none());
    }

    #[test]
    fn test_displacement_grid() {
        // power-2 grid: 5x5 verts over a 200-unit square
        let mut verts = Vec::new();
        for j in 0..5 {
            for i in 0..5 {
                verts.push([i as f32 * 50.0, j as f32 * 50.0, (i + j) as f32]);
            }
        }
        let disp = DispGrid { power: 2, verts };
        let mut store = make_store();
        let handles =
            store.make_patches_for_displacement(1, &disp, 64.0, [0.5; 3], 0);
        assert!(!handles.is_empty());
        for &h in &handles {
            assert!(store.get(h).area > 0.0);
        }
    }
}
