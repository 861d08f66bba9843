// gather.rs — direct and indirect light gathering at a point
//
// The same primitives light lightmap samples, radiosity patches, and
// static prop vertices. Direct gathering is scalar-per-light so the
// incremental cache can defer the light's color; indirect gathering
// shoots a hemisphere of rays at already-lit surfaces.

use myrad_common::bspfile::EMIT_SKYAMBIENT;
use myrad_common::console::warn_once;
use myrad_common::mathlib::{
    dot_product, vector_add, vector_ma, vector_scale, vector_subtract, Vec3,
};
use myrad_common::trace::{cluster_visible, nudge_off_surface, TraceContext};

use crate::context::RadSettings;
use crate::lights::{eval_light_scalar, DirectLight, ANGLE_EPS, MAX_TRACE_LENGTH};
use crate::sampler::{hemisphere_sample_count, DirectionalSampler};

/// Bisection steps when crawling an embedded point out of solid.
pub const EMBEDDED_REPAIR_ITERATIONS: usize = 20;

/// Scalar (color-deferred) contribution of one light at a point,
/// including the occlusion trace. Zero means culled, facing away, or
/// shadowed.
pub fn direct_light_scalar(
    trace: &TraceContext,
    dl: &DirectLight,
    pos: &Vec3,
    normal: &Vec3,
    cluster: i32,
    skip_prop: i32,
) -> f32 {
    use crate::lights::LightCaps;

    // PVS cull before any math
    if !dl.caps.contains(LightCaps::IGNORE_PVS) && !cluster_visible(&dl.pvs, cluster) {
        return 0.0;
    }

    let Some((scalar, target)) = eval_light_scalar(dl, pos, normal) else {
        return 0.0;
    };

    // Start slightly toward the light to dodge surface acne
    let start = nudge_off_surface(pos, normal);
    let tr = trace.test_line_excluding(&start, &target, skip_prop);

    match dl.light.emit_type {
        myrad_common::bspfile::EMIT_SKYLIGHT => {
            // Sun rays must escape to a sky surface
            let center_hit = tr.blocked() && tr.hit_sky;
            if dl.light.radius <= 0.0 {
                return if center_hit { scalar } else { 0.0 };
            }
            // Soft sun: jitter extra rays within the sun disk and
            // average the sky visibility for penumbra edges
            const SUN_SOFT_RAYS: usize = 4;
            let mut rng = rand::thread_rng();
            let mut hits = center_hit as u32;
            let to_sun = myrad_common::mathlib::vector_negate(&dl.light.normal);
            for _ in 0..SUN_SOFT_RAYS {
                let dir = crate::sampler::jitter_direction(&mut rng, &to_sun, dl.light.radius);
                let target = vector_ma(&start, MAX_TRACE_LENGTH, &dir);
                let jt = trace.test_line_excluding(&start, &target, skip_prop);
                if jt.blocked() && jt.hit_sky {
                    hits += 1;
                }
            }
            scalar * hits as f32 / (SUN_SOFT_RAYS + 1) as f32
        }
        _ => {
            if tr.blocked() {
                0.0
            } else {
                scalar
            }
        }
    }
}

/// Ambient sky: fraction-weighted hemisphere integration. Each ray that
/// escapes to sky contributes its cosine share of the ambient color.
pub fn sky_ambient_scalar(
    trace: &TraceContext,
    pos: &Vec3,
    normal: &Vec3,
    skip_prop: i32,
    settings: &RadSettings,
) -> f32 {
    let count = hemisphere_sample_count(settings.fast, settings.sky_sample_scale);
    let mut sampler = DirectionalSampler::new();
    let start = nudge_off_surface(pos, normal);
    let mut total = 0.0;

    for _ in 0..count {
        let dir = sampler.next_direction_around(normal);
        let dot = dot_product(&dir, normal);
        if dot <= ANGLE_EPS {
            continue;
        }
        let target = vector_ma(&start, MAX_TRACE_LENGTH, &dir);
        let tr = trace.test_line_excluding(&start, &target, skip_prop);
        if tr.blocked() && tr.hit_sky {
            total += dot;
        }
    }
    total / count as f32
}

/// Full-color direct lighting at a point: every active light summed.
/// Style channels are the face path's concern; prop lighting folds
/// every style together.
pub fn compute_direct_lighting_at_point(
    trace: &TraceContext,
    lights: &[DirectLight],
    pos: &Vec3,
    normal: &Vec3,
    skip_prop: i32,
    settings: &RadSettings,
) -> Vec3 {
    let cluster = trace.point_cluster(pos);
    let mut out = [0.0f32; 3];
    for dl in lights {
        let scalar = if dl.light.emit_type == EMIT_SKYAMBIENT {
            sky_ambient_scalar(trace, pos, normal, skip_prop, settings)
        } else {
            direct_light_scalar(trace, dl, pos, normal, cluster, skip_prop)
        };
        if scalar > 0.0 {
            out = vector_ma(&out, scalar, &dl.light.intensity);
        }
    }
    out
}

/// Per-face surface data the indirect pass samples: the average
/// already-computed light and the reflectivity of each face.
pub struct IndirectSurfaces {
    pub avg_light: Vec<Vec3>,
    pub reflectivity: Vec<Vec3>,
}

/// Bounce gathering: shoot a hemisphere of rays; each ray striking a
/// lit, non-sky surface pulls that surface's average lightmap color
/// scaled by reflectivity and inverse-square falloff. Rays that escape
/// to sky are skipped (the sky lights already contributed directly).
pub fn compute_indirect_lighting_at_point(
    trace: &TraceContext,
    surfaces: &IndirectSurfaces,
    pos: &Vec3,
    normal: &Vec3,
    skip_prop: i32,
    settings: &RadSettings,
) -> Vec3 {
    let count = hemisphere_sample_count(settings.fast, settings.sky_sample_scale);
    let mut sampler = DirectionalSampler::new();
    let start = nudge_off_surface(pos, normal);
    let mut total = [0.0f32; 3];

    for _ in 0..count {
        let dir = sampler.next_direction_around(normal);
        let dot = dot_product(&dir, normal);
        if dot <= ANGLE_EPS {
            continue;
        }
        let target = vector_ma(&start, MAX_TRACE_LENGTH, &dir);
        let tr = trace.test_line_excluding(&start, &target, skip_prop);
        if !tr.blocked() || tr.hit_sky {
            continue;
        }
        let Some(face) = tr.face else {
            continue;
        };
        let hit_light = surfaces.avg_light[face];
        let refl = surfaces.reflectivity[face];
        let dist = myrad_common::mathlib::vector_length(&vector_subtract(&tr.endpos, pos));
        let falloff = 1.0 / (1.0 + dist * dist * 1e-4);
        let contrib = [
            hit_light[0] * refl[0],
            hit_light[1] * refl[1],
            hit_light[2] * refl[2],
        ];
        total = vector_add(&total, &vector_scale(&contrib, dot * falloff));
    }
    vector_scale(&total, 1.0 / count as f32)
}

// ============================================================
// Embedded point repair
// ============================================================

/// Pull a sample point that landed inside solid geometry back out.
/// Preference order: the explicit lighting-origin override, then a
/// bisection crawl toward `toward` (face center, prop origin). Returns
/// None when nothing within reach is outside solid; the caller leaves
/// the point black.
pub fn repair_embedded_point(
    trace: &TraceContext,
    pos: &Vec3,
    toward: &Vec3,
    lighting_origin: Option<Vec3>,
) -> Option<Vec3> {
    if !trace.point_in_solid(pos) {
        return Some(*pos);
    }

    if let Some(origin) = lighting_origin {
        if !trace.point_in_solid(&origin) {
            return Some(origin);
        }
    }

    if trace.point_in_solid(toward) {
        // No valid neighbor to crawl toward
        warn_once(
            "embedded-no-neighbor",
            &format!(
                "sample at ({:.1} {:.1} {:.1}) embedded in solid with no valid neighbor",
                pos[0], pos[1], pos[2]
            ),
        );
        return None;
    }

    // Bisect between the embedded point and the valid neighbor: keep
    // the valid end, tighten toward the boundary.
    let mut inside = *pos;
    let mut outside = *toward;
    for _ in 0..EMBEDDED_REPAIR_ITERATIONS {
        let mid = vector_scale(&vector_add(&inside, &outside), 0.5);
        if trace.point_in_solid(&mid) {
            inside = mid;
        } else {
            outside = mid;
        }
    }
    Some(outside)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lights::LightCaps;
    use myrad_common::bspfile::{
        BspData, DLeaf, DModel, DNode, DWorldLight, EMIT_POINT, MASK_LIGHT_OPAQUE,
    };
    use myrad_common::mathlib::Plane;

    /// x < 0 is solid, x > 0 is open.
    fn wall_map() -> BspData {
        let mut bsp = BspData::default();
        bsp.planes.push(Plane::from_normal_dist([1.0, 0.0, 0.0], 0.0));
        bsp.nodes.push(DNode {
            planenum: 0,
            children: [-1, -2],
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
        bsp.models.push(DModel {
            headnode: 0,
            ..Default::default()
        });
        bsp.num_clusters = 1;
        bsp
    }

    fn point_light(origin: [f32; 3]) -> DirectLight {
        DirectLight {
            light: DWorldLight {
                emit_type: EMIT_POINT,
                origin,
                intensity: [300.0; 3],
                quadratic_attn: 1.0,
                ..Default::default()
            },
            pvs: vec![0xff],
            facenum: -1,
            caps: LightCaps::CAST_SHADOWS,
            inc_id: -1,
        }
    }

    #[test]
    fn test_unoccluded_light_contributes() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        let dl = point_light([100.0, 0.0, 100.0]);
        let scalar =
            direct_light_scalar(&trace, &dl, &[100.0, 0.0, 0.0], &[0.0, 0.0, 1.0], 0, -1);
        assert!(scalar > 0.0);
    }

    #[test]
    fn test_occluded_light_contributes_zero() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        // Light on the far side of the x=0 wall
        let dl = point_light([-100.0, 0.0, 50.0]);
        // Sample sits in the open but the ray must cross the solid half
        let scalar = direct_light_scalar(
            &trace,
            &dl,
            &[100.0, 0.0, 0.0],
            &[-1.0, 0.0, 0.0],
            0,
            -1,
        );
        assert_eq!(scalar, 0.0);
    }

    #[test]
    fn test_pvs_cull() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        let mut dl = point_light([100.0, 0.0, 100.0]);
        dl.pvs = vec![0x00]; // light sees no clusters
        let scalar =
            direct_light_scalar(&trace, &dl, &[100.0, 0.0, 0.0], &[0.0, 0.0, 1.0], 0, -1);
        assert_eq!(scalar, 0.0);
    }

    #[test]
    fn test_repair_embedded_point() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        let embedded = [-10.0, 0.0, 0.0];
        let valid = [50.0, 0.0, 0.0];
        let repaired = repair_embedded_point(&trace, &embedded, &valid, None).unwrap();
        assert!(!trace.point_in_solid(&repaired));
        // Repaired point hugs the solid boundary
        assert!(repaired[0] >= 0.0 && repaired[0] < 1.0);
    }

    #[test]
    fn test_repair_prefers_lighting_origin() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        let origin = Some([77.0, 0.0, 0.0]);
        let repaired =
            repair_embedded_point(&trace, &[-10.0, 0.0, 0.0], &[50.0, 0.0, 0.0], origin)
                .unwrap();
        assert_eq!(repaired, [77.0, 0.0, 0.0]);
    }

    #[test]
    fn test_repair_hopeless_returns_none() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        myrad_common::console::reset_warn_once();
        let repaired =
            repair_embedded_point(&trace, &[-10.0, 0.0, 0.0], &[-20.0, 0.0, 0.0], None);
        assert!(repaired.is_none());
    }

    #[test]
    fn test_valid_point_untouched() {
        let bsp = wall_map();
        let trace = TraceContext::new(&bsp);
        let p = [25.0, 1.0, 2.0];
        assert_eq!(
            repair_embedded_point(&trace, &p, &[50.0, 0.0, 0.0], None),
            Some(p)
        );
    }
}
