// lights.rs — direct light list construction and falloff evaluation
//
// Lights come from three places: point/spot/environment entities in the
// entity lump, and emissive texinfos (surface lights). Every light gets
// a PVS domain so the gather pass can cull by cluster before tracing.

use bitflags::bitflags;

use myrad_common::bspfile::{
    BspData, DWorldLight, DWL_FLAGS_CASTSHADOWS, EMIT_POINT, EMIT_SKYAMBIENT, EMIT_SKYLIGHT,
    EMIT_SPOTLIGHT, EMIT_SURFACE, SURF_LIGHT,
};
use myrad_common::console::qdprintf;
use myrad_common::entdata::{parse_entities, Entity};
use myrad_common::mathlib::{
    angle_vectors_forward, dot_product, vector_normalize, vector_scale, vector_subtract, Vec3,
};
use myrad_common::trace::TraceContext;

use crate::context::RadSettings;
use crate::patch::PatchStore;

/// Rays to "infinity" (sky tests) stop here.
pub const MAX_TRACE_LENGTH: f32 = 100_000.0;

/// Facing-away tolerance for the angle term.
pub const ANGLE_EPS: f32 = 1e-3;

/// Default point light intensity when the entity gives none.
const DEFAULT_LIGHT_VALUE: f32 = 300.0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LightCaps: u32 {
        /// Participates in occlusion tracing
        const CAST_SHADOWS = 0x1;
        /// Contribution bypasses the PVS cull (sky lights)
        const IGNORE_PVS = 0x2;
    }
}

/// One active light source for this run.
#[derive(Debug, Clone)]
pub struct DirectLight {
    pub light: DWorldLight,
    /// Byte-packed cluster visibility domain
    pub pvs: Vec<u8>,
    /// Emitting face for surface lights, -1 otherwise
    pub facenum: i32,
    pub caps: LightCaps,
    /// Assigned by the incremental cache; -1 when not participating
    pub inc_id: i32,
}

impl DirectLight {
    /// Largest intensity component; the incremental cache stores dots
    /// normalized by this.
    pub fn max_intensity(&self) -> f32 {
        self.light.intensity[0]
            .max(self.light.intensity[1])
            .max(self.light.intensity[2])
    }

    pub fn is_sky(&self) -> bool {
        self.light.emit_type == EMIT_SKYLIGHT || self.light.emit_type == EMIT_SKYAMBIENT
    }
}

// ============================================================
// Construction from entities
// ============================================================

fn light_color(ent: &Entity, scale: f32) -> Vec3 {
    // "_light" carries "r g b" or "r g b intensity"; plain "light" is a
    // white intensity scalar.
    if let Some(v) = ent.value("_light") {
        let parts: Vec<f32> = v
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        match parts.len() {
            1 => return vector_scale(&[1.0, 1.0, 1.0], parts[0] * scale),
            3 => return vector_scale(&[parts[0], parts[1], parts[2]], scale),
            4 => {
                let mut c = [parts[0], parts[1], parts[2]];
                let max = c[0].max(c[1]).max(c[2]).max(1.0);
                c = vector_scale(&c, parts[3] / max);
                return vector_scale(&c, scale);
            }
            _ => {}
        }
    }
    let intensity = ent.float_value("light").unwrap_or(DEFAULT_LIGHT_VALUE);
    vector_scale(&[1.0, 1.0, 1.0], intensity * scale)
}

fn attenuation(ent: &Entity) -> (f32, f32, f32) {
    let c = ent.float_value("_constant_attn").unwrap_or(0.0);
    let l = ent.float_value("_linear_attn").unwrap_or(0.0);
    let q = ent.float_value("_quadratic_attn").unwrap_or(0.0);
    if c == 0.0 && l == 0.0 && q == 0.0 {
        // Pure inverse-square when the entity specifies nothing
        (0.0, 0.0, 1.0)
    } else {
        (c, l, q)
    }
}

fn spot_direction(ent: &Entity) -> Vec3 {
    let mut angles = ent.vector_value("angles").unwrap_or([0.0, 0.0, 0.0]);
    if let Some(pitch) = ent.float_value("pitch") {
        angles[0] = -pitch;
    }
    angle_vectors_forward(&angles)
}

fn finish_light(
    mut dl: DirectLight,
    trace: &TraceContext,
) -> DirectLight {
    if dl.caps.contains(LightCaps::IGNORE_PVS) {
        // Sky lights reach every cluster
        dl.light.cluster = -1;
        dl.pvs = vec![0xff; trace.cluster_pvs(0).len().max(1)];
    } else {
        let cluster = trace.point_cluster(&dl.light.origin);
        dl.light.cluster = cluster;
        dl.pvs = trace.cluster_pvs(cluster);
    }
    dl
}

/// Build the full active light list: entity lights plus surface lights
/// from emissive texinfos (one per emitting face, positioned at the
/// face's patch origin).
pub fn build_direct_lights(
    bsp: &BspData,
    trace: &TraceContext,
    patches: &PatchStore,
    settings: &RadSettings,
) -> Result<Vec<DirectLight>, String> {
    let mut lights = Vec::new();
    let scale = settings.light_scale;
    let entities = parse_entities(&bsp.entity_string)?;

    for ent in &entities {
        match ent.classname() {
            "light" => {
                let (c, l, q) = attenuation(ent);
                lights.push(DirectLight {
                    light: DWorldLight {
                        emit_type: EMIT_POINT,
                        origin: ent.origin(),
                        intensity: light_color(ent, scale),
                        constant_attn: c,
                        linear_attn: l,
                        quadratic_attn: q,
                        flags: DWL_FLAGS_CASTSHADOWS,
                        texinfo: -1,
                        style: ent.int_value("style").unwrap_or(0),
                        ..Default::default()
                    },
                    pvs: Vec::new(),
                    facenum: -1,
                    caps: LightCaps::CAST_SHADOWS,
                    inc_id: -1,
                });
            }
            "light_spot" => {
                let (c, l, q) = attenuation(ent);
                let outer = ent.float_value("_cone").unwrap_or(45.0).clamp(1.0, 90.0);
                let inner = ent
                    .float_value("_inner_cone")
                    .unwrap_or(outer * 2.0 / 3.0)
                    .clamp(0.0, outer);
                lights.push(DirectLight {
                    light: DWorldLight {
                        emit_type: EMIT_SPOTLIGHT,
                        origin: ent.origin(),
                        intensity: light_color(ent, scale),
                        normal: spot_direction(ent),
                        stopdot: inner.to_radians().cos(),
                        stopdot2: outer.to_radians().cos(),
                        exponent: ent.float_value("_exponent").unwrap_or(1.0),
                        constant_attn: c,
                        linear_attn: l,
                        quadratic_attn: q,
                        flags: DWL_FLAGS_CASTSHADOWS,
                        texinfo: -1,
                        style: ent.int_value("style").unwrap_or(0),
                        ..Default::default()
                    },
                    pvs: Vec::new(),
                    facenum: -1,
                    caps: LightCaps::CAST_SHADOWS,
                    inc_id: -1,
                });
            }
            "light_environment" => {
                let direction = spot_direction(ent);
                lights.push(DirectLight {
                    light: DWorldLight {
                        emit_type: EMIT_SKYLIGHT,
                        // The sun sits infinitely far along -direction
                        normal: direction,
                        intensity: light_color(ent, scale),
                        // Angular radius of the sun disk, for soft
                        // shadow edges
                        radius: ent
                            .float_value("_sun_spread_angle")
                            .unwrap_or(0.0)
                            .clamp(0.0, 90.0)
                            .to_radians(),
                        ..Default::default()
                    },
                    pvs: Vec::new(),
                    facenum: -1,
                    caps: LightCaps::CAST_SHADOWS | LightCaps::IGNORE_PVS,
                    inc_id: -1,
                });
                if let Some(ambient) = ent.vector_value("_ambient") {
                    lights.push(DirectLight {
                        light: DWorldLight {
                            emit_type: EMIT_SKYAMBIENT,
                            intensity: vector_scale(&ambient, scale),
                            ..Default::default()
                        },
                        pvs: Vec::new(),
                        facenum: -1,
                        caps: LightCaps::IGNORE_PVS,
                        inc_id: -1,
                    });
                }
            }
            _ => {}
        }
    }

    // Surface lights: one per face whose texinfo emits
    for (facenum, face) in bsp.faces.iter().enumerate() {
        let ti = &bsp.texinfo[face.texinfo as usize];
        if ti.flags & SURF_LIGHT == 0 || ti.value <= 0 {
            continue;
        }
        let Some(root) = patches.face_patches(facenum).last() else {
            continue;
        };
        let patch = patches.get(root);
        let emission = ti.value as f32 * scale;
        lights.push(DirectLight {
            light: DWorldLight {
                emit_type: EMIT_SURFACE,
                origin: patch.origin,
                normal: patch.plane.normal,
                intensity: vector_scale(&patch.reflectivity, emission),
                quadratic_attn: 1.0,
                flags: DWL_FLAGS_CASTSHADOWS,
                texinfo: face.texinfo as i32,
                ..Default::default()
            },
            pvs: Vec::new(),
            facenum: facenum as i32,
            caps: LightCaps::CAST_SHADOWS,
            inc_id: -1,
        });
    }

    let lights: Vec<DirectLight> = lights
        .into_iter()
        .map(|dl| finish_light(dl, trace))
        .collect();
    qdprintf(&format!("{} direct lights\n", lights.len()));
    Ok(lights)
}

// ============================================================
// Falloff evaluation
// ============================================================

/// Unoccluded scalar contribution of `dl` at a point with `normal`:
/// falloff times the receiver angle term, with the light's color
/// deliberately left out (the incremental cache defers it). Returns the
/// scalar and the trace target that must be clear for the light to
/// land.
pub fn eval_light_scalar(dl: &DirectLight, pos: &Vec3, normal: &Vec3) -> Option<(f32, Vec3)> {
    let wl = &dl.light;
    match wl.emit_type {
        EMIT_POINT | EMIT_SURFACE | EMIT_SPOTLIGHT => {
            let mut delta = vector_subtract(&wl.origin, pos);
            let dist = vector_normalize(&mut delta).max(1.0);
            let dot = dot_product(&delta, normal);
            if dot <= ANGLE_EPS {
                return None;
            }
            let mut scalar = dot * falloff(wl, dist);

            if wl.emit_type == EMIT_SURFACE {
                // Emitter-side cosine: surface lights only shine forward
                let dot2 = -dot_product(&delta, &wl.normal);
                if dot2 <= ANGLE_EPS {
                    return None;
                }
                scalar *= dot2;
            } else if wl.emit_type == EMIT_SPOTLIGHT {
                let dot2 = -dot_product(&delta, &wl.normal);
                if dot2 <= wl.stopdot2 {
                    return None;
                }
                let mut cone = 1.0;
                if dot2 < wl.stopdot {
                    // Smooth edge between inner and outer cone
                    cone = (dot2 - wl.stopdot2) / (wl.stopdot - wl.stopdot2);
                    if wl.exponent != 1.0 && wl.exponent > 0.0 {
                        cone = cone.powf(wl.exponent);
                    }
                }
                scalar *= cone;
            }
            Some((scalar, wl.origin))
        }
        EMIT_SKYLIGHT => {
            // Sun: direction is fixed, the ray must reach sky
            let dot = -dot_product(&wl.normal, normal);
            if dot <= ANGLE_EPS {
                return None;
            }
            let target = myrad_common::mathlib::vector_ma(
                pos,
                -MAX_TRACE_LENGTH,
                &wl.normal,
            );
            Some((dot, target))
        }
        // Ambient sky is integrated by the hemisphere sampler, not here
        _ => None,
    }
}

fn falloff(wl: &DWorldLight, dist: f32) -> f32 {
    let denom = wl.constant_attn + wl.linear_attn * dist + wl.quadratic_attn * dist * dist;
    if denom <= 0.0 {
        return 0.0;
    }
    // Intensities are authored in light units at 100 map units, so
    // rescale the quadratic term accordingly.
    100.0 * 100.0 / denom.max(1.0)
}

// ============================================================
// Wire serialization (the master's light-data broadcast)
// ============================================================

use myrad_common::bspfile::DWORLDLIGHT_SIZE;
use myrad_common::msgbuf::{
    msg_read_data, msg_read_long, msg_write_data, msg_write_long, SizeBuf,
};

/// Serialize the active light list into the blob workers receive
/// through the virtual file store.
pub fn serialize_light_list(lights: &[DirectLight]) -> Vec<u8> {
    let mut size = 16;
    for dl in lights {
        size += DWORLDLIGHT_SIZE + dl.pvs.len() + 32;
    }
    let mut sb = SizeBuf::new(size);
    msg_write_long(&mut sb, lights.len() as i32);
    for dl in lights {
        sb.write(&dl.light.to_bytes());
        msg_write_data(&mut sb, &dl.pvs);
        msg_write_long(&mut sb, dl.facenum);
        msg_write_long(&mut sb, dl.caps.bits() as i32);
        msg_write_long(&mut sb, dl.inc_id);
    }
    sb.as_slice().to_vec()
}

pub fn deserialize_light_list(data: &[u8]) -> Result<Vec<DirectLight>, String> {
    let mut sb = SizeBuf::from_bytes(data);
    let count = msg_read_long(&mut sb);
    if count < 0 {
        return Err("truncated light list".to_string());
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if sb.remaining() < DWORLDLIGHT_SIZE {
            return Err("truncated light list".to_string());
        }
        let light = DWorldLight::from_bytes(
            &sb.data[sb.readcount..sb.readcount + DWORLDLIGHT_SIZE],
        )
        .ok_or("bad light record")?;
        sb.readcount += DWORLDLIGHT_SIZE;
        let pvs = msg_read_data(&mut sb).ok_or("truncated light pvs")?;
        let facenum = msg_read_long(&mut sb);
        let caps = LightCaps::from_bits_truncate(msg_read_long(&mut sb) as u32);
        let inc_id = msg_read_long(&mut sb);
        out.push(DirectLight {
            light,
            pvs,
            facenum,
            caps,
            inc_id,
        });
    }
    Ok(out)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn point_light(origin: Vec3, intensity: f32) -> DirectLight {
        DirectLight {
            light: DWorldLight {
                emit_type: EMIT_POINT,
                origin,
                intensity: [intensity; 3],
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
    fn test_point_light_facing() {
        let dl = point_light([0.0, 0.0, 100.0], 300.0);
        // Floor at origin facing up
        let got = eval_light_scalar(&dl, &[0.0, 0.0, 0.0], &[0.0, 0.0, 1.0]);
        let (scalar, target) = got.expect("light faces the surface");
        assert!(scalar > 0.0);
        assert_eq!(target, [0.0, 0.0, 100.0]);
    }

    #[test]
    fn test_point_light_behind_surface() {
        let dl = point_light([0.0, 0.0, -100.0], 300.0);
        assert!(eval_light_scalar(&dl, &[0.0, 0.0, 0.0], &[0.0, 0.0, 1.0]).is_none());
    }

    #[test]
    fn test_inverse_square() {
        let dl = point_light([0.0, 0.0, 100.0], 300.0);
        let near = eval_light_scalar(&dl, &[0.0, 0.0, 0.0], &[0.0, 0.0, 1.0])
            .unwrap()
            .0;
        let dl_far = point_light([0.0, 0.0, 200.0], 300.0);
        let far = eval_light_scalar(&dl_far, &[0.0, 0.0, 0.0], &[0.0, 0.0, 1.0])
            .unwrap()
            .0;
        // Doubling distance quarters the falloff (same facing)
        assert!((near / far - 4.0).abs() < 0.1);
    }

    #[test]
    fn test_spot_cone_cutoff() {
        let dl = DirectLight {
            light: DWorldLight {
                emit_type: EMIT_SPOTLIGHT,
                origin: [0.0, 0.0, 100.0],
                normal: [0.0, 0.0, -1.0], // pointing down
                intensity: [300.0; 3],
                stopdot: (20.0f32).to_radians().cos(),
                stopdot2: (45.0f32).to_radians().cos(),
                exponent: 1.0,
                quadratic_attn: 1.0,
                ..Default::default()
            },
            pvs: vec![0xff],
            facenum: -1,
            caps: LightCaps::CAST_SHADOWS,
            inc_id: -1,
        };
        // Directly below: inside the inner cone
        assert!(eval_light_scalar(&dl, &[0.0, 0.0, 0.0], &[0.0, 0.0, 1.0]).is_some());
        // Way off axis: outside the outer cone
        assert!(eval_light_scalar(&dl, &[500.0, 0.0, 0.0], &[0.0, 0.0, 1.0]).is_none());
    }

    #[test]
    fn test_sky_light_direction() {
        let sun = DirectLight {
            light: DWorldLight {
                emit_type: EMIT_SKYLIGHT,
                normal: [0.0, 0.0, -1.0], // sun shining straight down
                intensity: [200.0; 3],
                ..Default::default()
            },
            pvs: vec![0xff],
            facenum: -1,
            caps: LightCaps::CAST_SHADOWS | LightCaps::IGNORE_PVS,
            inc_id: -1,
        };
        let (dot, target) =
            eval_light_scalar(&sun, &[0.0, 0.0, 0.0], &[0.0, 0.0, 1.0]).unwrap();
        assert!((dot - 1.0).abs() < 1e-5);
        // Target is far along the direction toward the sun
        assert!(target[2] > 10_000.0);
    }

    #[test]
    fn test_light_list_round_trip() {
        let lights = vec![
            point_light([1.0, 2.0, 3.0], 300.0),
            DirectLight {
                light: DWorldLight {
                    emit_type: EMIT_SKYLIGHT,
                    normal: [0.0, 0.0, -1.0],
                    intensity: [100.0; 3],
                    ..Default::default()
                },
                pvs: vec![0xff, 0x0f],
                facenum: -1,
                caps: LightCaps::CAST_SHADOWS | LightCaps::IGNORE_PVS,
                inc_id: 5,
            },
        ];
        let blob = serialize_light_list(&lights);
        let back = deserialize_light_list(&blob).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].light, lights[0].light);
        assert_eq!(back[1].pvs, lights[1].pvs);
        assert_eq!(back[1].caps, lights[1].caps);
        assert_eq!(back[1].inc_id, 5);
    }

    #[test]
    fn test_light_color_keys() {
        let ents =
            parse_entities("{ \"_light\" \"255 128 64 400\" }").unwrap();
        let c = light_color(&ents[0], 1.0);
        // Scaled so the max component equals the intensity
        assert!((c[0] - 400.0).abs() < 1.0);
        assert!(c[1] < c[0] && c[2] < c[1]);
    }
}
