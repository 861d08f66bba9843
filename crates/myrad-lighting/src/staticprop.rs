// staticprop.rs — static prop vertex and texel lighting
//
// Props reuse the point gatherer: direct plus indirect at each vertex
// (or unwrapped texel), with the prop's own occluder excluded when it
// is flagged to skip self-shadowing. Results are packed as side files
// into the map's pak lump.

use myrad_common::checksum::crc_block;
use myrad_common::mathlib::{vector_add, Vec3};
use myrad_common::msgbuf::{
    msg_read_data, msg_read_long, msg_read_string, msg_write_data, msg_write_long,
    msg_write_string, SizeBuf,
};
use myrad_common::trace::TraceContext;

use crate::context::RadSettings;
use crate::gather::{
    compute_direct_lighting_at_point, compute_indirect_lighting_at_point,
    repair_embedded_point, IndirectSurfaces,
};
use crate::lights::DirectLight;

/// HardwareVerts file version tag.
pub const VHV_VERSION: i32 = 2;
/// HardwareTexels file version tag.
pub const PPL_VERSION: i32 = 1;

/// Per-texel lighting request: the model's UV unwrap sampled into
/// world positions and normals.
#[derive(Debug, Clone)]
pub struct TexelMapping {
    pub width: usize,
    pub height: usize,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

/// One prop instance to light.
#[derive(Debug, Clone)]
pub struct StaticPropInput {
    pub prop_id: i32,
    pub origin: Vec3,
    /// World-space vertex positions and normals
    pub verts: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    /// Exclude the prop's own occluder from its lighting rays
    pub skip_self_shadow: bool,
    pub lighting_origin: Option<Vec3>,
    pub texels: Option<TexelMapping>,
}

/// Lit output for one prop, ready for the file writers.
#[derive(Debug, Clone, Default)]
pub struct PropLighting {
    pub vertex_colors: Vec<Vec3>,
    pub texel_colors: Option<(usize, usize, Vec<Vec3>)>,
}

fn light_one_point(
    trace: &TraceContext,
    lights: &[DirectLight],
    surfaces: &IndirectSurfaces,
    settings: &RadSettings,
    pos: &Vec3,
    normal: &Vec3,
    toward: &Vec3,
    lighting_origin: Option<Vec3>,
    skip_prop: i32,
) -> Vec3 {
    // A vertex buried in solid gets the repair crawl; hopeless points
    // stay black rather than killing the run.
    let Some(pos) = repair_embedded_point(trace, pos, toward, lighting_origin) else {
        return [0.0, 0.0, 0.0];
    };
    let direct =
        compute_direct_lighting_at_point(trace, lights, &pos, normal, skip_prop, settings);
    let indirect = compute_indirect_lighting_at_point(
        trace, surfaces, &pos, normal, skip_prop, settings,
    );
    vector_add(&direct, &indirect)
}

/// Light every vertex (and texel, when mapped) of one prop.
pub fn light_static_prop(
    trace: &TraceContext,
    lights: &[DirectLight],
    surfaces: &IndirectSurfaces,
    settings: &RadSettings,
    prop: &StaticPropInput,
) -> PropLighting {
    let skip = if prop.skip_self_shadow {
        prop.prop_id
    } else {
        -1
    };

    let vertex_colors = prop
        .verts
        .iter()
        .zip(&prop.normals)
        .map(|(v, n)| {
            light_one_point(
                trace,
                lights,
                surfaces,
                settings,
                v,
                n,
                &prop.origin,
                prop.lighting_origin,
                skip,
            )
        })
        .collect();

    let texel_colors = prop.texels.as_ref().map(|tm| {
        let colors = tm
            .positions
            .iter()
            .zip(&tm.normals)
            .map(|(p, n)| {
                light_one_point(
                    trace,
                    lights,
                    surfaces,
                    settings,
                    p,
                    n,
                    &prop.origin,
                    prop.lighting_origin,
                    skip,
                )
            })
            .collect();
        (tm.width, tm.height, colors)
    });

    PropLighting {
        vertex_colors,
        texel_colors,
    }
}

/// Pak entries for one prop's results: `sp_<N>.vhv` and, when texel
/// lighting was requested, `texelslighting_<N>.ppl`.
pub fn prop_pak_entries(prop_index: usize, lit: &PropLighting) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    if !lit.vertex_colors.is_empty() {
        out.push((
            format!("sp_{}.vhv", prop_index),
            write_vhv(&lit.vertex_colors),
        ));
    }
    if let Some((w, h, colors)) = &lit.texel_colors {
        out.push((
            format!("texelslighting_{}.ppl", prop_index),
            write_ppl(*w, *h, colors),
        ));
    }
    out
}

// ============================================================
// File writers
// ============================================================

fn color_to_bytes(c: &Vec3) -> [u8; 4] {
    [
        c[0].clamp(0.0, 255.0) as u8,
        c[1].clamp(0.0, 255.0) as u8,
        c[2].clamp(0.0, 255.0) as u8,
        255,
    ]
}

/// HardwareVerts: version, payload checksum, vertex count, then RGBA
/// per vertex.
pub fn write_vhv(colors: &[Vec3]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(colors.len() * 4);
    for c in colors {
        payload.extend_from_slice(&color_to_bytes(c));
    }
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(&VHV_VERSION.to_le_bytes());
    out.extend_from_slice(&crc_block(&payload).to_le_bytes());
    out.extend_from_slice(&(colors.len() as i32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// HardwareTexels: version, checksum, dimensions, mip count, then RGBA
/// mips from largest to 1x1-floored smallest (box-filtered halvings).
pub fn write_ppl(width: usize, height: usize, colors: &[Vec3]) -> Vec<u8> {
    let mips = build_mip_chain(width, height, colors);

    let mut payload = Vec::new();
    for (_, _, mip) in &mips {
        for c in mip {
            payload.extend_from_slice(&color_to_bytes(c));
        }
    }

    let mut out = Vec::with_capacity(20 + payload.len());
    out.extend_from_slice(&PPL_VERSION.to_le_bytes());
    out.extend_from_slice(&crc_block(&payload).to_le_bytes());
    out.extend_from_slice(&(width as i32).to_le_bytes());
    out.extend_from_slice(&(height as i32).to_le_bytes());
    out.extend_from_slice(&(mips.len() as i32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn build_mip_chain(width: usize, height: usize, colors: &[Vec3]) -> Vec<(usize, usize, Vec<Vec3>)> {
    let mut mips = vec![(width, height, colors.to_vec())];
    loop {
        let (w, h, prev) = mips.last().unwrap();
        if *w == 1 && *h == 1 {
            break;
        }
        let nw = (*w / 2).max(1);
        let nh = (*h / 2).max(1);
        let mut next = Vec::with_capacity(nw * nh);
        for y in 0..nh {
            for x in 0..nw {
                // Box filter over the source quad, clamped at edges
                let mut acc = [0.0f32; 3];
                let mut n = 0;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let sx = (x * 2 + dx).min(*w - 1);
                        let sy = (y * 2 + dy).min(*h - 1);
                        let src = &prev[sy * *w + sx];
                        acc = vector_add(&acc, src);
                        n += 1;
                    }
                }
                next.push([acc[0] / n as f32, acc[1] / n as f32, acc[2] / n as f32]);
            }
        }
        mips.push((nw, nh, next));
    }
    mips
}

// ============================================================
// MPI serialization
// ============================================================

/// One prop work unit's result: its pak entries as a flat blob.
pub fn serialize_prop_result(entries: &[(String, Vec<u8>)], sb: &mut SizeBuf) {
    msg_write_long(sb, entries.len() as i32);
    for (name, data) in entries {
        msg_write_string(sb, name);
        msg_write_data(sb, data);
    }
}

pub fn deserialize_prop_result(sb: &mut SizeBuf) -> Result<Vec<(String, Vec<u8>)>, String> {
    let count = msg_read_long(sb);
    if count < 0 {
        return Err("truncated prop result".to_string());
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = msg_read_string(sb);
        let data = msg_read_data(sb).ok_or("truncated prop result payload")?;
        if name.is_empty() {
            return Err("prop result with empty name".to_string());
        }
        out.push((name, data));
    }
    Ok(out)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lights::LightCaps;
    use myrad_common::bspfile::{BspData, DLeaf, DModel, DNode, DWorldLight, EMIT_POINT};
    use myrad_common::mathlib::Plane;

    fn open_map() -> BspData {
        let mut bsp = BspData::default();
        bsp.planes
            .push(Plane::from_normal_dist([1.0, 0.0, 0.0], -10_000.0));
        bsp.nodes.push(DNode {
            planenum: 0,
            children: [-1, -1],
            ..Default::default()
        });
        bsp.leafs.push(DLeaf {
            contents: 0,
            cluster: 0,
            ..Default::default()
        });
        bsp.models.push(DModel {
            headnode: 0,
            ..Default::default()
        });
        bsp.num_clusters = 1;
        bsp
    }

    #[test]
    fn test_light_static_prop_vertices() {
        let bsp = open_map();
        let trace = TraceContext::new(&bsp);
        let lights = vec![DirectLight {
            light: DWorldLight {
                emit_type: EMIT_POINT,
                origin: [0.0, 0.0, 100.0],
                intensity: [300.0; 3],
                quadratic_attn: 1.0,
                ..Default::default()
            },
            pvs: vec![0xff],
            facenum: -1,
            caps: LightCaps::CAST_SHADOWS,
            inc_id: -1,
        }];
        let surfaces = IndirectSurfaces {
            avg_light: Vec::new(),
            reflectivity: Vec::new(),
        };
        let settings = RadSettings {
            fast: true,
            ..Default::default()
        };
        let prop = StaticPropInput {
            prop_id: 0,
            origin: [0.0, 0.0, 0.0],
            verts: vec![[0.0, 0.0, 10.0], [0.0, 0.0, -10.0]],
            // One vertex facing the light, one facing away
            normals: vec![[0.0, 0.0, 1.0], [0.0, 0.0, -1.0]],
            skip_self_shadow: false,
            lighting_origin: None,
            texels: None,
        };
        let lit = light_static_prop(&trace, &lights, &surfaces, &settings, &prop);
        assert_eq!(lit.vertex_colors.len(), 2);
        assert!(lit.vertex_colors[0][0] > 0.0, "upward vertex sees the light");
        assert_eq!(lit.vertex_colors[1], [0.0, 0.0, 0.0], "downward vertex dark");
        assert!(lit.texel_colors.is_none());
    }

    #[test]
    fn test_vhv_layout() {
        let colors = vec![[255.0, 0.0, 128.0], [10.0, 20.0, 30.0]];
        let vhv = write_vhv(&colors);
        assert_eq!(i32::from_le_bytes(vhv[0..4].try_into().unwrap()), VHV_VERSION);
        assert_eq!(i32::from_le_bytes(vhv[8..12].try_into().unwrap()), 2);
        // First vertex RGBA
        assert_eq!(&vhv[12..16], &[255, 0, 128, 255]);
        assert_eq!(vhv.len(), 12 + 8);
    }

    #[test]
    fn test_vhv_checksum_covers_payload() {
        let a = write_vhv(&[[1.0, 2.0, 3.0]]);
        let b = write_vhv(&[[1.0, 2.0, 4.0]]);
        assert_ne!(a[4..8], b[4..8]);
    }

    #[test]
    fn test_ppl_mip_chain() {
        let colors = vec![[100.0, 100.0, 100.0]; 16];
        let ppl = write_ppl(4, 4, &colors);
        assert_eq!(i32::from_le_bytes(ppl[0..4].try_into().unwrap()), PPL_VERSION);
        assert_eq!(i32::from_le_bytes(ppl[8..12].try_into().unwrap()), 4);
        assert_eq!(i32::from_le_bytes(ppl[12..16].try_into().unwrap()), 4);
        // 4x4 -> 2x2 -> 1x1 = 3 mips
        assert_eq!(i32::from_le_bytes(ppl[16..20].try_into().unwrap()), 3);
        // Payload: (16 + 4 + 1) texels * 4 bytes
        assert_eq!(ppl.len(), 20 + 21 * 4);
    }

    #[test]
    fn test_mip_chain_nonsquare() {
        let colors = vec![[50.0; 3]; 8];
        let mips = build_mip_chain(4, 2, &colors);
        assert_eq!(mips.len(), 3); // 4x2, 2x1, 1x1
        assert_eq!((mips[1].0, mips[1].1), (2, 1));
        assert_eq!((mips[2].0, mips[2].1), (1, 1));
        // Uniform input stays uniform through the box filter
        assert_eq!(mips[2].2[0], [50.0, 50.0, 50.0]);
    }

    #[test]
    fn test_prop_result_round_trip() {
        let entries = vec![
            ("sp_0.vhv".to_string(), vec![1u8, 2, 3]),
            ("texelslighting_0.ppl".to_string(), vec![4u8; 40]),
        ];
        let mut sb = SizeBuf::new(256);
        serialize_prop_result(&entries, &mut sb);
        let mut rd = SizeBuf::from_bytes(sb.as_slice());
        let back = deserialize_prop_result(&mut rd).unwrap();
        assert_eq!(entries, back);
    }
}
