// facelight.rs — per-face sample building, direct pass, lump export
//
// Each lightable face gets a regular luxel grid derived from its
// texture projection. Samples are gathered per light, splatted through
// the radial filter, then normalized into per-style lightmaps that the
// export step packs into the lighting lump.

use myrad_common::bspfile::{
    vec_to_color_rgb_exp32, BspData, EMIT_SKYAMBIENT, MAXLIGHTMAPS, MAX_MAP_LIGHTING,
    SURF_BUMPLIGHT, SURF_NODRAW, SURF_SKY, SURF_WARP,
};
use myrad_common::console::{fatal_error, warn_once};
use myrad_common::mathlib::{
    cross_product, dot_product, vector_add, vector_ma, vector_normalize, vector_scale, Vec3,
};
use myrad_common::trace::TraceContext;

use crate::context::RadSettings;
use crate::gather::{direct_light_scalar, repair_embedded_point, sky_ambient_scalar};
use crate::incremental::Incremental;
use crate::lightval::{LightChannels, BUMP_BASIS, NUM_BUMP_VECTS};
use crate::lights::DirectLight;
use crate::patch::PatchStore;
use crate::radial::Radial;

/// World units per luxel.
pub const TEXTURE_STEP: f32 = 16.0;
/// Luxels per face side, hard bound from the engine's block allocator.
pub const MAX_LIGHTMAP_DIM: usize = 33;

// ============================================================
// Face projection info
// ============================================================

/// Texture-space projection of one face: luxel extents plus the
/// transforms between world and lightmap coordinates.
#[derive(Debug, Clone)]
pub struct FaceInfo {
    pub facenum: usize,
    pub normal: Vec3,
    pub texmins: [i32; 2],
    /// Luxel grid dimensions (texsize + 1 in each axis)
    pub width: usize,
    pub height: usize,
    pub textoworld: [Vec3; 2],
    pub texorg: Vec3,
    pub bumped: bool,
    /// World-space bump basis normals (index 0 is the face normal)
    pub bump_normals: [Vec3; NUM_BUMP_VECTS + 1],
}

/// Faces with these flags carry no lightmap at all.
pub fn face_is_lightmapped(bsp: &BspData, facenum: usize) -> bool {
    let ti = &bsp.texinfo[bsp.faces[facenum].texinfo as usize];
    ti.flags & (SURF_WARP | SURF_SKY | SURF_NODRAW) == 0
}

/// Compute the face's luxel extents and world transforms. Fails on
/// faces whose lightmap would exceed the engine's block size.
pub fn calc_face_info(bsp: &BspData, facenum: usize) -> Result<FaceInfo, String> {
    let face = &bsp.faces[facenum];
    let ti = &bsp.texinfo[face.texinfo as usize];
    let plane = bsp.face_plane(face);
    let winding = bsp.face_winding(face);

    // Texture-space bounds of the winding
    let mut mins = [f32::MAX; 2];
    let mut maxs = [f32::MIN; 2];
    for p in &winding.points {
        for j in 0..2 {
            let val = dot_product(p, &[ti.vecs[j][0], ti.vecs[j][1], ti.vecs[j][2]])
                + ti.vecs[j][3];
            mins[j] = mins[j].min(val);
            maxs[j] = maxs[j].max(val);
        }
    }

    let mut texmins = [0i32; 2];
    let mut texsize = [0i32; 2];
    for j in 0..2 {
        texmins[j] = (mins[j] / TEXTURE_STEP).floor() as i32;
        texsize[j] = (maxs[j] / TEXTURE_STEP).ceil() as i32 - texmins[j];
    }
    let width = (texsize[0] + 1) as usize;
    let height = (texsize[1] + 1) as usize;
    if width > MAX_LIGHTMAP_DIM || height > MAX_LIGHTMAP_DIM {
        return Err(format!(
            "face {} lightmap {}x{} exceeds {} luxels per side",
            facenum, width, height, MAX_LIGHTMAP_DIM
        ));
    }

    // Invert the projection: build textoworld so that stepping one
    // texel in s or t moves the right world distance along the face.
    let svec = [ti.vecs[0][0], ti.vecs[0][1], ti.vecs[0][2]];
    let tvec = [ti.vecs[1][0], ti.vecs[1][1], ti.vecs[1][2]];
    let mut texnormal = cross_product(&tvec, &svec);
    vector_normalize(&mut texnormal);
    let mut distscale = dot_product(&texnormal, &plane.normal);
    if distscale == 0.0 {
        return Err(format!("face {} has a degenerate texture projection", facenum));
    }
    if distscale < 0.0 {
        distscale = -distscale;
        texnormal = myrad_common::mathlib::vector_negate(&texnormal);
    }
    let distscale = 1.0 / distscale;

    let mut textoworld = [[0.0f32; 3]; 2];
    for (i, vec) in [svec, tvec].iter().enumerate() {
        let len_sq = dot_product(vec, vec);
        let dist = dot_product(vec, &plane.normal) * distscale;
        let projected = vector_ma(vec, -dist, &texnormal);
        textoworld[i] = vector_scale(&projected, 1.0 / len_sq);
    }

    // Texture-space origin carried back onto the face plane, held one
    // unit off the surface.
    let mut texorg = [0.0f32; 3];
    for i in 0..3 {
        texorg[i] = -ti.vecs[0][3] * textoworld[0][i] - ti.vecs[1][3] * textoworld[1][i];
    }
    let dist = (dot_product(&texorg, &plane.normal) - plane.dist - 1.0) * distscale;
    let texorg = vector_ma(&texorg, -dist, &texnormal);

    let bumped = ti.flags & SURF_BUMPLIGHT != 0;
    let mut bump_normals = [[0.0f32; 3]; NUM_BUMP_VECTS + 1];
    bump_normals[0] = plane.normal;
    if bumped {
        // Rotate the tangent-space basis into world space
        let mut sdir = svec;
        vector_normalize(&mut sdir);
        let mut tdir = tvec;
        vector_normalize(&mut tdir);
        for (i, basis) in BUMP_BASIS.iter().enumerate() {
            let mut n = vector_scale(&sdir, basis[0]);
            n = vector_add(&n, &vector_scale(&tdir, basis[1]));
            n = vector_add(&n, &vector_scale(&plane.normal, basis[2]));
            vector_normalize(&mut n);
            bump_normals[i + 1] = n;
        }
    }

    Ok(FaceInfo {
        facenum,
        normal: plane.normal,
        texmins,
        width,
        height,
        textoworld,
        texorg,
        bumped,
        bump_normals,
    })
}

impl FaceInfo {
    /// World position of a luxel-grid coordinate.
    pub fn luxel_to_world(&self, s: f32, t: f32) -> Vec3 {
        let us = (s + self.texmins[0] as f32) * TEXTURE_STEP;
        let ut = (t + self.texmins[1] as f32) * TEXTURE_STEP;
        let mut out = self.texorg;
        out = vector_ma(&out, us, &self.textoworld[0]);
        vector_ma(&out, ut, &self.textoworld[1])
    }

    pub fn world_to_luxel(&self, pos: &Vec3, ti_vecs: &[[f32; 4]; 2]) -> [f32; 2] {
        let mut out = [0.0f32; 2];
        for j in 0..2 {
            let val = dot_product(pos, &[ti_vecs[j][0], ti_vecs[j][1], ti_vecs[j][2]])
                + ti_vecs[j][3];
            out[j] = val / TEXTURE_STEP - self.texmins[j] as f32;
        }
        out
    }

    pub fn channel_count(&self) -> usize {
        if self.bumped {
            NUM_BUMP_VECTS + 1
        } else {
            1
        }
    }
}

// ============================================================
// Samples
// ============================================================

/// One lightmap texel's gather point.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub pos: Vec3,
    /// Center in luxel-grid coordinates
    pub luxel: [f32; 2],
    pub mins: [f32; 2],
    pub maxs: [f32; 2],
    /// False when the point is irreparably inside solid
    pub valid: bool,
}

/// Per-face lighting under construction and its final lightmaps.
#[derive(Debug, Clone, Default)]
pub struct FaceLight {
    pub width: usize,
    pub height: usize,
    pub samples: Vec<Sample>,
    pub bumped: bool,
    /// Style bound to each lightmap slot; 255 = free
    pub styles: [u8; MAXLIGHTMAPS],
    /// One lightmap per used style slot, luxel-major
    pub maps: [Option<Vec<LightChannels>>; MAXLIGHTMAPS],
    /// Average style-0 flat color, fed to the indirect pass
    pub avg_light: Vec3,
}

impl FaceLight {
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Slot for a style, allocating the next free one if needed.
    /// Returns None when all MAXLIGHTMAPS slots are taken.
    pub fn style_slot(&mut self, style: u8, channels: usize) -> Option<usize> {
        for (i, s) in self.styles.iter().enumerate() {
            if *s == style {
                return Some(i);
            }
        }
        for i in 0..MAXLIGHTMAPS {
            if self.styles[i] == 255 {
                self.styles[i] = style;
                let n = self.width * self.height;
                self.maps[i] = Some(vec![LightChannels::with_count(channels); n]);
                return Some(i);
            }
        }
        None
    }
}

/// Lay out the face's samples: one per luxel, pulled back inside the
/// winding and repaired out of solid where needed.
pub fn build_samples(bsp: &BspData, trace: &TraceContext, info: &FaceInfo) -> Vec<Sample> {
    let face = &bsp.faces[info.facenum];
    let winding = bsp.face_winding(face);
    let center = winding.center();
    let face_center = vector_ma(&center, 2.0, &info.normal);
    // Containment tests follow the winding's own vertex order, which
    // surfedges do not guarantee agrees with the face plane
    let wnormal = if winding.num_points() >= 3 {
        winding.plane().normal
    } else {
        info.normal
    };
    // Edge luxels hang past the face; gather from just inside instead
    let inner = winding.shrink_toward_center(TEXTURE_STEP * 0.25);
    let mut samples = Vec::with_capacity(info.width * info.height);

    for t in 0..info.height {
        for s in 0..info.width {
            let sc = s as f32 + 0.5;
            let tc = t as f32 + 0.5;
            let mut world = info.luxel_to_world(sc, tc);
            for _ in 0..8 {
                if inner.contains_point(&world, &wnormal, 0.01) {
                    break;
                }
                world = myrad_common::mathlib::vector_lerp(&world, &center, 0.2);
            }
            // Lift the gather point off the plane
            let lifted = vector_ma(&world, 1.0, &info.normal);

            let mut sample = Sample {
                pos: lifted,
                luxel: [sc, tc],
                mins: [s as f32, t as f32],
                maxs: [s as f32 + 1.0, t as f32 + 1.0],
                valid: true,
            };
            match repair_embedded_point(trace, &lifted, &face_center, None) {
                Some(p) => sample.pos = p,
                None => {
                    warn_once(
                        &format!("face-{}-solid-samples", info.facenum),
                        &format!(
                            "face {} has samples embedded in solid near ({:.0} {:.0} {:.0})",
                            info.facenum, world[0], world[1], world[2]
                        ),
                    );
                    sample.valid = false;
                }
            }
            samples.push(sample);
        }
    }
    samples
}

// ============================================================
// Direct pass
// ============================================================

/// Gather all direct light for one face: per light, per sample, with
/// radial filtering into the face's style lightmaps. Incremental dots
/// are recorded per light when a cache is attached.
pub fn build_facelight(
    bsp: &BspData,
    trace: &TraceContext,
    lights: &[DirectLight],
    settings: &RadSettings,
    incremental: Option<&Incremental>,
    facenum: usize,
) -> FaceLight {
    let mut fl = FaceLight::default();
    if !face_is_lightmapped(bsp, facenum) {
        return fl;
    }
    let info = match calc_face_info(bsp, facenum) {
        Ok(info) => info,
        Err(e) => {
            warn_once(&format!("face-info-{}", facenum), &e);
            return fl;
        }
    };

    fl.width = info.width;
    fl.height = info.height;
    fl.bumped = info.bumped;
    fl.styles = [255; MAXLIGHTMAPS];
    fl.samples = build_samples(bsp, trace, &info);

    let channels = info.channel_count();
    let num_samples = fl.samples.len();
    let mut radials: [Option<Radial>; MAXLIGHTMAPS] = [None, None, None, None];

    let mut scalars = vec![0.0f32; num_samples * channels];
    for dl in lights {
        // Per-sample, per-channel scalars for this light
        scalars.iter_mut().for_each(|v| *v = 0.0);
        let mut any = false;

        for (si, sample) in fl.samples.iter().enumerate() {
            if !sample.valid {
                continue;
            }
            let cluster = trace.point_cluster(&sample.pos);
            for c in 0..channels {
                let normal = if c == 0 {
                    info.normal
                } else {
                    info.bump_normals[c]
                };
                let scalar = if dl.light.emit_type == EMIT_SKYAMBIENT {
                    sky_ambient_scalar(trace, &sample.pos, &normal, -1, settings)
                } else {
                    direct_light_scalar(trace, dl, &sample.pos, &normal, cluster, -1)
                };
                if scalar > 0.0 {
                    scalars[si * channels + c] = scalar;
                    any = true;
                }
            }
        }
        if !any {
            continue;
        }

        // Record color-deferred dots for the incremental cache
        if let Some(inc) = incremental {
            if dl.inc_id >= 0 {
                let dots: Vec<f32> =
                    (0..num_samples).map(|si| scalars[si * channels]).collect();
                inc.finish_face(dl.inc_id, facenum as i32, &dots);
            }
        }

        let style = dl.light.style.clamp(0, 255) as u8;
        let Some(slot) = fl.style_slot(style, channels) else {
            warn_once(
                &format!("face-styles-{}", facenum),
                &format!("face {} exceeds {} light styles", facenum, MAXLIGHTMAPS),
            );
            continue;
        };
        let radial = radials[slot]
            .get_or_insert_with(|| Radial::new(info.width, info.height, info.bumped));

        // Every valid sample splats, lit or not, so cell weight tracks
        // sample coverage: a weightless cell means no sample reaches
        // it, which is a geometry defect, not shadow.
        for (si, sample) in fl.samples.iter().enumerate() {
            if !sample.valid {
                continue;
            }
            let mut value = LightChannels::with_count(channels);
            for c in 0..channels {
                let scalar = scalars[si * channels + c];
                if scalar > 0.0 {
                    value.vals[c] = vector_scale(&dl.light.intensity, scalar);
                }
            }
            radial.add_direct(sample.mins, sample.maxs, sample.luxel, &value);
        }
    }

    // Normalize each style's radial grid into its lightmap. Cells no
    // sample covered come back as the hot-pink sentinel so defects are
    // visible in-game.
    for slot in 0..MAXLIGHTMAPS {
        let Some(radial) = &radials[slot] else {
            continue;
        };
        let map = fl.maps[slot].as_mut().expect("slot allocated with radial");
        for t in 0..info.height {
            for s in 0..info.width {
                map[t * info.width + s] = radial.sample_or_sentinel(s, t);
            }
        }
    }

    fl.avg_light = average_flat_light(&fl);
    fl
}

fn average_flat_light(fl: &FaceLight) -> Vec3 {
    let Some(map) = fl
        .styles
        .iter()
        .position(|&s| s == 0)
        .and_then(|slot| fl.maps[slot].as_ref())
    else {
        return [0.0; 3];
    };
    let mut avg = [0.0f32; 3];
    for v in map {
        avg = vector_add(&avg, &v.flat_value());
    }
    if !map.is_empty() {
        avg = vector_scale(&avg, 1.0 / map.len() as f32);
    }
    avg
}

// ============================================================
// Bounce application
// ============================================================

/// Splat the bounced light gathered by a face's patches back into its
/// style-0 lightmap through the radial filter.
pub fn apply_bounced_light(
    bsp: &BspData,
    patches: &PatchStore,
    facenum: usize,
    fl: &mut FaceLight,
) {
    if fl.width == 0 || fl.height == 0 {
        return;
    }
    let Ok(info) = calc_face_info(bsp, facenum) else {
        return;
    };
    let ti = &bsp.texinfo[bsp.faces[facenum].texinfo as usize];
    let channels = info.channel_count();

    let mut radial = Radial::new(fl.width, fl.height, fl.bumped);
    let mut any = false;
    for h in patches.face_patches(facenum) {
        let patch = patches.get(h);
        if !patch.is_leaf() || patch.totallight.max_component() <= 0.0 {
            continue;
        }
        let luxel = info.world_to_luxel(&patch.origin, &ti.vecs);
        let mut value = LightChannels::with_count(channels);
        for c in 0..channels {
            value.vals[c] = patch.totallight.vals[c.min(patch.totallight.count - 1)];
        }
        radial.add_bounced(luxel, &value);
        any = true;
    }
    if !any {
        return;
    }

    let Some(slot) = fl.style_slot(0, channels) else {
        return;
    };
    let map = fl.maps[slot].as_mut().expect("slot allocated");
    for t in 0..fl.height {
        for s in 0..fl.width {
            if let Some(v) = radial.sample(s, t) {
                let mut bounced = v;
                bounced.count = map[t * fl.width + s].count;
                map[t * fl.width + s].add_scaled(&bounced, 1.0);
            }
        }
    }
    fl.avg_light = average_flat_light(fl);
}

// ============================================================
// Export
// ============================================================

/// Pack every face's lightmaps into the lighting lump, assigning
/// lightofs and the style table on each face.
pub fn export_lighting(bsp: &mut BspData, facelights: &[FaceLight]) {
    let mut lightdata = Vec::new();

    for (facenum, fl) in facelights.iter().enumerate() {
        let face = &mut bsp.faces[facenum];
        if fl.width == 0 || fl.maps.iter().all(|m| m.is_none()) {
            face.lightofs = -1;
            face.styles = [255; MAXLIGHTMAPS];
            continue;
        }

        face.lightofs = (lightdata.len() * 4) as i32;
        face.styles = fl.styles;

        for slot in 0..MAXLIGHTMAPS {
            let Some(map) = &fl.maps[slot] else {
                continue;
            };
            // Channel-major: the flat map first, then each bump basis
            let channels = if fl.bumped { NUM_BUMP_VECTS + 1 } else { 1 };
            for c in 0..channels {
                for v in map {
                    lightdata.push(vec_to_color_rgb_exp32(&v.vals[c]));
                }
            }
        }
    }

    if lightdata.len() * 4 > MAX_MAP_LIGHTING {
        fatal_error(&format!(
            "lighting data {} exceeds MAX_MAP_LIGHTING",
            lightdata.len() * 4
        ));
    }
    bsp.lightdata = lightdata;
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightval::MAX_LIGHT_CHANNELS;

    #[test]
    fn test_style_slot_allocation() {
        let mut fl = FaceLight {
            width: 2,
            height: 2,
            styles: [255; MAXLIGHTMAPS],
            ..Default::default()
        };
        assert_eq!(fl.style_slot(0, 1), Some(0));
        assert_eq!(fl.style_slot(3, 1), Some(1));
        // Same style reuses its slot
        assert_eq!(fl.style_slot(0, 1), Some(0));
        assert_eq!(fl.style_slot(7, 1), Some(2));
        assert_eq!(fl.style_slot(9, 1), Some(3));
        assert_eq!(fl.style_slot(11, 1), None);
    }

    #[test]
    fn test_export_assigns_offsets() {
        let mut bsp = BspData::default();
        bsp.faces.push(Default::default());
        bsp.faces.push(Default::default());

        let mut fl0 = FaceLight {
            width: 2,
            height: 1,
            styles: [255; MAXLIGHTMAPS],
            ..Default::default()
        };
        let slot = fl0.style_slot(0, 1).unwrap();
        fl0.maps[slot].as_mut().unwrap()[0].vals[0] = [1.0, 0.5, 0.25];

        let mut fl1 = FaceLight {
            width: 1,
            height: 1,
            styles: [255; MAXLIGHTMAPS],
            ..Default::default()
        };
        fl1.style_slot(0, 1);

        export_lighting(&mut bsp, &[fl0, fl1]);
        assert_eq!(bsp.faces[0].lightofs, 0);
        assert_eq!(bsp.faces[0].styles[0], 0);
        // Face 1 starts after face 0's two luxels
        assert_eq!(bsp.faces[1].lightofs, 8);
        assert_eq!(bsp.lightdata.len(), 3);
    }

    #[test]
    fn test_average_flat_light() {
        let mut fl = FaceLight {
            width: 2,
            height: 1,
            styles: [255; MAXLIGHTMAPS],
            ..Default::default()
        };
        let slot = fl.style_slot(0, 1).unwrap();
        let map = fl.maps[slot].as_mut().unwrap();
        map[0].vals[0] = [2.0, 0.0, 0.0];
        map[1].vals[0] = [4.0, 0.0, 0.0];
        fl.avg_light = average_flat_light(&fl);
        assert_eq!(fl.avg_light, [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bumped_channel_count() {
        let fl = LightChannels::bumped();
        assert_eq!(fl.count, MAX_LIGHT_CHANNELS);
    }
}
