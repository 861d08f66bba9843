// incremental.rs — per-light, per-face lighting cache across runs
//
// Each light's contribution to each face is stored color-deferred (dot
// values only), so an unchanged light costs nothing on the next run:
// its cached dots are recomposited with its color instead of re-traced.
// Faces are recomputed only when a touching light is new, changed, or
// removed.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use myrad_common::bspfile::{BspData, DWorldLight, DWORLDLIGHT_SIZE};
use myrad_common::checksum::crc_block;
use myrad_common::compression::{compress_data, decompress_data};
use myrad_common::console::qdprintf;
use myrad_common::mathlib::vector_scale;
use myrad_common::msgbuf::{
    msg_read_byte, msg_read_long, msg_write_byte, msg_write_long, SizeBuf,
};
use myrad_common::trace::cluster_visible;

use crate::lights::DirectLight;

pub const INCREMENTALFILE_VERSION: i32 = 31241;

// Light-compare epsilons. Tuned for entity-editor roundoff: a light
// nudged less than this is the same light.
const ORIGIN_EPS: f32 = 0.1;
const NORMAL_EPS: f32 = 1e-3;
const INTENSITY_EPS: f32 = 0.1;
const ATTN_EPS: f32 = 1e-4;
const CONE_EPS: f32 = 1e-4;

/// Dot scalars are stored in 8.8 fixed point: enough headroom for
/// close-range falloff values, 1/256 resolution near zero.
const DOT_QUANT: f32 = 256.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightState {
    New,
    MatchedUnchanged,
    MatchedChanged,
    Removed,
}

/// One light's cached contribution to one face.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedFace {
    pub sample_count: u32,
    /// deflate(RLE(u16 dots))
    pub data: Vec<u8>,
}

struct IncEntry {
    light: DWorldLight,
    state: LightState,
    /// Guards the first-touch insert race when two threads finish
    /// different samples of the same (light, face) pair.
    faces: Mutex<HashMap<i32, CompressedFace>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrepareStats {
    pub matched: usize,
    pub fresh: usize,
    pub removed: usize,
}

pub struct Incremental {
    entries: Vec<IncEntry>,
    removed: Vec<IncEntry>,
    /// Per-face lightmap dims from the loaded file; any mismatch with
    /// the current map invalidates the whole cache.
    loaded_dims: Vec<(u8, u8)>,
    loaded_lights: Vec<(DWorldLight, HashMap<i32, CompressedFace>)>,
}

impl Default for Incremental {
    fn default() -> Self {
        Self::new()
    }
}

impl Incremental {
    pub fn new() -> Incremental {
        Incremental {
            entries: Vec::new(),
            removed: Vec::new(),
            loaded_dims: Vec::new(),
            loaded_lights: Vec::new(),
        }
    }

    // ========================================================
    // Light matching
    // ========================================================

    /// Field-by-field comparison with fixed epsilons. Exact equality is
    /// wrong here: entity compilers jitter float text round-trips.
    fn compare_lights(a: &DWorldLight, b: &DWorldLight) -> bool {
        if a.emit_type != b.emit_type || a.style != b.style || a.flags != b.flags {
            return false;
        }
        for i in 0..3 {
            if (a.origin[i] - b.origin[i]).abs() > ORIGIN_EPS {
                return false;
            }
            if (a.normal[i] - b.normal[i]).abs() > NORMAL_EPS {
                return false;
            }
            if (a.intensity[i] - b.intensity[i]).abs() > INTENSITY_EPS {
                return false;
            }
        }
        (a.constant_attn - b.constant_attn).abs() <= ATTN_EPS
            && (a.linear_attn - b.linear_attn).abs() <= ATTN_EPS
            && (a.quadratic_attn - b.quadratic_attn).abs() <= ATTN_EPS
            && (a.stopdot - b.stopdot).abs() <= CONE_EPS
            && (a.stopdot2 - b.stopdot2).abs() <= CONE_EPS
            && (a.exponent - b.exponent).abs() <= CONE_EPS
            && (a.radius - b.radius).abs() <= CONE_EPS
    }

    /// Match the active light list against the loaded cache. Matched
    /// and unchanged lights are pulled OUT of `activelights`; their
    /// cached data stands in for this run. Unmatched loaded lights
    /// become Removed. Every remaining active light gets a fresh
    /// incremental id.
    pub fn prepare_for_lighting(
        &mut self,
        activelights: &mut Vec<DirectLight>,
        current_dims: &[(u8, u8)],
    ) -> PrepareStats {
        let mut stats = PrepareStats::default();

        if !self.loaded_dims.is_empty() && self.loaded_dims != current_dims {
            qdprintf("lightmap layout changed, discarding incremental cache\n");
            self.loaded_lights.clear();
        }
        self.loaded_dims = current_dims.to_vec();

        let mut loaded: Vec<Option<(DWorldLight, HashMap<i32, CompressedFace>)>> =
            std::mem::take(&mut self.loaded_lights)
                .into_iter()
                .map(Some)
                .collect();

        let mut still_active = Vec::new();
        for mut dl in activelights.drain(..) {
            let found = loaded.iter_mut().find(|slot| {
                slot.as_ref()
                    .is_some_and(|(light, _)| Self::compare_lights(light, &dl.light))
            });
            match found {
                Some(slot) => {
                    // Unchanged: contributes nothing new this run
                    let (light, faces) = slot.take().unwrap();
                    stats.matched += 1;
                    self.entries.push(IncEntry {
                        light,
                        state: LightState::MatchedUnchanged,
                        faces: Mutex::new(faces),
                    });
                }
                None => {
                    stats.fresh += 1;
                    dl.inc_id = self.entries.len() as i32;
                    self.entries.push(IncEntry {
                        light: dl.light,
                        state: LightState::New,
                        faces: Mutex::new(HashMap::new()),
                    });
                    still_active.push(dl);
                }
            }
        }
        *activelights = still_active;

        for slot in loaded.into_iter().flatten() {
            let (light, faces) = slot;
            stats.removed += 1;
            // A leftover record whose position still hosts an active
            // light is that light, changed; either way its old faces
            // go dirty and the active light recomputes them.
            let changed = activelights.iter().any(|dl| {
                dl.light.emit_type == light.emit_type
                    && (0..3).all(|i| (dl.light.origin[i] - light.origin[i]).abs() <= ORIGIN_EPS)
            });
            self.removed.push(IncEntry {
                light,
                state: if changed {
                    LightState::MatchedChanged
                } else {
                    LightState::Removed
                },
                faces: Mutex::new(faces),
            });
        }

        let changed = self
            .removed
            .iter()
            .filter(|e| e.state == LightState::MatchedChanged)
            .count();
        qdprintf(&format!(
            "incremental: {} matched, {} new, {} removed ({} changed)\n",
            stats.matched, stats.fresh, stats.removed, changed
        ));
        stats
    }

    // ========================================================
    // Dirty-face bookkeeping
    // ========================================================

    /// Faces needing recomputation this run: everything in the PVS
    /// domain of a still-active (new or changed) light, plus every face
    /// a removed light ever touched.
    pub fn dirty_faces(&self, bsp: &BspData, activelights: &[DirectLight]) -> Vec<bool> {
        let mut dirty = vec![false; bsp.faces.len()];

        for dl in activelights {
            use crate::lights::LightCaps;
            if dl.caps.contains(LightCaps::IGNORE_PVS) {
                dirty.iter_mut().for_each(|d| *d = true);
                break;
            }
            for leaf in &bsp.leafs {
                if leaf.cluster < 0 || !cluster_visible(&dl.pvs, leaf.cluster as i32) {
                    continue;
                }
                for i in 0..leaf.numleaffaces as usize {
                    let face = bsp.leaffaces[leaf.firstleafface as usize + i] as usize;
                    dirty[face] = true;
                }
            }
        }

        for entry in &self.removed {
            for &face in entry.faces.lock().keys() {
                if (face as usize) < dirty.len() {
                    dirty[face as usize] = true;
                }
            }
        }
        dirty
    }

    // ========================================================
    // Gather-side recording
    // ========================================================

    /// Record one light's finished contribution to a face. Scalars are
    /// falloff * dot per sample, color deferred. A contribution that
    /// quantizes to all zeros is discarded outright.
    pub fn finish_face(&self, inc_id: i32, facenum: i32, scalars: &[f32]) {
        let entry = &self.entries[inc_id as usize];
        let quantized: Vec<u16> = scalars
            .iter()
            .map(|&s| (s * DOT_QUANT).round().clamp(0.0, 65535.0) as u16)
            .collect();
        if quantized.iter().all(|&q| q == 0) {
            return;
        }
        let rle = rle_encode_u16(&quantized);
        let data = match compress_data(&rle) {
            Ok(d) => d,
            Err(_) => return,
        };
        let face = CompressedFace {
            sample_count: scalars.len() as u32,
            data,
        };
        entry.faces.lock().insert(facenum, face);
    }

    // ========================================================
    // Recomposition
    // ========================================================

    /// Rebuild one face's flat lighting from every cached light that
    /// touched it: sum of intensity * stored scalar.
    pub fn composite_face(&self, facenum: i32) -> Option<Vec<[f32; 3]>> {
        let mut out: Option<Vec<[f32; 3]>> = None;
        for entry in &self.entries {
            let faces = entry.faces.lock();
            let Some(cf) = faces.get(&facenum) else {
                continue;
            };
            let Some(dots) = decompress_face(cf) else {
                continue;
            };
            let acc =
                out.get_or_insert_with(|| vec![[0.0; 3]; cf.sample_count as usize]);
            if acc.len() != dots.len() {
                continue;
            }
            for (a, &q) in acc.iter_mut().zip(&dots) {
                let scalar = q as f32 / DOT_QUANT;
                let add = vector_scale(&entry.light.intensity, scalar);
                a[0] += add[0];
                a[1] += add[1];
                a[2] += add[2];
            }
        }
        out
    }

    // ========================================================
    // Persistence
    // ========================================================

    pub fn load(&mut self, path: &Path) -> Result<(), String> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(_) => {
                log::info!("no incremental file at {}, starting fresh", path.display());
                return Ok(());
            }
        };
        if raw.len() < 8 {
            return Err("incremental file truncated".to_string());
        }
        let version = i32::from_le_bytes(raw[0..4].try_into().unwrap());
        if version != INCREMENTALFILE_VERSION {
            return Err(format!(
                "incremental file version {} (expected {})",
                version, INCREMENTALFILE_VERSION
            ));
        }
        let stored_crc = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let body = &raw[8..];
        if crc_block(body) != stored_crc {
            return Err("incremental file checksum mismatch".to_string());
        }

        let mut sb = SizeBuf::from_bytes(body);
        let face_count = msg_read_long(&mut sb);
        if face_count < 0 {
            return Err("incremental file truncated".to_string());
        }
        let mut dims = Vec::with_capacity(face_count as usize);
        for _ in 0..face_count {
            let w = msg_read_byte(&mut sb);
            let h = msg_read_byte(&mut sb);
            if w < 0 || h < 0 {
                return Err("incremental file truncated".to_string());
            }
            dims.push((w as u8, h as u8));
        }

        let light_count = msg_read_long(&mut sb);
        if light_count < 0 {
            return Err("incremental file truncated".to_string());
        }
        let mut lights = Vec::with_capacity(light_count as usize);
        for _ in 0..light_count {
            if sb.remaining() < DWORLDLIGHT_SIZE {
                return Err("incremental file truncated".to_string());
            }
            let light = DWorldLight::from_bytes(
                &sb.data[sb.readcount..sb.readcount + DWORLDLIGHT_SIZE],
            )
            .ok_or("bad light record")?;
            sb.readcount += DWORLDLIGHT_SIZE;

            let face_touch = msg_read_long(&mut sb);
            if face_touch < 0 {
                return Err("incremental file truncated".to_string());
            }
            let mut faces = HashMap::with_capacity(face_touch as usize);
            for _ in 0..face_touch {
                let facenum = msg_read_long(&mut sb);
                let sample_count = msg_read_long(&mut sb);
                let byte_len = msg_read_long(&mut sb);
                if facenum < 0 || sample_count < 0 || byte_len < 0 {
                    return Err("incremental file truncated".to_string());
                }
                let byte_len = byte_len as usize;
                if sb.remaining() < byte_len {
                    return Err("incremental file truncated".to_string());
                }
                let data = sb.data[sb.readcount..sb.readcount + byte_len].to_vec();
                sb.readcount += byte_len;
                faces.insert(
                    facenum,
                    CompressedFace {
                        sample_count: sample_count as u32,
                        data,
                    },
                );
            }
            lights.push((light, faces));
        }

        self.loaded_dims = dims;
        self.loaded_lights = lights;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        // Generous upper bound: headers plus all face payloads
        let mut payload = 16 + self.loaded_dims.len() * 2;
        for entry in &self.entries {
            payload += DWORLDLIGHT_SIZE + 4;
            for cf in entry.faces.lock().values() {
                payload += 12 + cf.data.len();
            }
        }
        let mut sb = SizeBuf::new(payload);

        msg_write_long(&mut sb, self.loaded_dims.len() as i32);
        for &(w, h) in &self.loaded_dims {
            msg_write_byte(&mut sb, w);
            msg_write_byte(&mut sb, h);
        }
        msg_write_long(&mut sb, self.entries.len() as i32);
        for entry in &self.entries {
            sb.write(&entry.light.to_bytes());
            let faces = entry.faces.lock();
            msg_write_long(&mut sb, faces.len() as i32);
            // Deterministic order keeps the file diffable
            let mut keys: Vec<i32> = faces.keys().copied().collect();
            keys.sort_unstable();
            for facenum in keys {
                let cf = &faces[&facenum];
                msg_write_long(&mut sb, facenum);
                msg_write_long(&mut sb, cf.sample_count as i32);
                msg_write_long(&mut sb, cf.data.len() as i32);
                sb.write(&cf.data);
            }
        }

        let body = sb.as_slice();
        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&INCREMENTALFILE_VERSION.to_le_bytes());
        out.extend_from_slice(&crc_block(body).to_le_bytes());
        out.extend_from_slice(body);
        fs::write(path, &out).map_err(|e| format!("writing {}: {}", path.display(), e))
    }
}

fn decompress_face(cf: &CompressedFace) -> Option<Vec<u16>> {
    let rle = decompress_data(&cf.data, cf.sample_count as usize * 8 + 64).ok()?;
    let dots = rle_decode_u16(&rle)?;
    if dots.len() != cf.sample_count as usize {
        return None;
    }
    Some(dots)
}

// ============================================================
// Run-length coding (u16 domain, lossless)
// ============================================================

/// (value, run) pairs, both u16 little-endian. Runs cap at 65535.
pub fn rle_encode_u16(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let v = values[i];
        let mut run = 1u32;
        while i + (run as usize) < values.len()
            && values[i + run as usize] == v
            && run < 65535
        {
            run += 1;
        }
        out.extend_from_slice(&v.to_le_bytes());
        out.extend_from_slice(&(run as u16).to_le_bytes());
        i += run as usize;
    }
    out
}

pub fn rle_decode_u16(data: &[u8]) -> Option<Vec<u16>> {
    if data.len() % 4 != 0 {
        return None;
    }
    let mut out = Vec::new();
    for chunk in data.chunks_exact(4) {
        let v = u16::from_le_bytes([chunk[0], chunk[1]]);
        let run = u16::from_le_bytes([chunk[2], chunk[3]]) as usize;
        if run == 0 {
            return None;
        }
        out.extend(std::iter::repeat(v).take(run));
    }
    Some(out)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lights::LightCaps;
    use myrad_common::bspfile::EMIT_POINT;

    fn test_light(x: f32, intensity: f32) -> DirectLight {
        DirectLight {
            light: DWorldLight {
                emit_type: EMIT_POINT,
                origin: [x, 0.0, 64.0],
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
    fn test_rle_round_trip_exact() {
        let cases: Vec<Vec<u16>> = vec![
            vec![],
            vec![5],
            vec![0, 0, 0, 0, 7, 7, 3],
            vec![1, 2, 3, 4, 5],
            vec![9; 70000], // run longer than a single u16 count
        ];
        for values in cases {
            let encoded = rle_encode_u16(&values);
            let decoded = rle_decode_u16(&encoded).unwrap();
            assert_eq!(values, decoded);
        }
    }

    #[test]
    fn test_finish_face_round_trip() {
        let mut inc = Incremental::new();
        let mut lights = vec![test_light(0.0, 300.0)];
        inc.prepare_for_lighting(&mut lights, &[(4, 4)]);
        assert_eq!(lights[0].inc_id, 0);

        let scalars = vec![0.5f32, 0.0, 0.25, 0.0];
        inc.finish_face(0, 3, &scalars);

        let composite = inc.composite_face(3).unwrap();
        assert!((composite[0][0] - 150.0).abs() < 0.5);
        assert_eq!(composite[1], [0.0, 0.0, 0.0]);
        assert!((composite[2][0] - 75.0).abs() < 0.5);
    }

    #[test]
    fn test_zero_contribution_discarded() {
        let mut inc = Incremental::new();
        let mut lights = vec![test_light(0.0, 300.0)];
        inc.prepare_for_lighting(&mut lights, &[(4, 4)]);
        inc.finish_face(0, 3, &[0.0, 0.0, 0.0]);
        assert!(inc.composite_face(3).is_none());
    }

    #[test]
    fn test_identical_rerun_matches_all_lights() {
        let dir = std::env::temp_dir().join("myrad_inc_test_rerun");
        let _ = fs::remove_file(&dir);

        // First run: two lights, both new
        let mut inc = Incremental::new();
        let mut lights = vec![test_light(0.0, 300.0), test_light(100.0, 200.0)];
        let stats = inc.prepare_for_lighting(&mut lights, &[(8, 8), (4, 4)]);
        assert_eq!(stats.fresh, 2);
        assert_eq!(lights.len(), 2);
        inc.finish_face(0, 0, &[0.5; 64]);
        inc.finish_face(1, 1, &[0.25; 16]);
        inc.save(&dir).unwrap();

        // Second run with an identical light list: everything matches
        // and the active list empties out.
        let mut inc2 = Incremental::new();
        inc2.load(&dir).unwrap();
        let mut lights2 = vec![test_light(0.0, 300.0), test_light(100.0, 200.0)];
        let stats2 = inc2.prepare_for_lighting(&mut lights2, &[(8, 8), (4, 4)]);
        assert_eq!(stats2.matched, 2);
        assert_eq!(stats2.fresh, 0);
        assert_eq!(stats2.removed, 0);
        assert!(lights2.is_empty(), "no lights left to recompute");

        // Cached data composites identically
        let composite = inc2.composite_face(0).unwrap();
        assert!((composite[0][0] - 150.0).abs() < 0.5);

        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn test_changed_light_stays_active() {
        let dir = std::env::temp_dir().join("myrad_inc_test_changed");
        let _ = fs::remove_file(&dir);

        let mut inc = Incremental::new();
        let mut lights = vec![test_light(0.0, 300.0)];
        inc.prepare_for_lighting(&mut lights, &[(8, 8)]);
        inc.finish_face(0, 0, &[0.5; 64]);
        inc.save(&dir).unwrap();

        // Second run: the light moved 50 units; also one brand-new light
        let mut inc2 = Incremental::new();
        inc2.load(&dir).unwrap();
        let mut lights2 = vec![test_light(50.0, 300.0)];
        let stats = inc2.prepare_for_lighting(&mut lights2, &[(8, 8)]);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(lights2.len(), 1);

        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn test_dim_change_invalidates_cache() {
        let dir = std::env::temp_dir().join("myrad_inc_test_dims");
        let _ = fs::remove_file(&dir);

        let mut inc = Incremental::new();
        let mut lights = vec![test_light(0.0, 300.0)];
        inc.prepare_for_lighting(&mut lights, &[(8, 8)]);
        inc.save(&dir).unwrap();

        let mut inc2 = Incremental::new();
        inc2.load(&dir).unwrap();
        let mut lights2 = vec![test_light(0.0, 300.0)];
        // Same light but the face lightmap grew: cache discarded
        let stats = inc2.prepare_for_lighting(&mut lights2, &[(16, 8)]);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.fresh, 1);

        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = std::env::temp_dir().join("myrad_inc_test_version");
        fs::write(&dir, 999i32.to_le_bytes()).unwrap();
        let mut junk = 999i32.to_le_bytes().to_vec();
        junk.extend_from_slice(&[0u8; 16]);
        fs::write(&dir, &junk).unwrap();

        let mut inc = Incremental::new();
        assert!(inc.load(&dir).is_err());
        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn test_corrupt_body_rejected() {
        let dir = std::env::temp_dir().join("myrad_inc_test_crc");

        let inc = Incremental::new();
        inc.save(&dir).unwrap();
        let mut raw = fs::read(&dir).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        // Flipping a body byte must break the checksum
        let mut padded = raw;
        padded.push(0);
        fs::write(&dir, &padded).unwrap();

        let mut inc2 = Incremental::new();
        assert!(inc2.load(&dir).is_err());
        let _ = fs::remove_file(&dir);
    }
}
