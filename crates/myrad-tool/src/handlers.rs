// handlers.rs — work-unit handlers for each distributed pass
//
// Three passes distribute: face direct lighting, per-cluster transfer
// building, and static prop lighting. Each handler implements the same
// trait for the networked and local paths; the local path just never
// sees a serialization buffer.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};

use myrad_common::bspfile::BspData;
use myrad_common::msgbuf::{
    msg_read_byte, msg_read_data, msg_read_float, msg_read_long, msg_write_byte,
    msg_write_data, msg_write_float, msg_write_long, SizeBuf,
};
use myrad_common::trace::TraceContext;

use myrad_lighting::context::RadSettings;
use myrad_lighting::facelight::{build_facelight, FaceLight};
use myrad_lighting::gather::IndirectSurfaces;
use myrad_lighting::incremental::Incremental;
use myrad_lighting::lights::{deserialize_light_list, serialize_light_list, DirectLight};
use myrad_lighting::lightval::LightChannels;
use myrad_lighting::patch::{PatchHandle, PatchStore, Transfer};
use myrad_lighting::staticprop::{
    deserialize_prop_result, light_static_prop, prop_pak_entries, serialize_prop_result,
    StaticPropInput,
};
use myrad_lighting::transfers::{
    build_transfers_for_cluster, deserialize_cluster_transfers, serialize_cluster_transfers,
};

use myrad_mpi::distributor::WorkUnitHandler;
use myrad_mpi::vfs::VirtualFileStore;

// ============================================================
// Job broadcast
// ============================================================

/// Everything a worker needs beyond the BSP it loads from disk: the
/// active light list and the (possibly incremental-filtered) face list.
pub struct JobData {
    pub lights: Vec<DirectLight>,
    pub face_list: Vec<u32>,
}

pub fn serialize_job(job: &JobData) -> Vec<u8> {
    let lights = serialize_light_list(&job.lights);
    let mut sb = SizeBuf::new(lights.len() + job.face_list.len() * 4 + 64);
    msg_write_data(&mut sb, &lights);
    msg_write_long(&mut sb, job.face_list.len() as i32);
    for &f in &job.face_list {
        msg_write_long(&mut sb, f as i32);
    }
    sb.as_slice().to_vec()
}

pub fn deserialize_job(data: &[u8]) -> Result<JobData, String> {
    let mut sb = SizeBuf::from_bytes(data);
    let lights_blob = msg_read_data(&mut sb).ok_or("truncated job data")?;
    let lights = deserialize_light_list(&lights_blob)?;
    let count = msg_read_long(&mut sb);
    if count < 0 {
        return Err("truncated job face list".to_string());
    }
    let mut face_list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let f = msg_read_long(&mut sb);
        if f < 0 {
            return Err("bad face index in job data".to_string());
        }
        face_list.push(f as u32);
    }
    Ok(JobData { lights, face_list })
}

// ============================================================
// Pass 1: face direct lighting
// ============================================================

pub struct FaceLightHandler<'a> {
    pub bsp: &'a BspData,
    pub trace: &'a TraceContext<'a>,
    pub settings: &'a RadSettings,
    pub incremental: Option<&'a Incremental>,
    pub vfs: &'a VirtualFileStore,
    /// Unit index -> face number
    pub face_list: RwLock<Vec<u32>>,
    pub lights: RwLock<Vec<DirectLight>>,
    /// Completed facelights keyed by face number (master/local side)
    pub results: Mutex<Vec<(usize, FaceLight)>>,
}

impl FaceLightHandler<'_> {
    fn facenum(&self, unit: u64) -> Result<usize, String> {
        let list = self.face_list.read();
        list.get(unit as usize)
            .map(|&f| f as usize)
            .ok_or_else(|| format!("work unit {} out of face-list range", unit))
    }
}

impl WorkUnitHandler for FaceLightHandler<'_> {
    fn process_work_unit(&self, unit: u64, out: Option<&mut SizeBuf>) -> Result<(), String> {
        let facenum = self.facenum(unit)?;
        let lights = self.lights.read();
        let fl = build_facelight(
            self.bsp,
            self.trace,
            &lights,
            self.settings,
            self.incremental,
            facenum,
        );
        match out {
            Some(sb) => serialize_facelight(&fl, sb),
            None => self.results.lock().push((facenum, fl)),
        }
        Ok(())
    }

    fn receive_result(&self, unit: u64, payload: &[u8]) -> Result<(), String> {
        let facenum = self.facenum(unit)?;
        let mut sb = SizeBuf::from_bytes(payload);
        let fl = deserialize_facelight(&mut sb)?;
        self.results.lock().push((facenum, fl));
        Ok(())
    }

    fn on_work_units_completed(&self, total: u64) {
        log::debug!("{} faces lit", total);
    }

    fn on_file_announce(&self, name: &str) {
        let Some(blob) = self.vfs.get(name) else {
            log::warn!("announced file {} missing from store", name);
            return;
        };
        match deserialize_job(&blob) {
            Ok(job) => {
                *self.lights.write() = job.lights;
                *self.face_list.write() = job.face_list;
            }
            Err(e) => log::warn!("bad job broadcast: {}", e),
        }
    }
}

/// Lightmap wire layout: dims, bump flag, style table, then per-slot
/// maps (channel count + floats) and the average color.
pub fn serialize_facelight(fl: &FaceLight, sb: &mut SizeBuf) {
    msg_write_long(sb, fl.width as i32);
    msg_write_long(sb, fl.height as i32);
    msg_write_byte(sb, fl.bumped as u8);
    for s in fl.styles {
        msg_write_byte(sb, s);
    }
    for map in &fl.maps {
        match map {
            None => msg_write_byte(sb, 0),
            Some(luxels) => {
                msg_write_byte(sb, 1);
                let channels = luxels.first().map_or(1, |l| l.count);
                msg_write_byte(sb, channels as u8);
                msg_write_long(sb, luxels.len() as i32);
                for l in luxels {
                    for c in 0..channels {
                        for v in l.vals[c] {
                            msg_write_float(sb, v);
                        }
                    }
                }
            }
        }
    }
    for v in fl.avg_light {
        msg_write_float(sb, v);
    }
}

pub fn deserialize_facelight(sb: &mut SizeBuf) -> Result<FaceLight, String> {
    let width = msg_read_long(sb);
    let height = msg_read_long(sb);
    if !(0..=64).contains(&width) || !(0..=64).contains(&height) {
        return Err("bad facelight dimensions".to_string());
    }
    let mut fl = FaceLight {
        width: width as usize,
        height: height as usize,
        bumped: msg_read_byte(sb) != 0,
        ..Default::default()
    };
    for i in 0..fl.styles.len() {
        fl.styles[i] = msg_read_byte(sb) as u8;
    }
    for i in 0..fl.maps.len() {
        if msg_read_byte(sb) == 0 {
            continue;
        }
        let channels = msg_read_byte(sb);
        let count = msg_read_long(sb);
        if !(1..=4).contains(&channels) || count < 0 || count as usize != fl.width * fl.height
        {
            return Err("bad facelight map header".to_string());
        }
        let mut luxels = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut l = LightChannels::with_count(channels as usize);
            for c in 0..channels as usize {
                for v in &mut l.vals[c] {
                    *v = msg_read_float(sb);
                }
            }
            luxels.push(l);
        }
        fl.maps[i] = Some(luxels);
    }
    for v in &mut fl.avg_light {
        *v = msg_read_float(sb);
    }
    if myrad_common::msgbuf::msg_truncated(sb) {
        return Err("truncated facelight payload".to_string());
    }
    Ok(fl)
}

// ============================================================
// Pass 2: visibility / transfers
// ============================================================

pub struct VisLeafHandler<'a> {
    pub trace: &'a TraceContext<'a>,
    pub patches: &'a PatchStore,
    pub cluster_map: &'a BTreeMap<i32, Vec<PatchHandle>>,
    /// Unit index -> cluster id
    pub cluster_list: Vec<i32>,
    pub results: Mutex<Vec<(PatchHandle, Vec<Transfer>)>>,
}

impl WorkUnitHandler for VisLeafHandler<'_> {
    fn process_work_unit(&self, unit: u64, out: Option<&mut SizeBuf>) -> Result<(), String> {
        let cluster = *self
            .cluster_list
            .get(unit as usize)
            .ok_or_else(|| format!("work unit {} out of cluster range", unit))?;
        let transfers =
            build_transfers_for_cluster(self.trace, self.patches, cluster, self.cluster_map);
        match out {
            Some(sb) => serialize_cluster_transfers(&transfers, sb),
            None => self.results.lock().extend(transfers),
        }
        Ok(())
    }

    fn receive_result(&self, _unit: u64, payload: &[u8]) -> Result<(), String> {
        let mut sb = SizeBuf::from_bytes(payload);
        let transfers = deserialize_cluster_transfers(&mut sb, self.patches.len())?;
        self.results.lock().extend(transfers);
        Ok(())
    }

    fn on_work_units_completed(&self, total: u64) {
        log::debug!("{} clusters transferred", total);
    }
}

// ============================================================
// Pass 3: static props
// ============================================================

pub struct StaticPropHandler<'a> {
    pub trace: &'a TraceContext<'a>,
    pub lights: &'a [DirectLight],
    /// Already-lit surface data; workers receive it via broadcast
    pub surfaces: RwLock<IndirectSurfaces>,
    pub settings: &'a RadSettings,
    pub props: &'a [StaticPropInput],
    pub vfs: &'a VirtualFileStore,
    pub results: Mutex<Vec<(String, Vec<u8>)>>,
}

impl WorkUnitHandler for StaticPropHandler<'_> {
    fn process_work_unit(&self, unit: u64, out: Option<&mut SizeBuf>) -> Result<(), String> {
        let prop = self
            .props
            .get(unit as usize)
            .ok_or_else(|| format!("work unit {} out of prop range", unit))?;
        let surfaces = self.surfaces.read();
        let lit = light_static_prop(self.trace, self.lights, &surfaces, self.settings, prop);
        let entries = prop_pak_entries(unit as usize, &lit);
        match out {
            Some(sb) => serialize_prop_result(&entries, sb),
            None => self.results.lock().extend(entries),
        }
        Ok(())
    }

    fn receive_result(&self, _unit: u64, payload: &[u8]) -> Result<(), String> {
        let mut sb = SizeBuf::from_bytes(payload);
        let entries = deserialize_prop_result(&mut sb)?;
        self.results.lock().extend(entries);
        Ok(())
    }

    fn on_work_units_completed(&self, total: u64) {
        log::debug!("{} props lit", total);
    }

    fn on_file_announce(&self, name: &str) {
        let Some(blob) = self.vfs.get(name) else {
            return;
        };
        match deserialize_surfaces(&blob) {
            Ok(s) => *self.surfaces.write() = s,
            Err(e) => log::warn!("bad surfaces broadcast: {}", e),
        }
    }
}

/// Per-face average light and reflectivity, broadcast before the prop
/// pass so workers can run the indirect gather.
pub fn serialize_surfaces(surfaces: &IndirectSurfaces) -> Vec<u8> {
    let n = surfaces.avg_light.len();
    let mut sb = SizeBuf::new(8 + n * 24 + 16);
    msg_write_long(&mut sb, n as i32);
    for i in 0..n {
        for v in surfaces.avg_light[i] {
            msg_write_float(&mut sb, v);
        }
        for v in surfaces.reflectivity[i] {
            msg_write_float(&mut sb, v);
        }
    }
    sb.as_slice().to_vec()
}

pub fn deserialize_surfaces(data: &[u8]) -> Result<IndirectSurfaces, String> {
    let mut sb = SizeBuf::from_bytes(data);
    let n = msg_read_long(&mut sb);
    if n < 0 {
        return Err("truncated surfaces blob".to_string());
    }
    let mut out = IndirectSurfaces {
        avg_light: Vec::with_capacity(n as usize),
        reflectivity: Vec::with_capacity(n as usize),
    };
    for _ in 0..n {
        let mut avg = [0.0f32; 3];
        let mut refl = [0.0f32; 3];
        for v in &mut avg {
            *v = msg_read_float(&mut sb);
        }
        for v in &mut refl {
            *v = msg_read_float(&mut sb);
        }
        out.avg_light.push(avg);
        out.reflectivity.push(refl);
    }
    if myrad_common::msgbuf::msg_truncated(&sb) {
        return Err("truncated surfaces blob".to_string());
    }
    Ok(out)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use myrad_common::bspfile::MAXLIGHTMAPS;

    #[test]
    fn test_facelight_round_trip() {
        let mut fl = FaceLight {
            width: 2,
            height: 2,
            bumped: false,
            styles: [255; MAXLIGHTMAPS],
            ..Default::default()
        };
        let slot = fl.style_slot(0, 1).unwrap();
        let map = fl.maps[slot].as_mut().unwrap();
        map[0].vals[0] = [10.0, 20.0, 30.0];
        map[3].vals[0] = [1.0, 2.0, 3.0];
        fl.avg_light = [5.5, 6.5, 7.5];

        let mut sb = SizeBuf::new(4096);
        serialize_facelight(&fl, &mut sb);
        let mut rd = SizeBuf::from_bytes(sb.as_slice());
        let back = deserialize_facelight(&mut rd).unwrap();

        assert_eq!(back.width, 2);
        assert_eq!(back.height, 2);
        assert_eq!(back.styles, fl.styles);
        assert_eq!(back.maps[slot].as_ref().unwrap()[0].vals[0], [10.0, 20.0, 30.0]);
        assert_eq!(back.avg_light, [5.5, 6.5, 7.5]);
    }

    #[test]
    fn test_facelight_truncation_detected() {
        let mut fl = FaceLight {
            width: 2,
            height: 2,
            styles: [255; MAXLIGHTMAPS],
            ..Default::default()
        };
        fl.style_slot(0, 1);
        let mut sb = SizeBuf::new(4096);
        serialize_facelight(&fl, &mut sb);
        let bytes = sb.as_slice();
        let mut rd = SizeBuf::from_bytes(&bytes[..bytes.len() - 4]);
        assert!(deserialize_facelight(&mut rd).is_err());
    }

    #[test]
    fn test_surfaces_round_trip() {
        let surfaces = IndirectSurfaces {
            avg_light: vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            reflectivity: vec![[0.5; 3], [0.25; 3]],
        };
        let blob = serialize_surfaces(&surfaces);
        let back = deserialize_surfaces(&blob).unwrap();
        assert_eq!(back.avg_light, surfaces.avg_light);
        assert_eq!(back.reflectivity, surfaces.reflectivity);
    }

    #[test]
    fn test_job_round_trip() {
        let job = JobData {
            lights: Vec::new(),
            face_list: vec![3, 1, 4, 1, 5],
        };
        let blob = serialize_job(&job);
        let back = deserialize_job(&blob).unwrap();
        assert!(back.lights.is_empty());
        assert_eq!(back.face_list, vec![3, 1, 4, 1, 5]);
    }
}
