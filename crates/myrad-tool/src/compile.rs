// compile.rs — pass sequencing for a lighting compile
//
// Load map -> chop patches -> build lights -> incremental prepare ->
// direct pass -> transfers -> bounce -> export -> static props ->
// incremental save -> write map. The direct, transfer, and prop passes
// run through the same work-unit handlers locally or distributed.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use myrad_common::bspfile::{BspData, SURF_BUMPLIGHT, SURF_LIGHT};
use myrad_common::console::{fatal_error, qprintf};
use myrad_common::entdata::parse_entities;
use myrad_common::mathlib::{
    dot_product, vector_ma, vector_normalize, vector_scale, vector_subtract, Vec3,
};
use myrad_common::trace::{PropOccluder, TraceContext};

use myrad_lighting::context::{LightingContext, RadSettings};
use myrad_lighting::facelight::{
    apply_bounced_light, calc_face_info, export_lighting, face_is_lightmapped, FaceLight,
};
use myrad_lighting::gather::IndirectSurfaces;
use myrad_lighting::incremental::Incremental;
use myrad_lighting::lights::build_direct_lights;
use myrad_lighting::staticprop::{StaticPropInput, TexelMapping};
use myrad_lighting::transfers::{
    bounce_light, build_all_transfers, merge_cluster_transfers, patches_by_cluster,
    seed_patch_direct_light,
};

use myrad_mpi::distributor::{run_local, run_worker, WorkUnitDistributor, DEFAULT_WINDOW_SIZE};
use myrad_mpi::packets::MpiPacket;
use myrad_mpi::transport::{spawn_accept_loop, TcpTransport, Transport};
use myrad_mpi::vfs::VirtualFileStore;

use crate::handlers::{
    serialize_job, serialize_surfaces, FaceLightHandler, JobData, StaticPropHandler,
    VisLeafHandler,
};

const JOB_FILE: &str = "mpi_job.dat";
const SURFACES_FILE: &str = "mpi_surfaces.dat";

pub enum RunMode {
    Local,
    /// Coordinate a distributed run: listen, wait for `min_workers`,
    /// then fan the passes out.
    Master { listen: String, min_workers: usize },
}

// ============================================================
// Shared construction
// ============================================================

/// Stable per-texture bounce tint. There is no material database in
/// this toolchain, so distinct textures get distinct mid-grey colors
/// derived from the name.
pub fn texture_reflectivity(name: &str) -> Vec3 {
    let mut h: u32 = 0x811c9dc5;
    for b in name.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    let channel = |shift: u32| 0.35 + ((h >> shift) & 0xff) as f32 / 255.0 * 0.3;
    [channel(0), channel(8), channel(16)]
}

/// Chop every lightmapped face into patches. Deterministic: workers
/// rebuild the identical arena from the same map.
pub fn build_patches(ctx: &mut LightingContext) {
    let trace = TraceContext::new(&ctx.bsp);
    for facenum in 0..ctx.bsp.faces.len() {
        if !face_is_lightmapped(&ctx.bsp, facenum) {
            continue;
        }
        let face = &ctx.bsp.faces[facenum];
        let ti = &ctx.bsp.texinfo[face.texinfo as usize];
        let plane = ctx.bsp.face_plane(face);
        let mut winding = ctx.bsp.face_winding(face);
        if winding.num_points() < 3 {
            continue;
        }
        // Surfedge order is not guaranteed to agree with the face plane
        if dot_product(&winding.plane().normal, &plane.normal) < 0.0 {
            winding.reverse();
        }

        let reflectivity = texture_reflectivity(ti.texture_name());
        let baselight = if ti.flags & SURF_LIGHT != 0 && ti.value > 0 {
            vector_scale(&reflectivity, ti.value as f32 / 255.0)
        } else {
            [0.0; 3]
        };
        let bump = ti.flags & SURF_BUMPLIGHT != 0;
        let origin = vector_ma(&winding.center(), 2.0, &plane.normal);
        let cluster = trace.point_cluster(&origin);

        ctx.patches.make_patch_for_face(
            facenum as i32,
            winding,
            ctx.settings.chop,
            reflectivity,
            baselight,
            cluster,
            bump,
            false,
        );
    }
    qprintf(&format!("{} patches\n", ctx.patches.len()));
}

/// Per-face lightmap dimensions; the incremental cache invalidates on
/// any change.
pub fn face_dims(bsp: &BspData) -> Vec<(u8, u8)> {
    (0..bsp.faces.len())
        .map(|f| {
            if !face_is_lightmapped(bsp, f) {
                return (0, 0);
            }
            match calc_face_info(bsp, f) {
                Ok(info) => (info.width.min(255) as u8, info.height.min(255) as u8),
                Err(_) => (0, 0),
            }
        })
        .collect()
}

pub fn build_indirect_surfaces(bsp: &BspData, facelights: &[FaceLight]) -> IndirectSurfaces {
    IndirectSurfaces {
        avg_light: facelights.iter().map(|fl| fl.avg_light).collect(),
        reflectivity: bsp
            .faces
            .iter()
            .map(|f| texture_reflectivity(bsp.texinfo[f.texinfo as usize].texture_name()))
            .collect(),
    }
}

/// Rebuild a cached face's lighting without recomputation.
fn facelight_from_flat(width: usize, height: usize, flat: &[[f32; 3]]) -> FaceLight {
    let mut fl = FaceLight {
        width,
        height,
        styles: [255; 4],
        ..Default::default()
    };
    if let Some(slot) = fl.style_slot(0, 1) {
        let map = fl.maps[slot].as_mut().expect("slot allocated");
        let mut avg = [0.0f32; 3];
        for (luxel, value) in map.iter_mut().zip(flat) {
            luxel.vals[0] = *value;
            avg = myrad_common::mathlib::vector_add(&avg, value);
        }
        if !flat.is_empty() {
            avg = vector_scale(&avg, 1.0 / flat.len() as f32);
        }
        fl.avg_light = avg;
    }
    fl
}

// ============================================================
// Static props
// ============================================================

/// Props come from misc_model entities. Without a model file loader in
/// the toolchain, the collision box stands in for the mesh: eight
/// corners lit per-vertex, optional planar texel grid across the top.
pub fn props_from_entities(bsp: &BspData) -> Result<Vec<StaticPropInput>, String> {
    let entities = parse_entities(&bsp.entity_string)?;
    let mut props = Vec::new();

    for ent in &entities {
        if ent.classname() != "misc_model" {
            continue;
        }
        let origin = ent.origin();
        let mins = ent.vector_value("mins").unwrap_or([-16.0, -16.0, -16.0]);
        let maxs = ent.vector_value("maxs").unwrap_or([16.0, 16.0, 16.0]);
        let prop_id = props.len() as i32;

        let mut verts = Vec::with_capacity(8);
        let mut normals = Vec::with_capacity(8);
        for i in 0..8 {
            let corner = [
                origin[0] + if i & 1 != 0 { maxs[0] } else { mins[0] },
                origin[1] + if i & 2 != 0 { maxs[1] } else { mins[1] },
                origin[2] + if i & 4 != 0 { maxs[2] } else { mins[2] },
            ];
            let mut n = vector_subtract(&corner, &origin);
            if vector_normalize(&mut n) == 0.0 {
                n = [0.0, 0.0, 1.0];
            }
            verts.push(corner);
            normals.push(n);
        }

        let texels = ent.value("texellighting").and_then(|v| {
            let dims: Vec<usize> = v
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            let (w, h) = (*dims.first()?, *dims.get(1)?);
            if w == 0 || h == 0 {
                return None;
            }
            let mut positions = Vec::with_capacity(w * h);
            let mut tnormals = Vec::with_capacity(w * h);
            for ty in 0..h {
                for tx in 0..w {
                    let fx = (tx as f32 + 0.5) / w as f32;
                    let fy = (ty as f32 + 0.5) / h as f32;
                    positions.push([
                        origin[0] + mins[0] + (maxs[0] - mins[0]) * fx,
                        origin[1] + mins[1] + (maxs[1] - mins[1]) * fy,
                        origin[2] + maxs[2],
                    ]);
                    tnormals.push([0.0, 0.0, 1.0]);
                }
            }
            Some(TexelMapping {
                width: w,
                height: h,
                positions,
                normals: tnormals,
            })
        });

        props.push(StaticPropInput {
            prop_id,
            origin,
            verts,
            normals,
            skip_self_shadow: ent.int_value("disableselfshadowing").unwrap_or(0) != 0,
            lighting_origin: ent.vector_value("lightingorigin"),
            texels,
        });
    }
    Ok(props)
}

/// The prop's collision box as occluder triangles.
fn prop_occluder(prop: &StaticPropInput) -> PropOccluder {
    let v = &prop.verts;
    // Box corner indexing: bit 0 = +x, bit 1 = +y, bit 2 = +z
    const QUADS: [[usize; 4]; 6] = [
        [0, 1, 3, 2], // bottom
        [4, 6, 7, 5], // top
        [0, 4, 5, 1], // -y
        [2, 3, 7, 6], // +y
        [0, 2, 6, 4], // -x
        [1, 5, 7, 3], // +x
    ];
    let mut tris = Vec::with_capacity(12);
    for q in QUADS {
        tris.push([v[q[0]], v[q[1]], v[q[2]]]);
        tris.push([v[q[0]], v[q[2]], v[q[3]]]);
    }
    PropOccluder {
        prop_id: prop.prop_id,
        tris,
    }
}

// ============================================================
// Master / local compile
// ============================================================

pub fn compile_map(bsp_path: &Path, settings: RadSettings, mode: RunMode) -> Result<(), String> {
    let raw =
        fs::read(bsp_path).map_err(|e| format!("reading {}: {}", bsp_path.display(), e))?;
    let bsp = BspData::load_from_bytes(&raw)?;
    qprintf(&format!(
        "{} faces, {} leafs, {} clusters\n",
        bsp.faces.len(),
        bsp.leafs.len(),
        bsp.num_clusters
    ));

    let mut ctx = LightingContext::new(bsp, settings);
    build_patches(&mut ctx);
    let dims = face_dims(&ctx.bsp);

    {
        let trace = TraceContext::new(&ctx.bsp);
        ctx.activelights = build_direct_lights(&ctx.bsp, &trace, &ctx.patches, &ctx.settings)?;
    }
    qprintf(&format!("{} lights\n", ctx.activelights.len()));

    // Incremental cache: prune unchanged lights before any gather
    let mut incremental: Option<Incremental> = None;
    if let Some(path) = ctx.settings.incremental_file.clone() {
        if !matches!(mode, RunMode::Local) {
            return Err("incremental lighting requires a local run".to_string());
        }
        let mut inc = Incremental::new();
        if let Err(e) = inc.load(&path) {
            // A bad cache silently corrupts output if ignored
            fatal_error(&e);
        }
        inc.prepare_for_lighting(&mut ctx.activelights, &dims);
        incremental = Some(inc);
    }

    let face_list: Vec<u32> = match &incremental {
        Some(inc) => inc
            .dirty_faces(&ctx.bsp, &ctx.activelights)
            .iter()
            .enumerate()
            .filter_map(|(i, &dirty)| dirty.then_some(i as u32))
            .collect(),
        None => (0..ctx.bsp.faces.len() as u32).collect(),
    };
    qprintf(&format!("{} faces to light\n", face_list.len()));

    // Collect workers and broadcast the job
    let vfs = VirtualFileStore::new();
    let mut workers: Vec<Box<dyn Transport>> = Vec::new();
    if let RunMode::Master {
        listen,
        min_workers,
    } = &mode
    {
        let listener = std::net::TcpListener::bind(listen.as_str())
            .map_err(|e| format!("binding {}: {}", listen, e))?;
        qprintf(&format!("waiting for {} worker(s) on {}\n", min_workers, listen));
        let rx = spawn_accept_loop(listener);
        while workers.len() < *min_workers {
            match rx.recv_timeout(Duration::from_secs(300)) {
                Ok(t) => {
                    qprintf("worker connected\n");
                    workers.push(t);
                }
                Err(_) => return Err("timed out waiting for workers".to_string()),
            }
        }

        let job = JobData {
            lights: ctx.activelights.clone(),
            face_list: face_list.clone(),
        };
        broadcast_file(&workers, &vfs, JOB_FILE, serialize_job(&job))?;
    }

    // ========================================================
    // Pass 1: direct lighting
    // ========================================================
    let cancel = AtomicBool::new(false);
    let mut facelights: Vec<FaceLight> = (0..ctx.bsp.faces.len())
        .map(|_| FaceLight::default())
        .collect();
    {
        let trace = TraceContext::new(&ctx.bsp);
        let handler = FaceLightHandler {
            bsp: &ctx.bsp,
            trace: &trace,
            settings: &ctx.settings,
            incremental: incremental.as_ref(),
            vfs: &vfs,
            face_list: RwLock::new(face_list.clone()),
            lights: RwLock::new(ctx.activelights.clone()),
            results: Mutex::new(Vec::new()),
        };
        if workers.is_empty() {
            run_local(face_list.len() as u64, &handler, &cancel);
        } else {
            let mut dist =
                WorkUnitDistributor::new(face_list.len() as u64, DEFAULT_WINDOW_SIZE);
            let (stats, survivors) =
                dist.run_master(std::mem::take(&mut workers), None, &handler)?;
            workers = survivors;
            qprintf(&format!("{} face work units completed\n", stats.completed));
        }
        for (facenum, fl) in handler.results.into_inner() {
            facelights[facenum] = fl;
        }
    }

    // Faces skipped by the incremental filter recomposite from cache
    if let Some(inc) = &incremental {
        let recomputed: HashSet<u32> = face_list.iter().copied().collect();
        for f in 0..ctx.bsp.faces.len() {
            if recomputed.contains(&(f as u32)) {
                continue;
            }
            let (w, h) = dims[f];
            if w == 0 || h == 0 {
                continue;
            }
            if let Some(flat) = inc.composite_face(f as i32) {
                facelights[f] = facelight_from_flat(w as usize, h as usize, &flat);
            }
        }
    }
    ctx.facelights = facelights;

    // ========================================================
    // Pass 2: transfers and radiosity bounces
    //
    // Workers always serve three phases, so in a distributed run the
    // distributor handshake happens even when the pass has zero units.
    // ========================================================
    let bouncing = ctx.settings.num_bounces > 0;
    {
        let trace = TraceContext::new(&ctx.bsp);
        if bouncing {
            seed_patch_direct_light(&trace, &mut ctx.patches, &ctx.activelights, &ctx.settings);
        }

        if workers.is_empty() {
            if bouncing {
                build_all_transfers(&trace, &mut ctx.patches);
            }
        } else {
            let cluster_map = patches_by_cluster(&ctx.patches);
            let cluster_list: Vec<i32> = if bouncing {
                cluster_map.keys().copied().collect()
            } else {
                Vec::new()
            };
            let handler = VisLeafHandler {
                trace: &trace,
                patches: &ctx.patches,
                cluster_map: &cluster_map,
                cluster_list: cluster_list.clone(),
                results: Mutex::new(Vec::new()),
            };
            let mut dist =
                WorkUnitDistributor::new(cluster_list.len() as u64, DEFAULT_WINDOW_SIZE);
            let (stats, survivors) =
                dist.run_master(std::mem::take(&mut workers), None, &handler)?;
            workers = survivors;
            qprintf(&format!("{} cluster work units completed\n", stats.completed));
            let results = handler.results.into_inner();
            merge_cluster_transfers(&mut ctx.patches, results);
        }
    }
    if bouncing {
        bounce_light(&mut ctx.patches, &ctx.settings);
        for f in 0..ctx.bsp.faces.len() {
            apply_bounced_light(&ctx.bsp, &ctx.patches, f, &mut ctx.facelights[f]);
        }
    }

    export_lighting(&mut ctx.bsp, &ctx.facelights);

    // ========================================================
    // Pass 3: static props
    // ========================================================
    let props = props_from_entities(&ctx.bsp)?;
    if !props.is_empty() || !workers.is_empty() {
        let surfaces = build_indirect_surfaces(&ctx.bsp, &ctx.facelights);
        let surfaces_blob = serialize_surfaces(&surfaces);

        let mut trace = TraceContext::new(&ctx.bsp);
        for prop in &props {
            trace.add_occluder(prop_occluder(prop));
        }

        let handler = StaticPropHandler {
            trace: &trace,
            lights: &ctx.activelights,
            surfaces: RwLock::new(surfaces),
            settings: &ctx.settings,
            props: &props,
            vfs: &vfs,
            results: Mutex::new(Vec::new()),
        };
        if workers.is_empty() {
            run_local(props.len() as u64, &handler, &cancel);
        } else {
            broadcast_file(&workers, &vfs, SURFACES_FILE, surfaces_blob)?;
            let mut dist = WorkUnitDistributor::new(props.len() as u64, DEFAULT_WINDOW_SIZE);
            let (stats, _survivors) =
                dist.run_master(std::mem::take(&mut workers), None, &handler)?;
            qprintf(&format!("{} prop work units completed\n", stats.completed));
        }

        let mut entries = handler.results.into_inner();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        qprintf(&format!("{} prop lighting files\n", entries.len()));
        ctx.bsp.pak_entries = entries;
    }

    // ========================================================
    // Write-back
    // ========================================================
    if let (Some(inc), Some(path)) = (&incremental, &ctx.settings.incremental_file) {
        inc.save(path)?;
    }
    let out = ctx.bsp.save_to_bytes();
    fs::write(bsp_path, &out)
        .map_err(|e| format!("writing {}: {}", bsp_path.display(), e))?;
    qprintf(&format!(
        "wrote {} ({} bytes lighting)\n",
        bsp_path.display(),
        ctx.bsp.lightdata.len() * 4
    ));
    Ok(())
}

fn broadcast_file(
    workers: &[Box<dyn Transport>],
    vfs: &VirtualFileStore,
    name: &str,
    data: Vec<u8>,
) -> Result<(), String> {
    vfs.store_named(name, data.clone());
    for w in workers {
        w.send(
            &MpiPacket::FileData {
                name: name.to_string(),
                data: data.clone(),
            }
            .encode(),
        )?;
        w.send(
            &MpiPacket::FileAnnounce {
                name: name.to_string(),
            }
            .encode(),
        )?;
    }
    Ok(())
}

// ============================================================
// Worker process
// ============================================================

/// Serve a master through the three distributed passes. The worker
/// loads the same map from disk and rebuilds patches deterministically;
/// only the light list and face filter come over the wire.
pub fn run_worker_mode(addr: &str, bsp_path: &Path, settings: RadSettings) -> Result<(), String> {
    let raw =
        fs::read(bsp_path).map_err(|e| format!("reading {}: {}", bsp_path.display(), e))?;
    let bsp = BspData::load_from_bytes(&raw)?;
    let mut ctx = LightingContext::new(bsp, settings);
    build_patches(&mut ctx);

    let transport = TcpTransport::connect(addr)?;
    qprintf(&format!("connected to master at {}\n", addr));
    let vfs = VirtualFileStore::new();
    let trace = TraceContext::new(&ctx.bsp);

    // Pass 1: faces. The job broadcast fills in lights and face list
    // before the first assignment arrives.
    let face_handler = FaceLightHandler {
        bsp: &ctx.bsp,
        trace: &trace,
        settings: &ctx.settings,
        incremental: None,
        vfs: &vfs,
        face_list: RwLock::new(Vec::new()),
        lights: RwLock::new(Vec::new()),
        results: Mutex::new(Vec::new()),
    };
    let served = run_worker(&transport, &face_handler, &vfs)?;
    qprintf(&format!("face pass: {} units served\n", served));
    let lights = face_handler.lights.into_inner();

    // Pass 2: clusters
    let cluster_map = patches_by_cluster(&ctx.patches);
    let cluster_list: Vec<i32> = cluster_map.keys().copied().collect();
    let vis_handler = VisLeafHandler {
        trace: &trace,
        patches: &ctx.patches,
        cluster_map: &cluster_map,
        cluster_list,
        results: Mutex::new(Vec::new()),
    };
    let served = run_worker(&transport, &vis_handler, &vfs)?;
    qprintf(&format!("transfer pass: {} units served\n", served));

    // Pass 3: props, with prop occluders in the trace
    let props = props_from_entities(&ctx.bsp)?;
    let mut prop_trace = TraceContext::new(&ctx.bsp);
    for prop in &props {
        prop_trace.add_occluder(prop_occluder(prop));
    }
    let prop_handler = StaticPropHandler {
        trace: &prop_trace,
        lights: &lights,
        surfaces: RwLock::new(IndirectSurfaces {
            avg_light: vec![[0.0; 3]; ctx.bsp.faces.len()],
            reflectivity: vec![[0.5; 3]; ctx.bsp.faces.len()],
        }),
        settings: &ctx.settings,
        props: &props,
        vfs: &vfs,
        results: Mutex::new(Vec::new()),
    };
    let served = run_worker(&transport, &prop_handler, &vfs)?;
    qprintf(&format!("prop pass: {} units served\n", served));
    Ok(())
}

// ============================================================
// Tests
// ============================================================
