// transfers.rs — form-factor transfer building and the bounce pass
//
// Transfers are built once per cluster (one MPI work unit each) and
// then consumed by every bounce iteration, so the radiosity solve never
// re-traces rays. Weights land in the receiving patch; ordering across
// clusters is irrelevant because receivers are disjoint.

use std::collections::BTreeMap;

use rayon::prelude::*;

use myrad_common::console::qdprintf;
use myrad_common::mathlib::{dot_product, vector_normalize, vector_subtract};
use myrad_common::msgbuf::{
    msg_read_float, msg_read_long, msg_write_float, msg_write_long, SizeBuf,
};
use myrad_common::trace::{cluster_visible, TraceContext};

use crate::context::RadSettings;
use crate::gather::compute_direct_lighting_at_point;
use crate::lights::DirectLight;
use crate::patch::{PatchHandle, PatchStore, Transfer};

/// Couplings weaker than this are dropped before normalization.
pub const TRANSFER_EPSILON: f32 = 2.5e-6;

/// Stop bouncing once no patch carries more energy than this.
pub const BOUNCE_ENERGY_FLOOR: f32 = 0.1;

/// Leaf patches grouped by visibility cluster; the unit of transfer
/// work distribution.
pub fn patches_by_cluster(patches: &PatchStore) -> BTreeMap<i32, Vec<PatchHandle>> {
    let mut map: BTreeMap<i32, Vec<PatchHandle>> = BTreeMap::new();
    for h in patches.iter_leaves() {
        let cluster = patches.get(h).cluster;
        if cluster >= 0 {
            map.entry(cluster).or_default().push(h);
        }
    }
    map
}

/// Transfers into every patch of one cluster: for each receiver, visit
/// all PVS-visible leaf patches, trace for mutual visibility, and keep
/// the form-factor weights. Results are returned rather than written so
/// the same code serves the local and distributed paths.
pub fn build_transfers_for_cluster(
    trace: &TraceContext,
    patches: &PatchStore,
    cluster: i32,
    cluster_map: &BTreeMap<i32, Vec<PatchHandle>>,
) -> Vec<(PatchHandle, Vec<Transfer>)> {
    let Some(receivers) = cluster_map.get(&cluster) else {
        return Vec::new();
    };
    let pvs = trace.cluster_pvs(cluster);

    // Candidate emitters: every leaf patch in a PVS-visible cluster
    let mut candidates: Vec<PatchHandle> = Vec::new();
    for (&other, handles) in cluster_map {
        if other == cluster || cluster_visible(&pvs, other) {
            candidates.extend_from_slice(handles);
        }
    }

    receivers
        .iter()
        .map(|&recv| {
            let rp = patches.get(recv);
            let mut transfers = Vec::new();

            for &emit in &candidates {
                if emit == recv {
                    continue;
                }
                let ep = patches.get(emit);
                if ep.face == rp.face {
                    continue;
                }

                let mut delta = vector_subtract(&ep.origin, &rp.origin);
                let dist = vector_normalize(&mut delta);
                if dist < 1.0 {
                    continue;
                }
                let cos_r = dot_product(&delta, &rp.plane.normal);
                if cos_r <= 0.0 {
                    continue;
                }
                let cos_e = -dot_product(&delta, &ep.plane.normal);
                if cos_e <= 0.0 {
                    continue;
                }

                let weight = cos_r * cos_e * ep.area / (std::f32::consts::PI * dist * dist);
                if weight < TRANSFER_EPSILON {
                    continue;
                }
                if trace.test_line(&rp.origin, &ep.origin).blocked() {
                    continue;
                }
                transfers.push(Transfer {
                    patch: emit,
                    weight,
                });
            }

            // Normalize so each receiver redistributes at most all the
            // energy it sees.
            let total: f32 = transfers.iter().map(|t| t.weight).sum();
            if total > 1.0 {
                let inv = 1.0 / total;
                for t in &mut transfers {
                    t.weight *= inv;
                }
            }
            (recv, transfers)
        })
        .collect()
}

/// Build all transfers locally with rayon, merging per-cluster results
/// into the patch store exactly as the MPI receive path does.
pub fn build_all_transfers(trace: &TraceContext, patches: &mut PatchStore) {
    let cluster_map = patches_by_cluster(patches);
    let clusters: Vec<i32> = cluster_map.keys().copied().collect();

    let results: Vec<_> = clusters
        .par_iter()
        .map(|&c| build_transfers_for_cluster(trace, patches, c, &cluster_map))
        .collect();

    let mut count = 0usize;
    for cluster_result in results {
        for (recv, transfers) in cluster_result {
            count += transfers.len();
            patches.get_mut(recv).transfers = transfers;
        }
    }
    qdprintf(&format!("{} transfers\n", count));
}

// ============================================================
// MPI serialization
// ============================================================

/// Wire layout: i32 patch count, then per patch { i32 handle,
/// i32 transfer count, transfers as (i32 handle, f32 weight) }.
pub fn serialize_cluster_transfers(
    results: &[(PatchHandle, Vec<Transfer>)],
    sb: &mut SizeBuf,
) {
    msg_write_long(sb, results.len() as i32);
    for (recv, transfers) in results {
        msg_write_long(sb, *recv);
        msg_write_long(sb, transfers.len() as i32);
        for t in transfers {
            msg_write_long(sb, t.patch);
            msg_write_float(sb, t.weight);
        }
    }
}

/// Decode one cluster's transfer results. Any truncation or
/// out-of-range handle is an error; the caller treats that as a
/// protocol desync.
pub fn deserialize_cluster_transfers(
    sb: &mut SizeBuf,
    num_patches: usize,
) -> Result<Vec<(PatchHandle, Vec<Transfer>)>, String> {
    let patch_count = msg_read_long(sb);
    if patch_count < 0 {
        return Err("truncated transfer payload".to_string());
    }
    let mut out = Vec::with_capacity(patch_count as usize);
    for _ in 0..patch_count {
        let recv = msg_read_long(sb);
        let count = msg_read_long(sb);
        if recv < 0 || recv as usize >= num_patches || count < 0 {
            return Err(format!("bad transfer record (patch {})", recv));
        }
        let mut transfers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let patch = msg_read_long(sb);
            let weight = msg_read_float(sb);
            if patch < 0 || patch as usize >= num_patches || !weight.is_finite() {
                return Err(format!("bad transfer entry (patch {})", patch));
            }
            transfers.push(Transfer { patch, weight });
        }
        out.push((recv, transfers));
    }
    Ok(out)
}

/// Merge decoded transfers into the store. Additive into disjoint
/// receivers, so arrival order does not matter.
pub fn merge_cluster_transfers(
    patches: &mut PatchStore,
    results: Vec<(PatchHandle, Vec<Transfer>)>,
) {
    for (recv, transfers) in results {
        patches.get_mut(recv).transfers = transfers;
    }
}

// ============================================================
// Bounce pass
// ============================================================

/// Seed each leaf patch's direct light by gathering at its origin.
pub fn seed_patch_direct_light(
    trace: &TraceContext,
    patches: &mut PatchStore,
    lights: &[DirectLight],
    settings: &RadSettings,
) {
    let leaves: Vec<PatchHandle> = patches.iter_leaves().collect();
    let seeded: Vec<(PatchHandle, [f32; 3])> = leaves
        .par_iter()
        .map(|&h| {
            let p = patches.get(h);
            let light = compute_direct_lighting_at_point(
                trace,
                lights,
                &p.origin,
                &p.plane.normal,
                -1,
                settings,
            );
            (h, light)
        })
        .collect();
    for (h, light) in seeded {
        patches.get_mut(h).directlight = light;
    }
}

/// Iterate the radiosity redistribution: each bounce, every leaf patch
/// gathers its transfer-weighted share of the energy the other patches
/// emitted last bounce. Accumulated bounce light lands in totallight.
pub fn bounce_light(patches: &mut PatchStore, settings: &RadSettings) {
    let handles: Vec<PatchHandle> = patches.iter_leaves().collect();
    let n = patches.len();

    // Energy emitted last bounce, indexed by handle
    let mut emitted = vec![[0.0f32; 3]; n];
    for &h in &handles {
        let p = patches.get(h);
        let seed = [
            p.directlight[0] * p.reflectivity[0] + p.baselight[0],
            p.directlight[1] * p.reflectivity[1] + p.baselight[1],
            p.directlight[2] * p.reflectivity[2] + p.baselight[2],
        ];
        emitted[h as usize] = seed;
    }

    for bounce in 0..settings.num_bounces {
        // Gather phase: read emitted, produce this bounce's arrivals
        let arrivals: Vec<(PatchHandle, [f32; 3])> = handles
            .par_iter()
            .map(|&h| {
                let p = patches.get(h);
                let mut total = [0.0f32; 3];
                for t in &p.transfers {
                    let e = &emitted[t.patch as usize];
                    total[0] += e[0] * t.weight;
                    total[1] += e[1] * t.weight;
                    total[2] += e[2] * t.weight;
                }
                (h, total)
            })
            .collect();

        let mut max_energy = 0.0f32;
        for (h, arrived) in &arrivals {
            let p = patches.get_mut(*h);
            p.totallight.add_to_channel(0, arrived);
            let next = [
                arrived[0] * p.reflectivity[0],
                arrived[1] * p.reflectivity[1],
                arrived[2] * p.reflectivity[2],
            ];
            emitted[*h as usize] = next;
            max_energy = max_energy.max(next[0]).max(next[1]).max(next[2]);
        }

        qdprintf(&format!("bounce {}: max energy {:.3}\n", bounce + 1, max_energy));
        if max_energy < BOUNCE_ENERGY_FLOOR {
            break;
        }
    }
}

// ============================================================
// Tests
// ============================================================
