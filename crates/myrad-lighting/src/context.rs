// context.rs — run configuration and the owning lighting context

use std::path::PathBuf;

use myrad_common::bspfile::BspData;

use crate::facelight::FaceLight;
use crate::incremental::Incremental;
use crate::lights::DirectLight;
use crate::patch::{PatchStore, DEFAULT_CHOP};

/// Knobs for one compile, built by the CLI layer and passed by
/// reference into every pass.
#[derive(Debug, Clone)]
pub struct RadSettings {
    /// Maximum patch edge length in world units
    pub chop: f32,
    /// Radiosity bounce iterations
    pub num_bounces: i32,
    /// Quarter the hemisphere ray count for quick preview compiles
    pub fast: bool,
    /// Multiplier on sky/indirect hemisphere sample counts
    pub sky_sample_scale: f32,
    /// Worker threads for the local pass loops (0 = rayon default)
    pub threads: usize,
    /// Global multiplier applied to all direct light intensity
    pub light_scale: f32,
    /// Incremental cache path; None disables incremental lighting
    pub incremental_file: Option<PathBuf>,
}

impl Default for RadSettings {
    fn default() -> Self {
        Self {
            chop: DEFAULT_CHOP,
            num_bounces: 8,
            fast: false,
            sky_sample_scale: 1.0,
            threads: 0,
            light_scale: 1.0,
            incremental_file: None,
        }
    }
}

/// Owns every collection the lighting passes read and write: the map,
/// the patch arena, per-face lighting, the active light list, and the
/// incremental cache. Passed by reference so nothing lives in module
/// globals.
pub struct LightingContext {
    pub settings: RadSettings,
    pub bsp: BspData,
    pub patches: PatchStore,
    pub facelights: Vec<FaceLight>,
    pub activelights: Vec<DirectLight>,
    pub incremental: Option<Incremental>,
}

impl LightingContext {
    pub fn new(bsp: BspData, settings: RadSettings) -> LightingContext {
        let num_faces = bsp.faces.len();
        LightingContext {
            settings,
            bsp,
            patches: PatchStore::new(num_faces),
            facelights: (0..num_faces).map(|_| FaceLight::default()).collect(),
            activelights: Vec::new(),
            incremental: None,
        }
    }
}
