// bspfile.rs — IBSP (version 38) file structures and in-memory map data
//
// The compiler reads every lump it needs for lighting, keeps the raw bytes
// of the lumps it does not interpret, and writes the file back with the
// lighting and pak lumps replaced.

use crate::mathlib::{Plane, Vec3};

// ============================================================
// Identification
// ============================================================

/// BSP magic: "IBSP" in little-endian
pub const IDBSPHEADER: i32 =
    (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'I' as i32;
pub const BSPVERSION: i32 = 38;

// ============================================================
// Map limits
// ============================================================

pub const MAX_MAP_MODELS: usize = 1024;
pub const MAX_MAP_BRUSHES: usize = 8192;
pub const MAX_MAP_ENTSTRING: usize = 0x40000;
pub const MAX_MAP_TEXINFO: usize = 8192;
pub const MAX_MAP_PLANES: usize = 65536;
pub const MAX_MAP_NODES: usize = 65536;
pub const MAX_MAP_BRUSHSIDES: usize = 65536;
pub const MAX_MAP_LEAFS: usize = 65536;
pub const MAX_MAP_VERTS: usize = 65536;
pub const MAX_MAP_FACES: usize = 65536;
pub const MAX_MAP_LEAFFACES: usize = 65536;
pub const MAX_MAP_LEAFBRUSHES: usize = 65536;
pub const MAX_MAP_EDGES: usize = 128000;
pub const MAX_MAP_SURFEDGES: usize = 256000;
pub const MAX_MAP_LIGHTING: usize = 0x800000;
pub const MAX_MAP_VISIBILITY: usize = 0x100000;
pub const MAX_MAP_WORLDLIGHTS: usize = 8192;

// ============================================================
// Lump directory
// ============================================================

pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_PLANES: usize = 1;
pub const LUMP_VERTEXES: usize = 2;
pub const LUMP_VISIBILITY: usize = 3;
pub const LUMP_NODES: usize = 4;
pub const LUMP_TEXINFO: usize = 5;
pub const LUMP_FACES: usize = 6;
pub const LUMP_LIGHTING: usize = 7;
pub const LUMP_LEAFS: usize = 8;
pub const LUMP_LEAFFACES: usize = 9;
pub const LUMP_LEAFBRUSHES: usize = 10;
pub const LUMP_EDGES: usize = 11;
pub const LUMP_SURFEDGES: usize = 12;
pub const LUMP_MODELS: usize = 13;
pub const LUMP_BRUSHES: usize = 14;
pub const LUMP_BRUSHSIDES: usize = 15;
/// Unused by the engine proper; the lighting tools store a PAK directory
/// of side lumps (static prop lighting) here.
pub const LUMP_PAK: usize = 16;
pub const LUMP_AREAS: usize = 17;
pub const LUMP_AREAPORTALS: usize = 18;
pub const HEADER_LUMPS: usize = 19;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DHeader {
    pub ident: i32,
    pub version: i32,
    pub lumps: [Lump; HEADER_LUMPS],
}

// ============================================================
// Disk structures
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DModel {
    pub mins: [f32; 3],
    pub maxs: [f32; 3],
    pub origin: [f32; 3],
    pub headnode: i32,
    pub firstface: i32,
    pub numfaces: i32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DPlane {
    pub normal: [f32; 3],
    pub dist: f32,
    pub plane_type: i32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DNode {
    pub planenum: i32,
    pub children: [i32; 2], // negative numbers are -(leafs+1)
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstface: u16,
    pub numfaces: u16,
}

// Texinfo surface flags
pub const SURF_LIGHT: i32 = 0x1; // value holds the light strength
pub const SURF_SLICK: i32 = 0x2;
pub const SURF_SKY: i32 = 0x4; // lit by the sky environment light
pub const SURF_WARP: i32 = 0x8;
pub const SURF_TRANS33: i32 = 0x10;
pub const SURF_TRANS66: i32 = 0x20;
pub const SURF_NODRAW: i32 = 0x80;
pub const SURF_BUMPLIGHT: i32 = 0x800; // four lightmaps, one per bump basis

#[derive(Debug, Clone)]
#[repr(C)]
pub struct TexInfo {
    /// [s/t][xyz + offset] texture axis projection
    pub vecs: [[f32; 4]; 2],
    pub flags: i32,
    /// Light emission in the engine's light units when SURF_LIGHT is set
    pub value: i32,
    pub texture: [u8; 32],
    pub nexttexinfo: i32,
}

impl TexInfo {
    pub fn texture_name(&self) -> &str {
        let end = self.texture.iter().position(|&c| c == 0).unwrap_or(32);
        std::str::from_utf8(&self.texture[..end]).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DEdge {
    pub v: [u16; 2],
}

pub const MAXLIGHTMAPS: usize = 4;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DFace {
    pub planenum: u16,
    pub side: i16,
    pub firstedge: i32,
    pub numedges: i16,
    pub texinfo: i16,
    pub styles: [u8; MAXLIGHTMAPS],
    pub lightofs: i32,
}

impl Default for DFace {
    fn default() -> Self {
        Self {
            planenum: 0,
            side: 0,
            firstedge: 0,
            numedges: 0,
            texinfo: 0,
            styles: [255; MAXLIGHTMAPS],
            lightofs: -1,
        }
    }
}

// Contents flags (brush occlusion classes the light tracer cares about)
pub const CONTENTS_SOLID: i32 = 0x1;
pub const CONTENTS_WINDOW: i32 = 0x2;
pub const CONTENTS_TRANSLUCENT: i32 = 0x10000000;

/// Everything a light ray stops at.
pub const MASK_LIGHT_OPAQUE: i32 = CONTENTS_SOLID;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DLeaf {
    pub contents: i32,
    pub cluster: i16,
    pub area: i16,
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstleafface: u16,
    pub numleaffaces: u16,
    pub firstleafbrush: u16,
    pub numleafbrushes: u16,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DBrushSide {
    pub planenum: u16,
    pub texinfo: i16,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DBrush {
    pub firstside: i32,
    pub numsides: i32,
    pub contents: i32,
}

// Visibility
pub const DVIS_PVS: usize = 0;
pub const DVIS_PHS: usize = 1;

// ============================================================
// World lights (lighting tool lump, persisted in the incremental file)
// ============================================================

pub const EMIT_SURFACE: i32 = 0;
pub const EMIT_POINT: i32 = 1;
pub const EMIT_SPOTLIGHT: i32 = 2;
pub const EMIT_SKYLIGHT: i32 = 3;
pub const EMIT_SKYAMBIENT: i32 = 4;

pub const DWL_FLAGS_CASTSHADOWS: i32 = 0x1;

/// One compiled light source. Fixed 84-byte little-endian layout; the
/// incremental cache stores these verbatim to detect changed lights.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DWorldLight {
    pub emit_type: i32,
    pub origin: [f32; 3],
    /// Color scaled by intensity, in linear light units
    pub intensity: [f32; 3],
    pub normal: [f32; 3],
    pub cluster: i32,
    /// cos of the inner cone angle (spotlights)
    pub stopdot: f32,
    /// cos of the outer cone angle (spotlights)
    pub stopdot2: f32,
    pub exponent: f32,
    pub radius: f32,
    pub constant_attn: f32,
    pub linear_attn: f32,
    pub quadratic_attn: f32,
    pub flags: i32,
    pub texinfo: i32,
    pub style: i32,
}

pub const DWORLDLIGHT_SIZE: usize = 84;

impl DWorldLight {
    pub fn to_bytes(&self) -> [u8; DWORLDLIGHT_SIZE] {
        let mut out = [0u8; DWORLDLIGHT_SIZE];
        let fields: [f32; 7] = [
            self.stopdot,
            self.stopdot2,
            self.exponent,
            self.radius,
            self.constant_attn,
            self.linear_attn,
            self.quadratic_attn,
        ];
        out[0..4].copy_from_slice(&self.emit_type.to_le_bytes());
        for (i, v) in [self.origin, self.intensity, self.normal].iter().enumerate() {
            for j in 0..3 {
                let o = 4 + (i * 3 + j) * 4;
                out[o..o + 4].copy_from_slice(&v[j].to_le_bytes());
            }
        }
        out[40..44].copy_from_slice(&self.cluster.to_le_bytes());
        for (i, v) in fields.iter().enumerate() {
            let o = 44 + i * 4;
            out[o..o + 4].copy_from_slice(&v.to_le_bytes());
        }
        out[72..76].copy_from_slice(&self.flags.to_le_bytes());
        out[76..80].copy_from_slice(&self.texinfo.to_le_bytes());
        out[80..84].copy_from_slice(&self.style.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<DWorldLight> {
        if data.len() < DWORLDLIGHT_SIZE {
            return None;
        }
        let vec_at = |o: usize| -> [f32; 3] {
            [
                read_f32_le(data, o),
                read_f32_le(data, o + 4),
                read_f32_le(data, o + 8),
            ]
        };
        Some(DWorldLight {
            emit_type: read_i32_le(data, 0),
            origin: vec_at(4),
            intensity: vec_at(16),
            normal: vec_at(28),
            cluster: read_i32_le(data, 40),
            stopdot: read_f32_le(data, 44),
            stopdot2: read_f32_le(data, 48),
            exponent: read_f32_le(data, 52),
            radius: read_f32_le(data, 56),
            constant_attn: read_f32_le(data, 60),
            linear_attn: read_f32_le(data, 64),
            quadratic_attn: read_f32_le(data, 68),
            flags: read_i32_le(data, 72),
            texinfo: read_i32_le(data, 76),
            style: read_i32_le(data, 80),
        })
    }
}

// ============================================================
// Lighting lump color format
// ============================================================

/// One luxel: 8-bit mantissas with a shared signed exponent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ColorRGBExp32 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub exponent: i8,
}

/// Pack a linear-light color into the shared-exponent format. Values are
/// in engine light units where 1.0 maps to mantissa 255 at exponent 0.
pub fn vec_to_color_rgb_exp32(light: &Vec3) -> ColorRGBExp32 {
    let max = light[0].max(light[1]).max(light[2]);
    if max <= 0.0 {
        return ColorRGBExp32 {
            r: 0,
            g: 0,
            b: 0,
            exponent: 0,
        };
    }
    // Scale the largest component into [128, 255]
    let mut exponent: i32 = 0;
    let mut scaled = max * 255.0;
    while scaled > 255.0 && exponent < 127 {
        scaled *= 0.5;
        exponent += 1;
    }
    while scaled <= 127.0 && exponent > -128 {
        scaled *= 2.0;
        exponent -= 1;
    }
    let scale = 255.0 * 0.5f32.powi(exponent);
    let quantize = |c: f32| -> u8 { (c * scale).round().clamp(0.0, 255.0) as u8 };
    ColorRGBExp32 {
        r: quantize(light[0]),
        g: quantize(light[1]),
        b: quantize(light[2]),
        exponent: exponent as i8,
    }
}

pub fn color_rgb_exp32_to_vec(c: &ColorRGBExp32) -> Vec3 {
    let scale = 2.0f32.powi(c.exponent as i32) / 255.0;
    [
        c.r as f32 * scale,
        c.g as f32 * scale,
        c.b as f32 * scale,
    ]
}

// ============================================================
// Byte parsing helpers
// ============================================================

#[inline]
pub fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn lump_slice<'a>(data: &'a [u8], lump: &Lump) -> Result<&'a [u8], String> {
    let ofs = lump.fileofs as usize;
    let len = lump.filelen as usize;
    if ofs + len > data.len() {
        return Err(format!(
            "lump out of range (ofs {} len {} file {})",
            ofs,
            len,
            data.len()
        ));
    }
    Ok(&data[ofs..ofs + len])
}

// ============================================================
// In-memory map
// ============================================================

/// Everything the lighting passes read from and write back to the map.
/// Disk byte order is little-endian throughout; fields are parsed one at
/// a time so the in-memory layout never has to match the file.
#[derive(Default)]
pub struct BspData {
    pub planes: Vec<Plane>,
    pub verts: Vec<Vec3>,
    pub edges: Vec<DEdge>,
    pub surfedges: Vec<i32>,
    pub faces: Vec<DFace>,
    pub texinfo: Vec<TexInfo>,
    pub nodes: Vec<DNode>,
    pub leafs: Vec<DLeaf>,
    pub leaffaces: Vec<u16>,
    pub leafbrushes: Vec<u16>,
    pub brushes: Vec<DBrush>,
    pub brushsides: Vec<DBrushSide>,
    pub models: Vec<DModel>,
    pub entity_string: String,

    /// Raw visibility lump: numclusters, bitofs table, compressed rows
    pub visdata: Vec<u8>,
    pub num_clusters: usize,

    /// Output of the lighting passes
    pub lightdata: Vec<ColorRGBExp32>,

    /// Side files (static prop lighting) packed as a PAK directory
    pub pak_entries: Vec<(String, Vec<u8>)>,

    /// Lumps this tool does not interpret, preserved for write-back
    raw_lumps: Vec<Vec<u8>>,
}

impl BspData {
    pub fn load_from_bytes(data: &[u8]) -> Result<BspData, String> {
        if data.len() < 8 + HEADER_LUMPS * 8 {
            return Err("file too small for BSP header".to_string());
        }
        let ident = read_i32_le(data, 0);
        let version = read_i32_le(data, 4);
        if ident != IDBSPHEADER {
            return Err(format!("not an IBSP file (ident 0x{:08x})", ident));
        }
        if version != BSPVERSION {
            return Err(format!(
                "wrong BSP version {} (expected {})",
                version, BSPVERSION
            ));
        }

        let mut lumps = [Lump::default(); HEADER_LUMPS];
        for (i, lump) in lumps.iter_mut().enumerate() {
            lump.fileofs = read_i32_le(data, 8 + i * 8);
            lump.filelen = read_i32_le(data, 8 + i * 8 + 4);
        }

        let mut bsp = BspData {
            raw_lumps: Vec::with_capacity(HEADER_LUMPS),
            ..Default::default()
        };
        for lump in &lumps {
            bsp.raw_lumps.push(lump_slice(data, lump)?.to_vec());
        }

        bsp.load_planes(lump_slice(data, &lumps[LUMP_PLANES])?)?;
        bsp.load_verts(lump_slice(data, &lumps[LUMP_VERTEXES])?)?;
        bsp.load_edges(lump_slice(data, &lumps[LUMP_EDGES])?)?;
        bsp.load_surfedges(lump_slice(data, &lumps[LUMP_SURFEDGES])?)?;
        bsp.load_faces(lump_slice(data, &lumps[LUMP_FACES])?)?;
        bsp.load_texinfo(lump_slice(data, &lumps[LUMP_TEXINFO])?)?;
        bsp.load_nodes(lump_slice(data, &lumps[LUMP_NODES])?)?;
        bsp.load_leafs(lump_slice(data, &lumps[LUMP_LEAFS])?)?;
        bsp.load_leaffaces(lump_slice(data, &lumps[LUMP_LEAFFACES])?)?;
        bsp.load_leafbrushes(lump_slice(data, &lumps[LUMP_LEAFBRUSHES])?)?;
        bsp.load_brushes(lump_slice(data, &lumps[LUMP_BRUSHES])?)?;
        bsp.load_brushsides(lump_slice(data, &lumps[LUMP_BRUSHSIDES])?)?;
        bsp.load_models(lump_slice(data, &lumps[LUMP_MODELS])?)?;
        bsp.load_visibility(lump_slice(data, &lumps[LUMP_VISIBILITY])?)?;
        bsp.load_entity_string(lump_slice(data, &lumps[LUMP_ENTITIES])?)?;
        bsp.load_lighting(lump_slice(data, &lumps[LUMP_LIGHTING])?)?;
        bsp.load_pak(lump_slice(data, &lumps[LUMP_PAK])?);

        Ok(bsp)
    }

    fn load_planes(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 20;
        let count = data.len() / SIZE;
        if count > MAX_MAP_PLANES {
            return Err(format!("map has too many planes ({})", count));
        }
        self.planes.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            let normal = [
                read_f32_le(data, o),
                read_f32_le(data, o + 4),
                read_f32_le(data, o + 8),
            ];
            let dist = read_f32_le(data, o + 12);
            let ptype = read_i32_le(data, o + 16);
            self.planes.push(Plane {
                normal,
                dist,
                ptype,
            });
        }
        Ok(())
    }

    fn load_verts(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 12;
        let count = data.len() / SIZE;
        if count > MAX_MAP_VERTS {
            return Err(format!("map has too many vertexes ({})", count));
        }
        self.verts.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            self.verts.push([
                read_f32_le(data, o),
                read_f32_le(data, o + 4),
                read_f32_le(data, o + 8),
            ]);
        }
        Ok(())
    }

    fn load_edges(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 4;
        let count = data.len() / SIZE;
        if count > MAX_MAP_EDGES {
            return Err(format!("map has too many edges ({})", count));
        }
        self.edges.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            self.edges.push(DEdge {
                v: [read_u16_le(data, o), read_u16_le(data, o + 2)],
            });
        }
        Ok(())
    }

    fn load_surfedges(&mut self, data: &[u8]) -> Result<(), String> {
        let count = data.len() / 4;
        if count > MAX_MAP_SURFEDGES {
            return Err(format!("map has too many surfedges ({})", count));
        }
        self.surfedges.reserve(count);
        for i in 0..count {
            self.surfedges.push(read_i32_le(data, i * 4));
        }
        Ok(())
    }

    fn load_faces(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 20;
        let count = data.len() / SIZE;
        if count > MAX_MAP_FACES {
            return Err(format!("map has too many faces ({})", count));
        }
        self.faces.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            let mut styles = [0u8; MAXLIGHTMAPS];
            styles.copy_from_slice(&data[o + 12..o + 16]);
            self.faces.push(DFace {
                planenum: read_u16_le(data, o),
                side: read_i16_le(data, o + 2),
                firstedge: read_i32_le(data, o + 4),
                numedges: read_i16_le(data, o + 8),
                texinfo: read_i16_le(data, o + 10),
                styles,
                lightofs: read_i32_le(data, o + 16),
            });
        }
        Ok(())
    }

    fn load_texinfo(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 76;
        let count = data.len() / SIZE;
        if count > MAX_MAP_TEXINFO {
            return Err(format!("map has too many texinfos ({})", count));
        }
        self.texinfo.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            let mut vecs = [[0.0f32; 4]; 2];
            for (j, row) in vecs.iter_mut().enumerate() {
                for (k, v) in row.iter_mut().enumerate() {
                    *v = read_f32_le(data, o + (j * 4 + k) * 4);
                }
            }
            let mut texture = [0u8; 32];
            texture.copy_from_slice(&data[o + 40..o + 72]);
            self.texinfo.push(TexInfo {
                vecs,
                flags: read_i32_le(data, o + 32),
                value: read_i32_le(data, o + 36),
                texture,
                nexttexinfo: read_i32_le(data, o + 72),
            });
        }
        Ok(())
    }

    fn load_nodes(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 28;
        let count = data.len() / SIZE;
        if count > MAX_MAP_NODES {
            return Err(format!("map has too many nodes ({})", count));
        }
        self.nodes.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            let mut node = DNode {
                planenum: read_i32_le(data, o),
                children: [read_i32_le(data, o + 4), read_i32_le(data, o + 8)],
                ..Default::default()
            };
            for j in 0..3 {
                node.mins[j] = read_i16_le(data, o + 12 + j * 2);
                node.maxs[j] = read_i16_le(data, o + 18 + j * 2);
            }
            node.firstface = read_u16_le(data, o + 24);
            node.numfaces = read_u16_le(data, o + 26);
            self.nodes.push(node);
        }
        Ok(())
    }

    fn load_leafs(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 28;
        let count = data.len() / SIZE;
        if count > MAX_MAP_LEAFS {
            return Err(format!("map has too many leafs ({})", count));
        }
        self.leafs.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            let mut leaf = DLeaf {
                contents: read_i32_le(data, o),
                cluster: read_i16_le(data, o + 4),
                area: read_i16_le(data, o + 6),
                ..Default::default()
            };
            for j in 0..3 {
                leaf.mins[j] = read_i16_le(data, o + 8 + j * 2);
                leaf.maxs[j] = read_i16_le(data, o + 14 + j * 2);
            }
            leaf.firstleafface = read_u16_le(data, o + 20);
            leaf.numleaffaces = read_u16_le(data, o + 22);
            leaf.firstleafbrush = read_u16_le(data, o + 24);
            leaf.numleafbrushes = read_u16_le(data, o + 26);
            self.leafs.push(leaf);
        }
        Ok(())
    }

    fn load_leaffaces(&mut self, data: &[u8]) -> Result<(), String> {
        let count = data.len() / 2;
        if count > MAX_MAP_LEAFFACES {
            return Err(format!("map has too many leaffaces ({})", count));
        }
        self.leaffaces.reserve(count);
        for i in 0..count {
            self.leaffaces.push(read_u16_le(data, i * 2));
        }
        Ok(())
    }

    fn load_leafbrushes(&mut self, data: &[u8]) -> Result<(), String> {
        let count = data.len() / 2;
        if count > MAX_MAP_LEAFBRUSHES {
            return Err(format!("map has too many leafbrushes ({})", count));
        }
        self.leafbrushes.reserve(count);
        for i in 0..count {
            self.leafbrushes.push(read_u16_le(data, i * 2));
        }
        Ok(())
    }

    fn load_brushes(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 12;
        let count = data.len() / SIZE;
        if count > MAX_MAP_BRUSHES {
            return Err(format!("map has too many brushes ({})", count));
        }
        self.brushes.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            self.brushes.push(DBrush {
                firstside: read_i32_le(data, o),
                numsides: read_i32_le(data, o + 4),
                contents: read_i32_le(data, o + 8),
            });
        }
        Ok(())
    }

    fn load_brushsides(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 4;
        let count = data.len() / SIZE;
        if count > MAX_MAP_BRUSHSIDES {
            return Err(format!("map has too many brushsides ({})", count));
        }
        self.brushsides.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            self.brushsides.push(DBrushSide {
                planenum: read_u16_le(data, o),
                texinfo: read_i16_le(data, o + 2),
            });
        }
        Ok(())
    }

    fn load_models(&mut self, data: &[u8]) -> Result<(), String> {
        const SIZE: usize = 48;
        let count = data.len() / SIZE;
        if count > MAX_MAP_MODELS {
            return Err(format!("map has too many models ({})", count));
        }
        self.models.reserve(count);
        for i in 0..count {
            let o = i * SIZE;
            let mut model = DModel::default();
            for j in 0..3 {
                model.mins[j] = read_f32_le(data, o + j * 4);
                model.maxs[j] = read_f32_le(data, o + 12 + j * 4);
                model.origin[j] = read_f32_le(data, o + 24 + j * 4);
            }
            model.headnode = read_i32_le(data, o + 36);
            model.firstface = read_i32_le(data, o + 40);
            model.numfaces = read_i32_le(data, o + 44);
            self.models.push(model);
        }
        Ok(())
    }

    fn load_visibility(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() > MAX_MAP_VISIBILITY {
            return Err(format!("visibility lump too large ({})", data.len()));
        }
        self.visdata = data.to_vec();
        self.num_clusters = if data.len() >= 4 {
            read_i32_le(data, 0) as usize
        } else {
            0
        };
        Ok(())
    }

    fn load_entity_string(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() > MAX_MAP_ENTSTRING {
            return Err(format!("entity string too large ({})", data.len()));
        }
        let end = data.iter().position(|&c| c == 0).unwrap_or(data.len());
        self.entity_string = String::from_utf8_lossy(&data[..end]).into_owned();
        Ok(())
    }

    fn load_lighting(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() > MAX_MAP_LIGHTING {
            return Err(format!("lighting lump too large ({})", data.len()));
        }
        let count = data.len() / 4;
        self.lightdata.reserve(count);
        for i in 0..count {
            let o = i * 4;
            self.lightdata.push(ColorRGBExp32 {
                r: data[o],
                g: data[o + 1],
                b: data[o + 2],
                exponent: data[o + 3] as i8,
            });
        }
        Ok(())
    }

    fn load_pak(&mut self, data: &[u8]) {
        self.pak_entries = crate::pakfile::parse_pak(data).unwrap_or_default();
    }

    // ========================================================
    // Derived queries
    // ========================================================

    /// Cluster containing `leaf`, or -1 for solid leafs.
    pub fn leaf_cluster(&self, leaf: usize) -> i32 {
        self.leafs[leaf].cluster as i32
    }

    /// Byte offset of a cluster's compressed PVS row, if visibility exists.
    pub fn cluster_vis_offset(&self, cluster: usize, set: usize) -> Option<usize> {
        if self.visdata.len() < 4 || cluster >= self.num_clusters {
            return None;
        }
        let o = 4 + cluster * 8 + set * 4;
        if o + 4 > self.visdata.len() {
            return None;
        }
        Some(read_i32_le(&self.visdata, o) as usize)
    }

    /// Face plane with the side flip applied.
    pub fn face_plane(&self, face: &DFace) -> Plane {
        let mut plane = self.planes[face.planenum as usize];
        if face.side != 0 {
            plane.normal = crate::mathlib::vector_negate(&plane.normal);
            plane.dist = -plane.dist;
        }
        plane
    }

    /// Ordered vertex positions of a face, following surfedge direction.
    pub fn face_winding(&self, face: &DFace) -> crate::winding::Winding {
        let mut points = Vec::with_capacity(face.numedges as usize);
        for i in 0..face.numedges as usize {
            let se = self.surfedges[face.firstedge as usize + i];
            let v = if se >= 0 {
                self.edges[se as usize].v[0]
            } else {
                self.edges[(-se) as usize].v[1]
            };
            points.push(self.verts[v as usize]);
        }
        crate::winding::Winding::new(points)
    }

    // ========================================================
    // Write-back
    // ========================================================

    /// Serialize the whole map, replacing the lighting and pak lumps with
    /// this run's output and preserving every other lump byte-for-byte.
    pub fn save_to_bytes(&self) -> Vec<u8> {
        let mut lighting = Vec::with_capacity(self.lightdata.len() * 4);
        for c in &self.lightdata {
            lighting.extend_from_slice(&[c.r, c.g, c.b, c.exponent as u8]);
        }
        let pak = crate::pakfile::build_pak(&self.pak_entries);

        let header_size = 8 + HEADER_LUMPS * 8;
        let mut out = vec![0u8; header_size];
        out[0..4].copy_from_slice(&IDBSPHEADER.to_le_bytes());
        out[4..8].copy_from_slice(&BSPVERSION.to_le_bytes());

        for i in 0..HEADER_LUMPS {
            let payload: &[u8] = match i {
                LUMP_LIGHTING => &lighting,
                LUMP_PAK => &pak,
                _ => &self.raw_lumps[i],
            };
            let ofs = out.len() as i32;
            out.extend_from_slice(payload);
            // 4-byte align each lump
            while out.len() % 4 != 0 {
                out.push(0);
            }
            let dir = 8 + i * 8;
            out[dir..dir + 4].copy_from_slice(&ofs.to_le_bytes());
            out[dir + 4..dir + 8].copy_from_slice(&(payload.len() as i32).to_le_bytes());
        }
        out
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    // Layout-critical disk structs

    #[test]
    fn size_of_dface() {
        // planenum(2) + side(2) + firstedge(4) + numedges(2) + texinfo(2)
        // + styles(4) + lightofs(4) = 20
        assert_eq!(size_of::<DFace>(), 20);
    }

    #[test]
    fn size_of_dnode() {
        assert_eq!(size_of::<DNode>(), 28);
    }

    #[test]
    fn size_of_dleaf() {
        assert_eq!(size_of::<DLeaf>(), 28);
    }

    #[test]
    fn size_of_color_rgb_exp32() {
        assert_eq!(size_of::<ColorRGBExp32>(), 4);
    }

    #[test]
    fn worldlight_round_trip() {
        let light = DWorldLight {
            emit_type: EMIT_SPOTLIGHT,
            origin: [1.0, 2.0, 3.0],
            intensity: [100.0, 90.0, 80.0],
            normal: [0.0, 0.0, -1.0],
            cluster: 7,
            stopdot: 0.9,
            stopdot2: 0.7,
            exponent: 1.0,
            radius: 0.0,
            constant_attn: 0.0,
            linear_attn: 0.0,
            quadratic_attn: 1.0,
            flags: DWL_FLAGS_CASTSHADOWS,
            texinfo: -1,
            style: 0,
        };
        let bytes = light.to_bytes();
        assert_eq!(bytes.len(), DWORLDLIGHT_SIZE);
        let back = DWorldLight::from_bytes(&bytes).unwrap();
        assert_eq!(light, back);
    }

    #[test]
    fn color_exp32_round_trip_tolerance() {
        for value in [[0.5f32, 0.25, 0.125], [2.0, 1.0, 0.5], [0.0, 0.0, 0.0]] {
            let packed = vec_to_color_rgb_exp32(&value);
            let back = color_rgb_exp32_to_vec(&packed);
            for i in 0..3 {
                assert!(
                    (back[i] - value[i]).abs() <= value[i] * 0.02 + 1e-3,
                    "{:?} -> {:?} -> {:?}",
                    value,
                    packed,
                    back
                );
            }
        }
    }

    #[test]
    fn color_exp32_black() {
        let packed = vec_to_color_rgb_exp32(&[0.0, 0.0, 0.0]);
        assert_eq!(packed, ColorRGBExp32::default());
    }

    /// Minimal one-triangle map, hand-assembled byte by byte.
    fn tiny_map_bytes() -> Vec<u8> {
        let mut lumps: Vec<Vec<u8>> = vec![Vec::new(); HEADER_LUMPS];

        // One z-up plane at z = 0
        let mut planes = Vec::new();
        for v in [0.0f32, 0.0, 1.0, 0.0] {
            planes.extend_from_slice(&v.to_le_bytes());
        }
        planes.extend_from_slice(&2i32.to_le_bytes()); // PLANE_Z
        lumps[LUMP_PLANES] = planes;

        // Triangle vertexes
        let mut verts = Vec::new();
        for p in [[0.0f32, 0.0, 0.0], [64.0, 0.0, 0.0], [0.0, 64.0, 0.0]] {
            for c in p {
                verts.extend_from_slice(&c.to_le_bytes());
            }
        }
        lumps[LUMP_VERTEXES] = verts;

        // Edges 0->1, 1->2, 2->0 (edge 0 is conventionally unused but
        // keeping it simple here)
        let mut edges = Vec::new();
        for e in [[0u16, 1], [1, 2], [2, 0]] {
            edges.extend_from_slice(&e[0].to_le_bytes());
            edges.extend_from_slice(&e[1].to_le_bytes());
        }
        lumps[LUMP_EDGES] = edges;

        let mut surfedges = Vec::new();
        for se in [0i32, 1, 2] {
            surfedges.extend_from_slice(&se.to_le_bytes());
        }
        lumps[LUMP_SURFEDGES] = surfedges;

        // One face over those surfedges
        let mut face = Vec::new();
        face.extend_from_slice(&0u16.to_le_bytes()); // planenum
        face.extend_from_slice(&0i16.to_le_bytes()); // side
        face.extend_from_slice(&0i32.to_le_bytes()); // firstedge
        face.extend_from_slice(&3i16.to_le_bytes()); // numedges
        face.extend_from_slice(&0i16.to_le_bytes()); // texinfo
        face.extend_from_slice(&[0, 255, 255, 255]); // styles
        face.extend_from_slice(&(-1i32).to_le_bytes()); // lightofs
        lumps[LUMP_FACES] = face;

        // One texinfo projecting onto xy
        let mut ti = Vec::new();
        for v in [1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0] {
            ti.extend_from_slice(&v.to_le_bytes());
        }
        ti.extend_from_slice(&0i32.to_le_bytes()); // flags
        ti.extend_from_slice(&0i32.to_le_bytes()); // value
        ti.extend_from_slice(&[0u8; 32]); // texture name
        ti.extend_from_slice(&(-1i32).to_le_bytes()); // nexttexinfo
        lumps[LUMP_TEXINFO] = ti;

        lumps[LUMP_ENTITIES] = b"{ \"classname\" \"worldspawn\" }\0".to_vec();

        let mut out = vec![0u8; 8 + HEADER_LUMPS * 8];
        out[0..4].copy_from_slice(&IDBSPHEADER.to_le_bytes());
        out[4..8].copy_from_slice(&BSPVERSION.to_le_bytes());
        for (i, lump) in lumps.iter().enumerate() {
            let ofs = out.len() as i32;
            out.extend_from_slice(lump);
            let dir = 8 + i * 8;
            out[dir..dir + 4].copy_from_slice(&ofs.to_le_bytes());
            out[dir + 4..dir + 8].copy_from_slice(&(lump.len() as i32).to_le_bytes());
        }
        out
    }

    #[test]
    fn load_parses_tiny_map() {
        let bsp = BspData::load_from_bytes(&tiny_map_bytes()).unwrap();
        assert_eq!(bsp.planes.len(), 1);
        assert_eq!(bsp.verts.len(), 3);
        assert_eq!(bsp.faces.len(), 1);
        assert_eq!(bsp.texinfo.len(), 1);
        assert!(bsp.entity_string.contains("worldspawn"));

        let w = bsp.face_winding(&bsp.faces[0]);
        assert_eq!(w.num_points(), 3);
        assert!((w.area() - 2048.0).abs() < 0.1);
    }

    #[test]
    fn save_replaces_lighting_and_preserves_geometry() {
        let mut bsp = BspData::load_from_bytes(&tiny_map_bytes()).unwrap();
        bsp.lightdata = vec![
            ColorRGBExp32 {
                r: 10,
                g: 20,
                b: 30,
                exponent: 0,
            };
            4
        ];
        bsp.faces[0].lightofs = 0;

        let saved = bsp.save_to_bytes();
        let back = BspData::load_from_bytes(&saved).unwrap();
        assert_eq!(back.verts, bsp.verts);
        assert_eq!(back.lightdata.len(), 4);
        assert_eq!(back.lightdata[0].b, 30);
        assert_eq!(back.faces[0].lightofs, 0);
        assert!(back.entity_string.contains("worldspawn"));
    }

    #[test]
    fn load_rejects_wrong_version() {
        let mut bytes = tiny_map_bytes();
        bytes[4..8].copy_from_slice(&99i32.to_le_bytes());
        assert!(BspData::load_from_bytes(&bytes).is_err());
    }
}
