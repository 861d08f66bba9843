#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp)]

pub mod context;
pub mod facelight;
pub mod gather;
pub mod incremental;
pub mod lights;
pub mod lightval;
pub mod patch;
pub mod radial;
pub mod sampler;
pub mod staticprop;
pub mod transfers;
