#![allow(clippy::needless_range_loop, clippy::too_many_arguments, clippy::float_cmp,
         clippy::manual_range_contains, clippy::identity_op)]

pub mod bspfile;
pub mod checksum;
pub mod compression;
pub mod console;
pub mod entdata;
pub mod mathlib;
pub mod msgbuf;
pub mod pakfile;
pub mod trace;
pub mod winding;
