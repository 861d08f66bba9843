#![allow(clippy::too_many_arguments)]

pub mod distributor;
pub mod packets;
pub mod transport;
pub mod vfs;
