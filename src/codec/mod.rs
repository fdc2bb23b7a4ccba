//! Erasure coding for the L3 group level (spec §4 component 4).

pub mod galois;
pub mod reed_solomon;
