//! Chip-level wire protocols.

pub mod bm13xx;
