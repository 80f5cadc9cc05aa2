//! Pure, deterministic gate logic. No I/O.

pub mod chain;
pub mod classifier;
pub mod ids;
pub mod phases;
pub mod types;
