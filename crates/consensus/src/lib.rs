//! Chain constants, parameters, and the proof-of-work difficulty verifier.

pub mod constants;
pub mod difficulty;
pub mod params;

/// Little-endian 32-byte hash, as it appears on the wire.
pub type Hash256 = [u8; 32];

pub use params::{chain_params, ChainParams, Checkpoint, Network};
