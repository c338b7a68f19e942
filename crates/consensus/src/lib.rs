//! Chain-wide constants and network parameters shared across validation.

pub mod constants;
pub mod params;

/// A 32-byte blake2b hash, used for block, kernel, and MMR identities.
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the "no hash" sentinel in locators.
pub const ZERO_HASH: Hash256 = [0u8; 32];
