//! Cryptographic building blocks for the session core.
//!
//! This module provides:
//! - The handshake key expansion that turns exchanged key sources into
//!   data-channel key material, preserving the legacy quadrant slicing
//! - Per-direction data-channel cipher contexts (AEAD, or cipher + HMAC)
//! - Key generation bookkeeping across rekeys
//! - Secure random number generation
//!
//! All secret material is zeroized on drop.

mod aead;
mod keys;
mod random;

pub use aead::{AuthMode, DataContext, DirectionKeys, Nonce};
pub use keys::{
    Direction, KeyExpansion, KeyGeneration, KeyKind, KeyRing, KeyRole, KeySource, KeySpecifier,
    RekeyLimits,
};
pub use random::SecureRandom;

/// Size of symmetric cipher keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of HMAC-SHA256 tags on the legacy data-channel framing
pub const HMAC_TAG_SIZE: usize = 32;

/// Size of the handshake key expansion output
pub const KEY_EXPANSION_SIZE: usize = 256;

/// Size of one key-material quadrant
pub const QUADRANT_SIZE: usize = 64;

/// Size of the client-supplied pre-master secret
pub const PRE_MASTER_SIZE: usize = 48;

/// Size of each side's handshake random nonces
pub const RANDOM_SIZE: usize = 32;
