//! Handshake key material.
//!
//! Each handshake (and each rekey) exchanges a pair of key sources over the
//! control channel: the client contributes a pre-master secret plus two
//! random nonces, the server contributes two nonces. A pseudorandom
//! expansion of the pre-master, both random sets, and both 64-bit session
//! ids produces 256 bytes, sliced into four 64-byte quadrants selected by a
//! three-bit key specifier. The slicing is kept exactly as legacy peers
//! expect it; only the PRF primitive is modernised.

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{
    SecureRandom, KEY_EXPANSION_SIZE, PRE_MASTER_SIZE, QUADRANT_SIZE, RANDOM_SIZE,
};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// One side's contribution to the data-channel keys.
///
/// The pre-master is only populated on the client side; the server's copy
/// stays zero and is excluded from its wire encoding.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySource {
    pre_master: [u8; PRE_MASTER_SIZE],
    random1: [u8; RANDOM_SIZE],
    random2: [u8; RANDOM_SIZE],
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("KeySource(..)")
    }
}

impl KeySource {
    /// Generate a client key source (pre-master + two nonces).
    pub fn new_client() -> Self {
        Self {
            pre_master: SecureRandom::bytes(),
            random1: SecureRandom::bytes(),
            random2: SecureRandom::bytes(),
        }
    }

    /// Generate a server key source (nonces only).
    pub fn new_server() -> Self {
        Self {
            pre_master: [0u8; PRE_MASTER_SIZE],
            random1: SecureRandom::bytes(),
            random2: SecureRandom::bytes(),
        }
    }

    /// Wire encoding for the key-exchange message.
    pub fn encode(&self, include_pre_master: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(PRE_MASTER_SIZE + 2 * RANDOM_SIZE);
        if include_pre_master {
            out.extend_from_slice(&self.pre_master);
        }
        out.extend_from_slice(&self.random1);
        out.extend_from_slice(&self.random2);
        out
    }

    /// Parse a key source from its wire encoding.
    pub fn decode(data: &[u8], has_pre_master: bool) -> Result<Self> {
        let expected = if has_pre_master {
            PRE_MASTER_SIZE + 2 * RANDOM_SIZE
        } else {
            2 * RANDOM_SIZE
        };
        if data.len() != expected {
            return Err(Error::crypto(format!(
                "key source length {} != {expected}",
                data.len()
            )));
        }
        let mut src = Self {
            pre_master: [0u8; PRE_MASTER_SIZE],
            random1: [0u8; RANDOM_SIZE],
            random2: [0u8; RANDOM_SIZE],
        };
        let mut pos = 0;
        if has_pre_master {
            src.pre_master.copy_from_slice(&data[..PRE_MASTER_SIZE]);
            pos = PRE_MASTER_SIZE;
        }
        src.random1.copy_from_slice(&data[pos..pos + RANDOM_SIZE]);
        src.random2
            .copy_from_slice(&data[pos + RANDOM_SIZE..pos + 2 * RANDOM_SIZE]);
        Ok(src)
    }
}

/// Data-channel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Key material kind within a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Cipher,
    Hmac,
}

/// Three-bit selector mapping (kind, direction, inverse) onto a quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpecifier {
    pub kind: KeyKind,
    pub direction: Direction,
    /// Set on the side that uses the peer's directional layout.
    pub inverse: bool,
}

impl KeySpecifier {
    /// Build a specifier.
    pub fn new(kind: KeyKind, direction: Direction, inverse: bool) -> Self {
        Self {
            kind,
            direction,
            inverse,
        }
    }

    /// Quadrant index in the 256-byte expansion.
    pub fn slot(self) -> usize {
        let dir = matches!(self.direction, Direction::Decrypt) as usize ^ self.inverse as usize;
        let kind = matches!(self.kind, KeyKind::Hmac) as usize;
        dir * 2 + kind
    }
}

/// The 256-byte handshake expansion, sliced into four 64-byte quadrants.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyExpansion([u8; KEY_EXPANSION_SIZE]);

impl KeyExpansion {
    /// Expand both key sources and session ids into data-channel material.
    ///
    /// Seed layout (client randoms, then server randoms, then both session
    /// ids) and the quadrant slicing are the wire-compat surface; both sides
    /// must run this with identical inputs.
    pub fn generate(
        client: &KeySource,
        server: &KeySource,
        client_session_id: &[u8; 8],
        server_session_id: &[u8; 8],
    ) -> Self {
        let mut seed = Vec::with_capacity(4 * RANDOM_SIZE + 16 + KEY_EXPANSION_LABEL.len());
        seed.extend_from_slice(KEY_EXPANSION_LABEL);
        seed.extend_from_slice(&client.random1);
        seed.extend_from_slice(&client.random2);
        seed.extend_from_slice(&server.random1);
        seed.extend_from_slice(&server.random2);
        seed.extend_from_slice(client_session_id);
        seed.extend_from_slice(server_session_id);

        let mut out = [0u8; KEY_EXPANSION_SIZE];
        prf_expand(&client.pre_master, &seed, &mut out);
        seed.zeroize();
        Self(out)
    }

    /// The 64-byte quadrant selected by a specifier.
    pub fn quadrant(&self, spec: KeySpecifier) -> &[u8; QUADRANT_SIZE] {
        let start = spec.slot() * QUADRANT_SIZE;
        self.0[start..start + QUADRANT_SIZE]
            .try_into()
            .expect("quadrant slicing is exact")
    }
}

const KEY_EXPANSION_LABEL: &[u8] = b"data channel key expansion";

/// P_hash-style PRF over HMAC-SHA256: chained A(i) blocks concatenated and
/// truncated to the output length.
fn prf_expand(secret: &[u8], seed: &[u8], out: &mut [u8]) {
    let mut a: Vec<u8> = seed.to_vec();
    let mut pos = 0;
    while pos < out.len() {
        // A(i) = HMAC(secret, A(i-1))
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        // output block = HMAC(secret, A(i) || seed)
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
        mac.update(&a);
        mac.update(seed);
        let block = mac.finalize().into_bytes();

        let n = block.len().min(out.len() - pos);
        out[pos..pos + n].copy_from_slice(&block[..n]);
        pos += n;
    }
    a.zeroize();
}

/// When a generation must be replaced.
#[derive(Debug, Clone, Copy)]
pub struct RekeyLimits {
    /// Seconds since install (0 disables).
    pub reneg_secs: u64,
    /// Bytes carried since install.
    pub reneg_bytes: Option<u64>,
    /// Packets carried since install.
    pub reneg_pkts: Option<u64>,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            reneg_secs: 3600,
            reneg_bytes: None,
            reneg_pkts: None,
        }
    }
}

impl RekeyLimits {
    /// Whether a generation with the given usage is due for replacement.
    pub fn due(&self, age: Duration, bytes: u64, packets: u64) -> bool {
        if self.reneg_secs > 0 && age >= Duration::from_secs(self.reneg_secs) {
            return true;
        }
        if let Some(limit) = self.reneg_bytes {
            if bytes >= limit {
                return true;
            }
        }
        if let Some(limit) = self.reneg_pkts {
            if packets >= limit {
                return true;
            }
        }
        false
    }
}

/// Lifecycle role of an installed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    /// Carries new traffic.
    Primary,
    /// Negotiated, not yet promoted.
    Secondary,
    /// Retired, draining in-flight packets.
    LameDuck,
}

/// One installed key generation and its usage counters.
pub struct KeyGeneration<T> {
    pub key_id: u8,
    pub context: T,
    pub installed: Instant,
    pub bytes: u64,
    pub packets: u64,
}

impl<T> KeyGeneration<T> {
    fn new(key_id: u8, context: T, now: Instant) -> Self {
        Self {
            key_id,
            context,
            installed: now,
            bytes: 0,
            packets: 0,
        }
    }

    /// Record traffic carried by this generation.
    pub fn account(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.packets += 1;
    }
}

/// The set of live key generations.
///
/// Exactly one primary exists once the first handshake completes; at most
/// one secondary is pending promotion and at most one lame duck drains
/// in-flight packets after a swap.
pub struct KeyRing<T> {
    primary: Option<KeyGeneration<T>>,
    secondary: Option<KeyGeneration<T>>,
    lame_duck: Option<KeyGeneration<T>>,
    lame_duck_retire: Option<Instant>,
}

impl<T> KeyRing<T> {
    /// An empty ring.
    pub fn new() -> Self {
        Self {
            primary: None,
            secondary: None,
            lame_duck: None,
            lame_duck_retire: None,
        }
    }

    /// Whether any generation is installed.
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// The current primary.
    pub fn primary(&self) -> Option<&KeyGeneration<T>> {
        self.primary.as_ref()
    }

    /// Mutable access to the current primary.
    pub fn primary_mut(&mut self) -> Option<&mut KeyGeneration<T>> {
        self.primary.as_mut()
    }

    /// Install the first generation as primary.
    pub fn install_first(&mut self, key_id: u8, context: T, now: Instant) -> Result<()> {
        if self.primary.is_some() {
            return Err(Error::crypto("primary generation already installed"));
        }
        self.primary = Some(KeyGeneration::new(key_id, context, now));
        Ok(())
    }

    /// Install a freshly negotiated generation as secondary.
    pub fn install_secondary(&mut self, key_id: u8, context: T, now: Instant) -> Result<()> {
        if self.secondary.is_some() {
            return Err(Error::crypto("secondary generation already pending"));
        }
        self.secondary = Some(KeyGeneration::new(key_id, context, now));
        Ok(())
    }

    /// Promote the secondary to primary. The old primary becomes a lame duck
    /// that retires after `grace`; a previous lame duck is dropped.
    pub fn promote_secondary(&mut self, now: Instant, grace: Duration) -> Result<()> {
        let next = self
            .secondary
            .take()
            .ok_or_else(|| Error::crypto("no secondary generation to promote"))?;
        if let Some(old) = self.primary.replace(next) {
            self.lame_duck = Some(old);
            self.lame_duck_retire = Some(now + grace);
        }
        Ok(())
    }

    /// Drop the lame duck if its grace period has passed. Returns whether it
    /// was retired.
    pub fn retire_expired(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.lame_duck_retire {
            if now >= deadline {
                self.lame_duck = None;
                self.lame_duck_retire = None;
                return true;
            }
        }
        false
    }

    /// Generation that can decrypt traffic on `key_id`, with its role.
    pub fn lookup_mut(&mut self, key_id: u8) -> Option<(&mut KeyGeneration<T>, KeyRole)> {
        if let Some(gen) = self.primary.as_mut() {
            if gen.key_id == key_id {
                return Some((gen, KeyRole::Primary));
            }
        }
        if let Some(gen) = self.secondary.as_mut() {
            if gen.key_id == key_id {
                return Some((gen, KeyRole::Secondary));
            }
        }
        if let Some(gen) = self.lame_duck.as_mut() {
            if gen.key_id == key_id {
                return Some((gen, KeyRole::LameDuck));
            }
        }
        None
    }

    /// Key id for the next negotiation: `(primary + 1) mod 8`, skipping the
    /// lame duck's id and the reserved initial id 0.
    pub fn next_key_id(&self) -> u8 {
        let current = self.primary.as_ref().map(|g| g.key_id).unwrap_or(0);
        let mut next = (current + 1) % 8;
        loop {
            let taken = next == 0
                || self
                    .lame_duck
                    .as_ref()
                    .is_some_and(|g| g.key_id == next);
            if !taken {
                return next;
            }
            next = (next + 1) % 8;
        }
    }

    /// Number of live generations.
    pub fn live_count(&self) -> usize {
        self.primary.is_some() as usize
            + self.secondary.is_some() as usize
            + self.lame_duck.is_some() as usize
    }
}

impl<T> Default for KeyRing<T> {
    fn default() -> Self {
        Self::new()
    }
}
