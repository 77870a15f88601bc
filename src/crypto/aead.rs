//! Data-channel cipher contexts.
//!
//! Each direction of each key generation gets its own context built from
//! the expansion quadrants. Two framings are supported:
//!
//! - [`AuthMode::Aead`]: ChaCha20-Poly1305 with the packet header as AAD and
//!   the packet id as nonce. The default for modern peers.
//! - [`AuthMode::CipherAndHmac`]: the legacy layout with a detached
//!   HMAC-SHA256 tag appended after the ciphertext, verified before
//!   decryption so tag and payload failures count separately.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::keys::{Direction, KeyExpansion, KeyKind, KeySpecifier};
use crate::crypto::{HMAC_TAG_SIZE, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, ErrorCode, Result};

type HmacSha256 = Hmac<Sha256>;

/// Cipher and HMAC keys for one direction of one generation.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    cipher: [u8; KEY_SIZE],
    hmac: [u8; KEY_SIZE],
}

impl DirectionKeys {
    /// Slice this direction's keys out of a handshake expansion.
    pub fn from_expansion(expansion: &KeyExpansion, direction: Direction, inverse: bool) -> Self {
        let cipher_q =
            expansion.quadrant(KeySpecifier::new(KeyKind::Cipher, direction, inverse));
        let hmac_q = expansion.quadrant(KeySpecifier::new(KeyKind::Hmac, direction, inverse));

        let mut keys = Self {
            cipher: [0u8; KEY_SIZE],
            hmac: [0u8; KEY_SIZE],
        };
        keys.cipher.copy_from_slice(&cipher_q[..KEY_SIZE]);
        keys.hmac.copy_from_slice(&hmac_q[..KEY_SIZE]);
        keys
    }

    /// Raw cipher key bytes.
    pub fn cipher(&self) -> &[u8; KEY_SIZE] {
        &self.cipher
    }

    /// Raw HMAC key bytes.
    pub fn hmac(&self) -> &[u8; KEY_SIZE] {
        &self.hmac
    }
}

/// A nonce derived from the data-channel packet id.
///
/// The id occupies the trailing 8 bytes little-endian; the leading 4 bytes
/// stay zero. Packet ids never repeat within a generation, which is what
/// keeps the nonce unique per key.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Build the nonce for a packet id.
    pub fn from_packet_id(packet_id: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..12].copy_from_slice(&packet_id.to_le_bytes());
        Self(nonce)
    }

    /// Raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Data-channel authentication framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// AEAD: tag folded into the ciphertext, header authenticated as AAD.
    Aead,
    /// Legacy: detached HMAC over packet id and ciphertext, appended.
    CipherAndHmac,
}

/// Per-direction data-channel context.
pub struct DataContext {
    mode: AuthMode,
    cipher: ChaCha20Poly1305,
    hmac_key: [u8; KEY_SIZE],
}

impl DataContext {
    /// Build a context from direction keys.
    pub fn new(keys: &DirectionKeys, mode: AuthMode) -> Self {
        Self {
            mode,
            cipher: ChaCha20Poly1305::new(keys.cipher().into()),
            hmac_key: *keys.hmac(),
        }
    }

    /// Encrypt and authenticate one payload.
    ///
    /// `aad` is the packet header (authenticated, not encrypted).
    pub fn seal(&self, packet_id: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_packet_id(packet_id);
        match self.mode {
            AuthMode::Aead => self
                .cipher
                .encrypt(
                    nonce.as_bytes().into(),
                    Payload {
                        msg: plaintext,
                        aad,
                    },
                )
                .map_err(|_| Error::tagged(ErrorCode::EncapsulationError, "AEAD seal failed")),
            AuthMode::CipherAndHmac => {
                let mut out = self
                    .cipher
                    .encrypt(
                        nonce.as_bytes().into(),
                        Payload {
                            msg: plaintext,
                            aad: b"",
                        },
                    )
                    .map_err(|_| {
                        Error::tagged(ErrorCode::EncapsulationError, "cipher seal failed")
                    })?;
                let tag = self.hmac_tag(packet_id, &out);
                out.extend_from_slice(&tag);
                Ok(out)
            }
        }
    }

    /// Verify and decrypt one payload.
    ///
    /// Failures map onto the taxonomy: a bad detached tag is an HMAC error,
    /// a bad AEAD open is a decrypt error.
    pub fn open(&self, packet_id: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_packet_id(packet_id);
        match self.mode {
            AuthMode::Aead => {
                if ciphertext.len() < TAG_SIZE {
                    return Err(Error::tagged(ErrorCode::BufferError, "short AEAD payload"));
                }
                self.cipher
                    .decrypt(
                        nonce.as_bytes().into(),
                        Payload {
                            msg: ciphertext,
                            aad,
                        },
                    )
                    .map_err(|_| {
                        Error::tagged(ErrorCode::DecryptError, "AEAD authentication failed")
                    })
            }
            AuthMode::CipherAndHmac => {
                if ciphertext.len() < TAG_SIZE + HMAC_TAG_SIZE {
                    return Err(Error::tagged(ErrorCode::BufferError, "short legacy payload"));
                }
                let (body, tag) = ciphertext.split_at(ciphertext.len() - HMAC_TAG_SIZE);
                let expected = self.hmac_tag(packet_id, body);
                if !constant_time_eq(&expected, tag) {
                    return Err(Error::tagged(
                        ErrorCode::HmacError,
                        "HMAC verification failed",
                    ));
                }
                self.cipher
                    .decrypt(
                        nonce.as_bytes().into(),
                        Payload {
                            msg: body,
                            aad: b"",
                        },
                    )
                    .map_err(|_| Error::tagged(ErrorCode::DecryptError, "decrypt failed"))
            }
        }
    }

    fn hmac_tag(&self, packet_id: u64, body: &[u8]) -> [u8; HMAC_TAG_SIZE] {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hmac_key).expect("HMAC can take key of any size");
        mac.update(&packet_id.to_be_bytes());
        mac.update(body);
        let out = mac.finalize().into_bytes();
        let mut tag = [0u8; HMAC_TAG_SIZE];
        tag.copy_from_slice(&out);
        tag
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeySource;

    fn contexts(mode: AuthMode) -> (DataContext, DataContext) {
        let expansion = KeyExpansion::generate(
            &KeySource::new_client(),
            &KeySource::new_server(),
            &[0x0a; 8],
            &[0x0b; 8],
        );
        let tx_keys = DirectionKeys::from_expansion(&expansion, Direction::Encrypt, false);
        let rx_keys = DirectionKeys::from_expansion(&expansion, Direction::Decrypt, true);
        (
            DataContext::new(&tx_keys, mode),
            DataContext::new(&rx_keys, mode),
        )
    }

    #[test]
    fn test_aead_round_trip() {
        let (tx, rx) = contexts(AuthMode::Aead);
        let sealed = tx.seal(1, b"header", b"payload").unwrap();
        assert_eq!(sealed.len(), b"payload".len() + TAG_SIZE);
        let opened = rx.open(1, b"header", &sealed).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn test_aead_wrong_aad_fails() {
        let (tx, rx) = contexts(AuthMode::Aead);
        let sealed = tx.seal(1, b"header", b"payload").unwrap();
        let err = rx.open(1, b"other", &sealed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DecryptError);
    }

    #[test]
    fn test_aead_wrong_packet_id_fails() {
        let (tx, rx) = contexts(AuthMode::Aead);
        let sealed = tx.seal(1, b"header", b"payload").unwrap();
        assert!(rx.open(2, b"header", &sealed).is_err());
    }

    #[test]
    fn test_legacy_round_trip() {
        let (tx, rx) = contexts(AuthMode::CipherAndHmac);
        let sealed = tx.seal(9, b"", b"payload").unwrap();
        assert_eq!(sealed.len(), b"payload".len() + TAG_SIZE + HMAC_TAG_SIZE);
        assert_eq!(rx.open(9, b"", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_legacy_tampered_tag_is_hmac_error() {
        let (tx, rx) = contexts(AuthMode::CipherAndHmac);
        let mut sealed = tx.seal(9, b"", b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let err = rx.open(9, b"", &sealed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::HmacError);
    }

    #[test]
    fn test_legacy_tampered_body_is_hmac_error() {
        // The detached tag covers the ciphertext, so body tampering is
        // caught at the HMAC stage, before decryption.
        let (tx, rx) = contexts(AuthMode::CipherAndHmac);
        let mut sealed = tx.seal(9, b"", b"payload").unwrap();
        sealed[0] ^= 0x01;
        let err = rx.open(9, b"", &sealed).unwrap_err();
        assert_eq!(err.code(), ErrorCode::HmacError);
    }

    #[test]
    fn test_short_payloads() {
        let (_, rx) = contexts(AuthMode::Aead);
        let err = rx.open(1, b"", &[0u8; 4]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BufferError);
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = Nonce::from_packet_id(0x0102030405060708);
        assert_eq!(&nonce.as_bytes()[..4], &[0, 0, 0, 0]);
        assert_eq!(
            &nonce.as_bytes()[4..],
            &0x0102030405060708u64.to_le_bytes()
        );
    }

    #[test]
    fn test_directions_are_independent() {
        let expansion = KeyExpansion::generate(
            &KeySource::new_client(),
            &KeySource::new_server(),
            &[0x0a; 8],
            &[0x0b; 8],
        );
        let tx = DataContext::new(
            &DirectionKeys::from_expansion(&expansion, Direction::Encrypt, false),
            AuthMode::Aead,
        );
        // The same side's decrypt context uses the opposite quadrants and
        // must not open its own sent traffic.
        let own_rx = DataContext::new(
            &DirectionKeys::from_expansion(&expansion, Direction::Decrypt, false),
            AuthMode::Aead,
        );
        let sealed = tx.seal(1, b"h", b"data").unwrap();
        assert!(own_rx.open(1, b"h", &sealed).is_err());
    }
}
