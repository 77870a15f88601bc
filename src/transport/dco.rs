//! Kernel data-channel offload (DCO) seam.
//!
//! When the platform offers an in-kernel data path, the finalised key
//! material and the peer socket are handed over after the handshake and the
//! userspace engine retires to a stats-polling role: tun and transport data
//! sends become local no-ops.

use std::net::SocketAddr;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::DirectionKeys;
use crate::error::Result;

/// Everything the kernel needs to take over the data channel.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DcoHandoff {
    #[zeroize(skip)]
    pub peer: SocketAddr,
    /// Raw descriptor of the connected transport socket.
    #[zeroize(skip)]
    pub raw_fd: i64,
    #[zeroize(skip)]
    pub key_id: u8,
    pub encrypt_cipher_key: [u8; 32],
    pub encrypt_hmac_key: [u8; 32],
    pub decrypt_cipher_key: [u8; 32],
    pub decrypt_hmac_key: [u8; 32],
}

impl DcoHandoff {
    /// Assemble a handoff from the live key material.
    pub fn new(
        peer: SocketAddr,
        raw_fd: i64,
        key_id: u8,
        tx: &DirectionKeys,
        rx: &DirectionKeys,
    ) -> Self {
        Self {
            peer,
            raw_fd,
            key_id,
            encrypt_cipher_key: *tx.cipher(),
            encrypt_hmac_key: *tx.hmac(),
            decrypt_cipher_key: *rx.cipher(),
            decrypt_hmac_key: *rx.hmac(),
        }
    }
}

/// Cumulative counters read back from the kernel device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DcoStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// The kernel offload device capability.
pub trait DcoDevice: Send {
    /// Install keys and socket; the kernel owns the data path afterwards.
    /// Called again with fresh material after each rekey.
    fn offload(&mut self, handoff: DcoHandoff) -> Result<()>;

    /// Read cumulative traffic counters.
    fn poll_stats(&mut self) -> DcoStats;

    /// Release the kernel state.
    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingDco {
        offloads: Vec<(u8, i64)>,
        stats: DcoStats,
    }

    impl DcoDevice for RecordingDco {
        fn offload(&mut self, handoff: DcoHandoff) -> Result<()> {
            self.offloads.push((handoff.key_id, handoff.raw_fd));
            Ok(())
        }

        fn poll_stats(&mut self) -> DcoStats {
            self.stats
        }
    }

    #[test]
    fn test_handoff_carries_key_material() {
        use crate::crypto::{Direction, KeyExpansion, KeySource};

        let expansion = KeyExpansion::generate(
            &KeySource::new_client(),
            &KeySource::new_server(),
            &[1; 8],
            &[2; 8],
        );
        let tx = DirectionKeys::from_expansion(&expansion, Direction::Encrypt, false);
        let rx = DirectionKeys::from_expansion(&expansion, Direction::Decrypt, false);

        let handoff = DcoHandoff::new("192.0.2.1:1194".parse().unwrap(), 7, 0, &tx, &rx);
        assert_eq!(&handoff.encrypt_cipher_key, tx.cipher());
        assert_eq!(&handoff.decrypt_hmac_key, rx.hmac());
        assert_ne!(handoff.encrypt_cipher_key, handoff.decrypt_cipher_key);
    }

    #[test]
    fn test_device_capability() {
        use crate::crypto::{Direction, KeyExpansion, KeySource};

        let expansion = KeyExpansion::generate(
            &KeySource::new_client(),
            &KeySource::new_server(),
            &[1; 8],
            &[2; 8],
        );
        let tx = DirectionKeys::from_expansion(&expansion, Direction::Encrypt, false);
        let rx = DirectionKeys::from_expansion(&expansion, Direction::Decrypt, false);

        let mut device = RecordingDco {
            offloads: Vec::new(),
            stats: DcoStats {
                bytes_in: 10,
                bytes_out: 20,
                packets_in: 1,
                packets_out: 2,
            },
        };
        device
            .offload(DcoHandoff::new(
                "192.0.2.1:1194".parse().unwrap(),
                9,
                3,
                &tx,
                &rx,
            ))
            .unwrap();
        assert_eq!(device.offloads, vec![(3, 9)]);
        assert_eq!(device.poll_stats().bytes_out, 20);
    }
}
