//! Session counter banks.
//!
//! Two parallel fixed-index banks are shared between the session loop and
//! foreign threads: a stat bank of traffic counters and an error bank keyed
//! by [`ErrorCode`]. The loop is the only writer; any thread may read a slot
//! with a single atomic load, gated on a once-set readiness flag.
//!
//! Time is tracked in binary milliseconds (1/1024 s) against the bank's
//! monotonic origin.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ErrorCode;

/// Convert a duration to binary milliseconds (units of 1/1024 s).
pub fn binary_ms(d: Duration) -> u64 {
    (d.as_nanos() * 1024 / 1_000_000_000) as u64
}

macro_rules! stats {
    ($($variant:ident = $name:literal,)*) => {
        /// Traffic counter slots. Indices are stable; only append.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(usize)]
        pub enum Stat {
            $($variant,)*
        }

        impl Stat {
            /// Number of traffic counter slots.
            pub const COUNT: usize = [$(Stat::$variant,)*].len();

            /// Stable name of this slot.
            pub fn name(self) -> &'static str {
                match self {
                    $(Stat::$variant => $name,)*
                }
            }
        }
    };
}

stats! {
    BytesIn = "BYTES_IN",
    BytesOut = "BYTES_OUT",
    PacketsIn = "PACKETS_IN",
    PacketsOut = "PACKETS_OUT",
    TunBytesIn = "TUN_BYTES_IN",
    TunBytesOut = "TUN_BYTES_OUT",
    TunPacketsIn = "TUN_PACKETS_IN",
    TunPacketsOut = "TUN_PACKETS_OUT",
    LastPacketReceived = "LAST_PACKET_RECEIVED",
}

/// Per-interface counters handed to the host.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InterfaceStats {
    pub bytes_in: u64,
    pub packets_in: u64,
    pub errors_in: u64,
    pub bytes_out: u64,
    pub packets_out: u64,
    pub errors_out: u64,
}

/// Transport counters handed to the host.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    /// Binary milliseconds since the last packet was received, or -1 if no
    /// packet has arrived yet.
    pub last_packet_received: i64,
}

/// The shared counter bank.
pub struct StatsBank {
    ready: AtomicBool,
    origin: Instant,
    stats: [AtomicU64; Stat::COUNT],
    errors: [AtomicU64; ErrorCode::COUNT],
}

impl StatsBank {
    /// Create a new bank with all slots zeroed and readiness cleared.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            origin: Instant::now(),
            stats: std::array::from_fn(|_| AtomicU64::new(0)),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Total number of readable slots (stat bank then error bank).
    pub const fn n() -> usize {
        Stat::COUNT + ErrorCode::COUNT
    }

    /// Stable name of slot `index`, or `None` if out of range.
    pub fn name(index: usize) -> Option<&'static str> {
        if index < Stat::COUNT {
            STAT_ORDER.get(index).map(|s| s.name())
        } else {
            ErrorCode::from_index(index - Stat::COUNT).map(|c| c.name())
        }
    }

    /// Mark the bank readable from foreign threads. Called exactly once,
    /// near the end of connect setup.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Revoke foreign-thread readability; reads return 0 afterwards.
    pub fn clear_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Whether the bank is currently readable.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Add `n` to a traffic counter. Loop-side only.
    pub fn inc(&self, stat: Stat, n: u64) {
        self.stats[stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Record the arrival time of a packet in binary milliseconds.
    pub fn note_packet_received(&self) {
        // Clamp to 1 so a packet in the first tick is distinguishable from
        // "no packet yet".
        let now = binary_ms(self.origin.elapsed()).max(1);
        // fetch_max keeps the slot monotonic even if the loop races a timer.
        self.stats[Stat::LastPacketReceived as usize].fetch_max(now, Ordering::Relaxed);
    }

    /// Count one occurrence of an error code. Loop-side only.
    pub fn count_error(&self, code: ErrorCode) {
        self.errors[code.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Read the raw value of an error counter.
    pub fn error_count(&self, code: ErrorCode) -> u64 {
        self.errors[code.index()].load(Ordering::Relaxed)
    }

    /// Read slot `index`. Foreign-thread safe; returns 0 when the bank is
    /// not (or no longer) ready, or the index is out of range.
    pub fn value(&self, index: usize) -> u64 {
        if !self.is_ready() {
            return 0;
        }
        if index < Stat::COUNT {
            self.stats[index].load(Ordering::Relaxed)
        } else if index < Self::n() {
            self.errors[index - Stat::COUNT].load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Read every slot at once.
    pub fn bundle(&self) -> Vec<u64> {
        (0..Self::n()).map(|i| self.value(i)).collect()
    }

    /// Tun-side interface counters.
    pub fn tun_stats(&self) -> InterfaceStats {
        if !self.is_ready() {
            return InterfaceStats::default();
        }
        InterfaceStats {
            bytes_in: self.stats[Stat::TunBytesIn as usize].load(Ordering::Relaxed),
            packets_in: self.stats[Stat::TunPacketsIn as usize].load(Ordering::Relaxed),
            errors_in: self.error_count(ErrorCode::TunReadError),
            bytes_out: self.stats[Stat::TunBytesOut as usize].load(Ordering::Relaxed),
            packets_out: self.stats[Stat::TunPacketsOut as usize].load(Ordering::Relaxed),
            errors_out: self.error_count(ErrorCode::TunWriteError),
        }
    }

    /// Transport-side counters.
    pub fn transport_stats(&self) -> TransportStats {
        if !self.is_ready() {
            return TransportStats {
                last_packet_received: -1,
                ..TransportStats::default()
            };
        }
        let last = self.stats[Stat::LastPacketReceived as usize].load(Ordering::Relaxed);
        let last_packet_received = if last == 0 {
            -1
        } else {
            binary_ms(self.origin.elapsed()).saturating_sub(last) as i64
        };
        TransportStats {
            bytes_in: self.stats[Stat::BytesIn as usize].load(Ordering::Relaxed),
            bytes_out: self.stats[Stat::BytesOut as usize].load(Ordering::Relaxed),
            packets_in: self.stats[Stat::PacketsIn as usize].load(Ordering::Relaxed),
            packets_out: self.stats[Stat::PacketsOut as usize].load(Ordering::Relaxed),
            last_packet_received,
        }
    }
}

impl Default for StatsBank {
    fn default() -> Self {
        Self::new()
    }
}

const STAT_ORDER: [Stat; Stat::COUNT] = [
    Stat::BytesIn,
    Stat::BytesOut,
    Stat::PacketsIn,
    Stat::PacketsOut,
    Stat::TunBytesIn,
    Stat::TunBytesOut,
    Stat::TunPacketsIn,
    Stat::TunPacketsOut,
    Stat::LastPacketReceived,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_ms() {
        assert_eq!(binary_ms(Duration::from_secs(1)), 1024);
        assert_eq!(binary_ms(Duration::from_secs(2)), 2048);
        assert_eq!(binary_ms(Duration::from_millis(500)), 512);
    }

    #[test]
    fn test_not_ready_reads_zero() {
        let bank = StatsBank::new();
        bank.inc(Stat::BytesIn, 100);
        assert_eq!(bank.value(Stat::BytesIn as usize), 0);

        bank.mark_ready();
        assert_eq!(bank.value(Stat::BytesIn as usize), 100);

        bank.clear_ready();
        assert_eq!(bank.value(Stat::BytesIn as usize), 0);
    }

    #[test]
    fn test_error_bank_indexing() {
        let bank = StatsBank::new();
        bank.mark_ready();
        bank.count_error(ErrorCode::ReplayError);
        bank.count_error(ErrorCode::ReplayError);

        let index = Stat::COUNT + ErrorCode::ReplayError.index();
        assert_eq!(bank.value(index), 2);
        assert_eq!(StatsBank::name(index), Some("REPLAY_ERROR"));
    }

    #[test]
    fn test_names_cover_both_banks() {
        assert_eq!(StatsBank::name(0), Some("BYTES_IN"));
        assert_eq!(StatsBank::name(Stat::COUNT), Some("NETWORK_RECV_ERROR"));
        assert!(StatsBank::name(StatsBank::n()).is_none());
    }

    #[test]
    fn test_bundle_length() {
        let bank = StatsBank::new();
        bank.mark_ready();
        assert_eq!(bank.bundle().len(), StatsBank::n());
    }

    #[test]
    fn test_monotonic_counters() {
        let bank = StatsBank::new();
        bank.mark_ready();
        let mut prev = 0;
        for _ in 0..10 {
            bank.inc(Stat::BytesOut, 7);
            let cur = bank.value(Stat::BytesOut as usize);
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn test_transport_stats_last_packet() {
        let bank = StatsBank::new();
        bank.mark_ready();
        assert_eq!(bank.transport_stats().last_packet_received, -1);

        bank.note_packet_received();
        assert!(bank.transport_stats().last_packet_received >= 0);
    }
}
