//! # tunlink
//!
//! An embeddable VPN client session core: it parses a declarative profile
//! into a connection plan, drives the connection lifecycle over possibly
//! many remote candidates, multiplexes a reliable TLS-wrapped control
//! channel and an authenticated-encrypted data channel over one unreliable
//! transport, renegotiates keys while data keeps flowing, and surfaces
//! lifecycle events and counters to the embedding host.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Host application (events, creds, tun, PKI)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  ClientSession (connect loop, commands, timers, stats)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Protocol engine (key state machine, rekey, keepalive)  │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Control: reliability +    │  Data: AEAD + replay       │
//! │  memory-buffered TLS       │  window per generation     │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Transport link (UDP / TCP / HTTP proxy / DCO)          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency model
//!
//! One single-threaded cooperative event loop per session owns every
//! mutation of session state; `connect()` turns the calling thread into
//! that loop. Foreign threads interact through atomic counter reads and a
//! single-consumer command inbox, both gated on one readiness flag.

#![warn(rust_2018_idioms)]

pub mod client;
pub mod creds;
pub mod crypto;
pub mod epki;
pub mod error;
pub mod event;
pub mod options;
pub mod protocol;
pub mod reliability;
pub mod remote;
pub mod stats;
pub mod tls;
pub mod transport;
pub mod tun;

#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{
    eval_profile, ClientConfig, ClientSession, EvalConfig, ServerEntry, SessionToken, Status,
};
pub use creds::{DynamicChallenge, ProvideCreds};
pub use error::{Error, ErrorCode, Result};
pub use event::{AppControlMessage, ConnectionInfo, Event, EventId, HostCallbacks};
pub use remote::{IpVersion, Protocol, Remote};
pub use stats::{InterfaceStats, TransportStats};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_stats_surface_is_closed() {
        // The readable slot count is part of the external contract.
        assert_eq!(
            ClientSession::stats_n(),
            stats::Stat::COUNT + ErrorCode::COUNT
        );
        assert_eq!(ClientSession::stats_name(0), Some("BYTES_IN"));
        assert!(ClientSession::stats_name(ClientSession::stats_n()).is_none());
    }
}
