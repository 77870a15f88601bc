//! Lifecycle events and the host capability surface.
//!
//! The session reports progress through a typed event stream consumed by
//! the embedding host. Host-implemented callbacks travel the other way as a
//! capability trait; on teardown the controller swaps the capability for a
//! no-op implementation so stale children cannot call back into a detached
//! host.

use serde::Serialize;

use crate::creds::DynamicChallenge;
use crate::epki::{ExternalPkiCertRequest, ExternalPkiSignRequest};
use crate::error::ErrorCode;
use crate::remote::Remote;

macro_rules! event_ids {
    ($($variant:ident = $name:literal),* $(,)?) => {
        /// Closed event enumeration.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum EventId {
            $($variant,)*
        }

        impl EventId {
            /// Stable event name as surfaced to the host.
            pub fn name(self) -> &'static str {
                match self {
                    $(EventId::$variant => $name,)*
                }
            }
        }
    };
}

event_ids! {
    Resolve = "RESOLVE",
    Connecting = "CONNECTING",
    Wait = "WAIT",
    Auth = "AUTH",
    GetConfig = "GET_CONFIG",
    AssignIp = "ASSIGN_IP",
    AddRoutes = "ADD_ROUTES",
    Connected = "CONNECTED",
    Reconnecting = "RECONNECTING",
    Disconnected = "DISCONNECTED",
    AuthFailed = "AUTH_FAILED",
    CertVerifyFail = "CERT_VERIFY_FAIL",
    TlsVersionMin = "TLS_VERSION_MIN",
    DynamicChallenge = "DYNAMIC_CHALLENGE",
    ProxyNeedCreds = "PROXY_NEED_CREDS",
    Pause = "PAUSE",
    Resume = "RESUME",
    Info = "INFO",
    Echo = "ECHO",
    Warn = "WARN",
    CustomControl = "CUSTOM_CONTROL",
    ClientHalt = "CLIENT_HALT",
    ClientRestart = "CLIENT_RESTART",
    Relay = "RELAY",
    EpkiError = "EPKI_ERROR",
    ConnectionTimeout = "CONNECTION_TIMEOUT",
}

impl EventId {
    /// Whether events of this kind report an error condition.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            EventId::AuthFailed
                | EventId::CertVerifyFail
                | EventId::TlsVersionMin
                | EventId::ProxyNeedCreds
                | EventId::ClientHalt
                | EventId::ClientRestart
                | EventId::Relay
                | EventId::EpkiError
                | EventId::ConnectionTimeout
                | EventId::Warn
        )
    }
}

/// Extra details delivered with a `CONNECTED` event and queryable afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionInfo {
    pub defined: bool,
    pub user: String,
    pub server_host: String,
    pub server_port: String,
    pub server_proto: String,
    pub server_ip: String,
    pub vpn_ip4: String,
    pub vpn_ip6: String,
    pub vpn_mtu: String,
    pub gw4: String,
    pub gw6: String,
    pub tun_name: String,
}

/// Optional typed payload attached to an event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Connected(Box<ConnectionInfo>),
    DynamicChallenge(DynamicChallenge),
}

/// One lifecycle event.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    /// Additional human-readable info, printable-filtered.
    pub info: String,
    /// Set when this event ends the session.
    pub fatal: bool,
    pub payload: Option<EventPayload>,
}

impl Event {
    /// A plain event with no extra info.
    pub fn new(id: EventId) -> Self {
        Self {
            id,
            info: String::new(),
            fatal: false,
            payload: None,
        }
    }

    /// An event with additional info text.
    pub fn with_info(id: EventId, info: impl Into<String>) -> Self {
        Self {
            id,
            info: info.into(),
            fatal: false,
            payload: None,
        }
    }

    /// Mark this event fatal.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether this event reports an error.
    pub fn is_error(&self) -> bool {
        self.fatal || self.id.is_error()
    }
}

/// Message from the app-custom control channel.
#[derive(Debug, Clone)]
pub struct AppControlMessage {
    pub protocol: String,
    pub payload: String,
}

/// Host-implemented callbacks.
///
/// Every method has a default no-op so embedders implement only what they
/// consume. All calls arrive on the thread executing `connect()`.
pub trait HostCallbacks: Send + Sync {
    /// One log line from the core.
    fn log(&self, _line: &str) {}

    /// A lifecycle event.
    fn event(&self, _event: &Event) {}

    /// An app-custom control channel message.
    fn acc_event(&self, _msg: &AppControlMessage) {}

    /// Keep the control socket out of the tunnel being built. Returning
    /// false surfaces a socket-protect error and fails the attempt.
    fn socket_protect(&self, _socket: i64, _remote: &str, _ipv6: bool) -> bool {
        true
    }

    /// Called when the total connection timeout expires: true parks the
    /// session in PAUSE instead of failing with CONNECTION_TIMEOUT.
    fn pause_on_connection_timeout(&self) -> bool {
        false
    }

    /// Fetch the external PKI certificate chain.
    fn external_pki_cert_request(&self, req: &mut ExternalPkiCertRequest) {
        req.error = true;
        req.error_text = "external PKI not implemented by host".into();
    }

    /// Produce one external PKI signature.
    fn external_pki_sign_request(&self, req: &mut ExternalPkiSignRequest) {
        req.error = true;
        req.error_text = "external PKI not implemented by host".into();
    }

    /// Whether the host wants remote-override callbacks.
    fn remote_override_enabled(&self) -> bool {
        false
    }

    /// Supply a replacement for the next remote candidate.
    fn remote_override(&self, _current: &Remote) -> Result<Option<Remote>, String> {
        Ok(None)
    }

    /// Periodic convenience tick, rate set by the client config.
    fn clock_tick(&self) {}
}

/// The capability installed at teardown: every callback is a no-op.
pub struct NoopHost;

impl HostCallbacks for NoopHost {}

/// Map an error code onto the event that reports it, when one exists.
pub fn event_for_error(code: ErrorCode) -> Option<EventId> {
    match code {
        ErrorCode::AuthFailed => Some(EventId::AuthFailed),
        ErrorCode::CertVerifyFail => Some(EventId::CertVerifyFail),
        ErrorCode::TlsVersionMin => Some(EventId::TlsVersionMin),
        ErrorCode::ProxyNeedCreds => Some(EventId::ProxyNeedCreds),
        ErrorCode::ClientHalt => Some(EventId::ClientHalt),
        ErrorCode::ClientRestart => Some(EventId::ClientRestart),
        ErrorCode::Relay => Some(EventId::Relay),
        ErrorCode::EpkiCertError | ErrorCode::EpkiSignError => Some(EventId::EpkiError),
        ErrorCode::ConnectionTimeout => Some(EventId::ConnectionTimeout),
        _ => None,
    }
}
