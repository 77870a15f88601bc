//! Error types for the tunlink core.
//!
//! Two layers live here:
//!
//! - [`Error`], the operational error propagated through `Result` while the
//!   session runs.
//! - [`ErrorCode`], the closed taxonomy surfaced to the host through the
//!   error counter bank. Indices are part of the external contract and must
//!   stay stable across versions; new codes append at the end.

use thiserror::Error;

/// Result type alias for tunlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while a session is being built or driven.
#[derive(Error, Debug)]
pub enum Error {
    /// Profile or option parsing failure
    #[error("option error: {0}")]
    Options(String),

    /// Credential handling failure
    #[error("credential error: {0}")]
    Creds(String),

    /// Remote list exhausted or malformed remote entry
    #[error("remote error: {0}")]
    Remote(String),

    /// Transport-level failure (connect, framing, link I/O)
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP proxy negotiation failure
    #[error("proxy error: {0}")]
    Proxy(String),

    /// TLS wrapper or certificate policy failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Control/data channel protocol violation
    #[error("protocol error: {0}")]
    Proto(String),

    /// Control channel reliability bound exceeded
    #[error("control channel error: {0}")]
    ControlChannel(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// A named timer expired
    #[error("{0} timeout")]
    Timeout(&'static str),

    /// Authentication rejected by the server
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Server ordered a halt
    #[error("halted by server: {0}")]
    Halt(String),

    /// Error carrying an explicit taxonomy code
    #[error("{1}")]
    Tagged(ErrorCode, String),
}

impl Error {
    /// Create a new options error.
    pub fn options(msg: impl Into<String>) -> Self {
        Error::Options(msg.into())
    }

    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new crypto error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol error.
    pub fn proto(msg: impl Into<String>) -> Self {
        Error::Proto(msg.into())
    }

    /// Attach an explicit taxonomy code.
    pub fn tagged(code: ErrorCode, msg: impl Into<String>) -> Self {
        Error::Tagged(code, msg.into())
    }

    /// Map this error onto the closed taxonomy for the error counter bank.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Options(_) => ErrorCode::UnusedOptions,
            Error::Creds(_) => ErrorCode::NeedCreds,
            Error::Remote(_) => ErrorCode::ResolveError,
            Error::Transport(_) => ErrorCode::TransportError,
            Error::Proxy(_) => ErrorCode::ProxyError,
            Error::Tls(_) => ErrorCode::SslError,
            Error::Crypto(_) => ErrorCode::DecryptError,
            Error::Proto(_) => ErrorCode::KeyStateError,
            Error::ControlChannel(_) => ErrorCode::CcError,
            Error::Network(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ErrorCode::NetworkEofError,
                std::io::ErrorKind::WriteZero | std::io::ErrorKind::BrokenPipe => {
                    ErrorCode::NetworkSendError
                }
                _ => ErrorCode::NetworkRecvError,
            },
            Error::Timeout(name) => match *name {
                "handshake" => ErrorCode::HandshakeTimeout,
                "keepalive" => ErrorCode::KeepaliveTimeout,
                "inactive" => ErrorCode::InactiveTimeout,
                _ => ErrorCode::ConnectionTimeout,
            },
            Error::AuthFailed(_) => ErrorCode::AuthFailed,
            Error::Halt(_) => ErrorCode::ClientHalt,
            Error::Tagged(code, _) => *code,
        }
    }
}

macro_rules! error_codes {
    ($($variant:ident = $name:literal,)*) => {
        /// Closed error taxonomy with stable indices.
        ///
        /// The discriminant of each variant is its slot in the error counter
        /// bank and the index accepted by `stats_name`/`stats_value`. Only
        /// append; never reorder.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum ErrorCode {
            $($variant,)*
        }

        impl ErrorCode {
            /// Number of codes in the taxonomy.
            pub const COUNT: usize = [$(ErrorCode::$variant,)*].len();

            /// Stable token for this code, as surfaced to the host.
            pub fn name(self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $name,)*
                }
            }

            /// Look a code up by bank index.
            pub fn from_index(index: usize) -> Option<Self> {
                const ALL: [ErrorCode; ErrorCode::COUNT] = [$(ErrorCode::$variant,)*];
                ALL.get(index).copied()
            }

            /// Bank index of this code.
            pub fn index(self) -> usize {
                self as usize
            }
        }
    };
}

error_codes! {
    NetworkRecvError = "NETWORK_RECV_ERROR",
    NetworkEofError = "NETWORK_EOF_ERROR",
    NetworkSendError = "NETWORK_SEND_ERROR",
    NetworkUnavailable = "NETWORK_UNAVAILABLE",
    DecryptError = "DECRYPT_ERROR",
    HmacError = "HMAC_ERROR",
    ReplayError = "REPLAY_ERROR",
    BufferError = "BUFFER_ERROR",
    CcError = "CC_ERROR",
    BadSrcAddr = "BAD_SRC_ADDR",
    CompressError = "COMPRESS_ERROR",
    ResolveError = "RESOLVE_ERROR",
    SocketProtectError = "SOCKET_PROTECT_ERROR",
    TunReadError = "TUN_READ_ERROR",
    TunWriteError = "TUN_WRITE_ERROR",
    TunFramingError = "TUN_FRAMING_ERROR",
    TunSetupFailed = "TUN_SETUP_FAILED",
    TunIfaceCreate = "TUN_IFACE_CREATE",
    TunIfaceDisabled = "TUN_IFACE_DISABLED",
    TunError = "TUN_ERROR",
    TapNotSupported = "TAP_NOT_SUPPORTED",
    TransportError = "TRANSPORT_ERROR",
    TcpOverflow = "TCP_OVERFLOW",
    TcpSizeError = "TCP_SIZE_ERROR",
    TcpConnectError = "TCP_CONNECT_ERROR",
    UdpConnectError = "UDP_CONNECT_ERROR",
    SslError = "SSL_ERROR",
    SslPartialWrite = "SSL_PARTIAL_WRITE",
    EncapsulationError = "ENCAPSULATION_ERROR",
    EpkiCertError = "EPKI_CERT_ERROR",
    EpkiSignError = "EPKI_SIGN_ERROR",
    HandshakeTimeout = "HANDSHAKE_TIMEOUT",
    KeepaliveTimeout = "KEEPALIVE_TIMEOUT",
    InactiveTimeout = "INACTIVE_TIMEOUT",
    ConnectionTimeout = "CONNECTION_TIMEOUT",
    PrimaryExpire = "PRIMARY_EXPIRE",
    TlsVersionMin = "TLS_VERSION_MIN",
    CertVerifyFail = "CERT_VERIFY_FAIL",
    TlsAlertProtocolVersion = "TLS_ALERT_PROTOCOL_VERSION",
    TlsAlertUnknownCa = "TLS_ALERT_UNKNOWN_CA",
    TlsAlertHandshakeFailure = "TLS_ALERT_HANDSHAKE_FAILURE",
    TlsAlertCertificateRequired = "TLS_ALERT_CERTIFICATE_REQUIRED",
    TlsAlertCertificateExpired = "TLS_ALERT_CERTIFICATE_EXPIRED",
    TlsAlertCertificateRevoked = "TLS_ALERT_CERTIFICATE_REVOKED",
    TlsAlertBadCertificate = "TLS_ALERT_BAD_CERTIFICATE",
    TlsAlertUnsupportedCertificate = "TLS_ALERT_UNSUPPORTED_CERTIFICATE",
    TlsAlertMisc = "TLS_ALERT_MISC",
    TlsAuthFail = "TLS_AUTH_FAIL",
    TlsCryptMetaFail = "TLS_CRYPT_META_FAIL",
    PemPasswordFail = "PEM_PASSWORD_FAIL",
    AuthFailed = "AUTH_FAILED",
    ClientHalt = "CLIENT_HALT",
    ClientRestart = "CLIENT_RESTART",
    TunHalt = "TUN_HALT",
    Relay = "RELAY",
    RelayError = "RELAY_ERROR",
    NPause = "N_PAUSE",
    NReconnect = "N_RECONNECT",
    NKeyLimitReneg = "N_KEY_LIMIT_RENEG",
    KeyStateError = "KEY_STATE_ERROR",
    ProxyError = "PROXY_ERROR",
    ProxyNeedCreds = "PROXY_NEED_CREDS",
    EarlyNegInvalid = "EARLY_NEG_INVALID",
    NtlmMissingCrypto = "NTLM_MISSING_CRYPTO",
    UnusedOptions = "UNUSED_OPTIONS",
    SessionExpired = "SESSION_EXPIRED",
    NeedCreds = "NEED_CREDS",
    KevNegotiateError = "KEV_NEGOTIATE_ERROR",
    KevPendingError = "KEV_PENDING_ERROR",
    NKevExpire = "N_KEV_EXPIRE",
    KeyExpansionError = "KEY_EXPANSION_ERROR",
    PktidInvalid = "PKTID_INVALID",
    PktidBacktrack = "PKTID_BACKTRACK",
    PktidExpire = "PKTID_EXPIRE",
    PktidReplay = "PKTID_REPLAY",
    PktidTimeBacktrack = "PKTID_TIME_BACKTRACK",
}

impl ErrorCode {
    /// Whether a surfaced error of this kind ends the session outright.
    ///
    /// Bounded-scope codes (bad packet, replay, one failed signature) are
    /// counted and dropped; connection-scoped codes restart the outer loop;
    /// only these end it.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::CertVerifyFail
                | ErrorCode::TlsVersionMin
                | ErrorCode::ClientHalt
                | ErrorCode::EpkiCertError
                | ErrorCode::EpkiSignError
                | ErrorCode::TunHalt
                | ErrorCode::Relay
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
