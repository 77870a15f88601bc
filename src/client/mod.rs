//! Client connect orchestrator.
//!
//! [`ClientSession`] is the embedder-facing session object. `connect()`
//! dedicates the calling thread to a single-threaded event loop that owns
//! every mutation of session state: it walks the remote candidate list,
//! drives the protocol engine over one transport link per attempt, applies
//! foreign-thread commands from the inbox, and reports lifecycle events to
//! the host capability. Foreign threads only read atomic counters or post
//! commands; one readiness flag gates both, set once near the end of setup
//! and cleared first at teardown.

pub mod command;
pub mod eval;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::creds::{Credentials, DynamicChallenge, ProvideCreds};
use crate::crypto::{AuthMode, RekeyLimits};
use crate::epki::{ExternalPkiCertRequest, ExternalPkiSignRequest, SignAlgorithm};
use crate::error::{Error, ErrorCode, Result};
use crate::event::{
    event_for_error, AppControlMessage, ConnectionInfo, Event, EventId, EventPayload,
    HostCallbacks, NoopHost,
};
use crate::options::{utf8_printable, OptionList};
use crate::protocol::control::ControlMessage;
use crate::protocol::engine::{Compression, EngineConfig, EngineSignal, ProtocolEngine};
use crate::remote::{IpVersion, Protocol, Remote, RemoteList, RemoteOverrideHook};
use crate::stats::{InterfaceStats, StatsBank, TransportStats};
use crate::tls::{ExternalSigner, TlsConfig, TlsSessionFactory};
use crate::transport::{resolve, DcoDevice, DcoHandoff, DcoStats, Link, ProxyConfig};
use crate::tun::{TunDevice, TunSettings};

use command::{Command, CommandChannel};
pub use eval::{eval_profile, EvalConfig, ServerEntry};

/// Host-side configuration accompanying the profile.
#[derive(Clone)]
pub struct ClientConfig {
    /// Profile text.
    pub profile: String,
    /// Out-of-band inline blocks, name to body.
    pub inline_overrides: HashMap<String, String>,
    /// Reported to the server as `IV_GUI_VER`.
    pub gui_version: String,
    /// Comma-separated SSO methods, reported as `IV_SSO`.
    pub sso_methods: String,
    /// Supported app-custom control protocols, reported as `IV_ACC`.
    pub app_custom_protocols: String,
    /// Reported as `IV_PLAT_VER`.
    pub platform_version: String,
    /// Use this server instead of the profile remotes' host.
    pub server_override: Option<String>,
    /// Use this port instead of the profile remotes' port.
    pub port_override: Option<u16>,
    /// Force one transport protocol.
    pub proto_override: Option<Protocol>,
    /// Force one address family.
    pub ip_version_override: Option<IpVersion>,
    /// Total time allowed to reach CONNECTED; `None` retries forever.
    pub conn_timeout: Option<Duration>,
    /// Transport connect deadline per attempt.
    pub connect_timeout: Duration,
    /// Treat AUTH_FAILED as a retryable error instead of fatal.
    pub retry_on_auth_failed: bool,
    /// Forward pushed `echo` directives as ECHO events.
    pub echo: bool,
    /// Forward INFO control messages as INFO events.
    pub info: bool,
    /// Periodic convenience tick delivered to the host.
    pub clock_tick: Option<Duration>,
    /// Extra peer-info key/values.
    pub peer_info: Vec<(String, String)>,
    /// Alias for external PKI callbacks.
    pub external_pki_alias: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            inline_overrides: HashMap::new(),
            gui_version: format!("tunlink {}", env!("CARGO_PKG_VERSION")),
            sso_methods: String::new(),
            app_custom_protocols: String::new(),
            platform_version: String::new(),
            server_override: None,
            port_override: None,
            proto_override: None,
            ip_version_override: None,
            conn_timeout: None,
            connect_timeout: Duration::from_secs(30),
            retry_on_auth_failed: false,
            echo: false,
            info: false,
            clock_tick: None,
            peer_info: Vec::new(),
            external_pki_alias: None,
        }
    }
}

/// Result of `connect()` and the credential setters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub error: bool,
    /// Short stable token identifying the error, when one applies.
    pub status: String,
    /// Human-readable message, printable-filtered and capped.
    pub message: String,
}

impl Status {
    fn ok() -> Self {
        Self::default()
    }

    fn with_token(token: &str, error: bool, message: &str) -> Self {
        Self {
            error,
            status: token.to_string(),
            message: utf8_printable(message, 2048),
        }
    }

    fn failure(token: &str, message: &str) -> Self {
        Self::with_token(token, true, message)
    }
}

/// Server-issued session credential.
#[derive(Debug, Clone, Serialize)]
pub struct SessionToken {
    pub username: String,
    pub session_id: String,
}

struct SessionShared {
    stats: Arc<StatsBank>,
    commands: CommandChannel,
    host: RwLock<Arc<dyn HostCallbacks>>,
    connection_info: Mutex<ConnectionInfo>,
    session_token: Mutex<Option<SessionToken>>,
}

/// An embeddable VPN client session.
pub struct ClientSession {
    config: ClientConfig,
    host_impl: Arc<dyn HostCallbacks>,
    tls_factory: Arc<dyn TlsSessionFactory>,
    shared: Arc<SessionShared>,
    creds: Mutex<Credentials>,
    tun: Mutex<Option<Box<dyn TunDevice>>>,
    dco: Mutex<Option<Box<dyn DcoDevice>>>,
}

impl ClientSession {
    /// Build a session. The host supplies its callback capability, a TLS
    /// session factory, and the platform tun device.
    pub fn new(
        config: ClientConfig,
        host: Arc<dyn HostCallbacks>,
        tls_factory: Arc<dyn TlsSessionFactory>,
        tun: Box<dyn TunDevice>,
    ) -> Self {
        Self {
            config,
            host_impl: host,
            tls_factory,
            shared: Arc::new(SessionShared {
                stats: Arc::new(StatsBank::new()),
                commands: CommandChannel::new(),
                host: RwLock::new(Arc::new(NoopHost)),
                connection_info: Mutex::new(ConnectionInfo::default()),
                session_token: Mutex::new(None),
            }),
            creds: Mutex::new(Credentials::default()),
            tun: Mutex::new(Some(tun)),
            dco: Mutex::new(None),
        }
    }

    /// Attach a kernel offload device.
    pub fn with_dco(self, device: Box<dyn DcoDevice>) -> Self {
        *self.dco.lock() = Some(device);
        self
    }

    /// Statically evaluate the configured profile.
    pub fn eval_config(&self) -> EvalConfig {
        let mut eval = eval_profile(&self.config.profile, &self.config.inline_overrides);
        eval::apply_overrides(
            &mut eval,
            self.config.server_override.as_deref(),
            self.config.port_override,
            self.config.proto_override,
            self.config.ip_version_override,
        );
        if !eval.userlocked_username.is_empty() {
            self.creds.lock().lock_username(&eval.userlocked_username);
        }
        eval
    }

    /// Install credentials. Call before `connect()`.
    pub fn provide_creds(&self, creds: ProvideCreds) -> Status {
        self.creds.lock().provide(creds);
        Status::ok()
    }

    /// Run the session until disconnect. Blocks the calling thread; the
    /// thread becomes the session's event loop.
    pub fn connect(&self) -> Status {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => return Status::failure("CORE_ERROR", &format!("runtime: {e}")),
        };
        let status = runtime.block_on(self.session_loop());

        // Teardown order: revoke foreign-thread access first, then unwire
        // the inbox, then neuter the host capability.
        self.shared.stats.clear_ready();
        self.shared.commands.clear();
        *self.shared.host.write() = Arc::new(NoopHost);
        status
    }

    // ---- thread-safe command surface ----------------------------------

    /// Stop the session. Idempotent, callable from any thread.
    pub fn stop(&self) {
        self.post(Command::Stop);
    }

    /// Pause: tear down the transport but keep session state.
    pub fn pause(&self, reason: &str) {
        self.post(Command::Pause(reason.to_string()));
    }

    /// Resume from a pause.
    pub fn resume(&self) {
        self.post(Command::Resume);
    }

    /// Disconnect and reconnect after `seconds`.
    pub fn reconnect(&self, seconds: u64) {
        self.post(Command::Reconnect(Duration::from_secs(seconds)));
    }

    /// Post a raw control-channel message.
    pub fn post_cc_msg(&self, msg: &str) {
        self.post(Command::PostCcMsg(msg.to_string()));
    }

    /// Send an app-custom control channel message.
    pub fn send_app_control_channel_msg(&self, protocol: &str, payload: &str) {
        self.post(Command::SendAppControl {
            protocol: protocol.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Restart the auxiliary cert-check handshake with explicit material.
    pub fn start_cert_check(&self, cert: &str, key: &str, ca: Option<&str>) {
        self.post(Command::StartCertCheck {
            cert: cert.to_string(),
            key: Some(key.to_string()),
            ca: ca.map(str::to_string),
            epki_alias: None,
        });
    }

    /// Restart the auxiliary cert-check handshake through external PKI.
    pub fn start_cert_check_epki(&self, alias: &str, ca: Option<&str>) {
        self.post(Command::StartCertCheck {
            cert: String::new(),
            key: None,
            ca: ca.map(str::to_string),
            epki_alias: Some(alias.to_string()),
        });
    }

    fn post(&self, command: Command) {
        let ready = self.shared.stats.is_ready();
        self.shared.commands.post(command, ready);
    }

    // ---- thread-safe readers ------------------------------------------

    /// Number of readable counter slots.
    pub fn stats_n() -> usize {
        StatsBank::n()
    }

    /// Stable name of counter slot `index`.
    pub fn stats_name(index: usize) -> Option<&'static str> {
        StatsBank::name(index)
    }

    /// Read one counter slot.
    pub fn stats_value(&self, index: usize) -> u64 {
        self.shared.stats.value(index)
    }

    /// Read every counter slot.
    pub fn stats_bundle(&self) -> Vec<u64> {
        self.shared.stats.bundle()
    }

    /// Tun interface counters.
    pub fn tun_stats(&self) -> InterfaceStats {
        self.shared.stats.tun_stats()
    }

    /// Transport counters.
    pub fn transport_stats(&self) -> TransportStats {
        self.shared.stats.transport_stats()
    }

    /// Details of the most recent successful connection.
    pub fn connection_info(&self) -> ConnectionInfo {
        if !self.shared.stats.is_ready() {
            return ConnectionInfo::default();
        }
        self.shared.connection_info.lock().clone()
    }

    /// Server-issued session token, once one has been pushed.
    pub fn session_token(&self) -> Option<SessionToken> {
        if !self.shared.stats.is_ready() {
            return None;
        }
        self.shared.session_token.lock().clone()
    }

    // ---- loop ---------------------------------------------------------

    async fn session_loop(&self) -> Status {
        *self.shared.host.write() = Arc::clone(&self.host_impl);

        let opts = match OptionList::parse_with_inline(
            &self.config.profile,
            &self.config.inline_overrides,
        ) {
            Ok(opts) => opts,
            Err(e) => return Status::failure("PROFILE_ERROR", &e.to_string()),
        };
        if !opts.exists("client") && !opts.exists("tls-client") {
            return Status::failure("PROFILE_ERROR", "profile is not a client profile");
        }
        let tls_config = match TlsConfig::from_options(&opts) {
            Ok(c) => c,
            Err(e) => return Status::failure("PROFILE_ERROR", &e.to_string()),
        };
        let mut proxy = match ProxyConfig::from_options(&opts) {
            Ok(p) => p,
            Err(e) => return Status::failure("PROFILE_ERROR", &e.to_string()),
        };
        if let Some(p) = proxy.as_mut() {
            if let Some((user, pass)) = self.creds.lock().proxy_creds() {
                p.set_creds(user, pass);
            }
        }
        let mut remotes = match self.build_remotes(&opts) {
            Ok(r) => r,
            Err(e) => return Status::failure("PROFILE_ERROR", &e.to_string()),
        };
        let host = self.shared.host.read().clone();
        if host.remote_override_enabled() {
            remotes.set_override_hook(Box::new(HostOverrideHook { host }));
        }

        let autologin = !opts.exists("auth-user-pass") && !opts.exists("static-challenge");
        let static_challenge = opts.exists("static-challenge");
        let suppress_socket_protect = opts
            .find("redirect-gateway")
            .is_some_and(|o| o.tokens()[1..].iter().any(|t| t == "local"));
        let connect_retry_max = opts
            .get_num("connect-retry-max", 0, 0u64, 0, 10_000)
            .unwrap_or(0);

        // External PKI applies when the profile omits the private key, or
        // when the host configured an alias outright.
        let external_pki = tls_config.external_pki || self.config.external_pki_alias.is_some();
        let signer = if external_pki {
            let alias = self
                .config
                .external_pki_alias
                .clone()
                .unwrap_or_else(|| "default".into());
            Some(Arc::new(HostSigner {
                shared: Arc::clone(&self.shared),
                alias,
            }) as Arc<dyn ExternalSigner>)
        } else {
            None
        };

        let rx = self.shared.commands.install();
        let tun = match self.tun.lock().take() {
            Some(tun) => tun,
            None => return Status::failure("CORE_ERROR", "session already running"),
        };
        let dco = self.dco.lock().take();

        // Foreign-thread access opens here, at the end of setup.
        self.shared.stats.mark_ready();

        let mut driver = SessionDriver {
            session: self,
            opts,
            tls_config,
            proxy,
            remotes,
            tun,
            dco,
            signer,
            external_pki,
            autologin,
            static_challenge,
            suppress_socket_protect,
            connect_retry_max,
            backoff_secs: 1,
            attempts: 0,
            started: Instant::now(),
            got_push: false,
            offloaded: false,
            ping_interval: Duration::from_secs(8),
            ping_restart: Duration::from_secs(60),
            dco_seen: DcoStats::default(),
        };
        let end = driver.run(rx).await;

        let SessionDriver { mut tun, dco, .. } = driver;
        tun.close();
        *self.tun.lock() = Some(tun);
        *self.dco.lock() = dco;

        let (status, fatal, info) = match end {
            SessionEnd::Stopped => (Status::ok(), false, String::new()),
            SessionEnd::Graceful {
                token,
                error,
                message,
            } => (Status::with_token(token, error, &message), false, message),
            SessionEnd::Fatal { code, message } => {
                (Status::failure(code.name(), &message), true, message)
            }
        };

        let mut event = Event::with_info(EventId::Disconnected, utf8_printable(&info, 256));
        if fatal {
            event = event.fatal();
        }
        self.emit(&event);
        status
    }

    fn build_remotes(&self, opts: &OptionList) -> Result<RemoteList> {
        if let Some(server) = &self.config.server_override {
            // Keep port/proto from the first profile remote, swap the host.
            let base = RemoteList::from_options(
                opts,
                self.config.proto_override,
                self.config.ip_version_override,
            )?;
            let first = base.current();
            let port = self.config.port_override.unwrap_or(first.port);
            let replacement = Remote::new(server, port, first.protocol, first.ip_version)?;
            let list = OptionList::parse(&format!(
                "remote {} {} {}\n",
                replacement.host,
                replacement.port,
                match replacement.protocol {
                    Protocol::Udp => "udp",
                    _ => "tcp",
                }
            ))?;
            return RemoteList::from_options(&list, None, Some(replacement.ip_version));
        }
        RemoteList::from_options(
            opts,
            self.config.proto_override,
            self.config.ip_version_override,
        )
    }

    fn emit(&self, event: &Event) {
        let host = self.shared.host.read().clone();
        tracing::info!(event = event.id.name(), info = %event.info, "event");
        host.log(&format!("EVENT: {} {}", event.id.name(), event.info));
        host.event(event);
    }
}

/// Hook adapter forwarding remote-override queries to the host.
struct HostOverrideHook {
    host: Arc<dyn HostCallbacks>,
}

impl RemoteOverrideHook for HostOverrideHook {
    fn next_remote(&self, current: &Remote) -> std::result::Result<Remote, String> {
        match self.host.remote_override(current)? {
            Some(remote) => Ok(remote),
            None => Ok(current.clone()),
        }
    }
}

/// External signer adapter: marshals sign requests to the host capability.
struct HostSigner {
    shared: Arc<SessionShared>,
    alias: String,
}

impl ExternalSigner for HostSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut req = ExternalPkiSignRequest::new(&self.alias, data, &SignAlgorithm::RsaPkcs1);
        let host = self.shared.host.read().clone();
        host.external_pki_sign_request(&mut req);
        req.take_signature()
    }
}

enum SessionEnd {
    Stopped,
    Graceful {
        token: &'static str,
        error: bool,
        message: String,
    },
    Fatal {
        code: ErrorCode,
        message: String,
    },
}

enum AttemptEnd {
    Stop,
    Pause(String),
    ReconnectDelay(Duration),
    Retry(ErrorCode),
    Fatal { code: ErrorCode, message: String },
    End(SessionEnd),
}

enum PauseEnd {
    Resumed,
    Stopped,
}

struct SessionDriver<'a> {
    session: &'a ClientSession,
    opts: OptionList,
    tls_config: TlsConfig,
    proxy: Option<ProxyConfig>,
    remotes: RemoteList,
    tun: Box<dyn TunDevice>,
    dco: Option<Box<dyn DcoDevice>>,
    signer: Option<Arc<dyn ExternalSigner>>,
    external_pki: bool,
    autologin: bool,
    static_challenge: bool,
    suppress_socket_protect: bool,
    connect_retry_max: u64,
    backoff_secs: u64,
    attempts: u64,
    started: Instant,
    got_push: bool,
    offloaded: bool,
    ping_interval: Duration,
    ping_restart: Duration,
    dco_seen: DcoStats,
}

impl SessionDriver<'_> {
    fn stats(&self) -> &StatsBank {
        &self.session.shared.stats
    }

    fn host(&self) -> Arc<dyn HostCallbacks> {
        self.session.shared.host.read().clone()
    }

    fn emit(&self, event: Event) {
        self.session.emit(&event);
    }

    async fn run(&mut self, mut rx: UnboundedReceiver<Command>) -> SessionEnd {
        loop {
            if self.session.shared.commands.stop_requested() {
                return SessionEnd::Stopped;
            }

            // Total connection timeout bounds the time to reach CONNECTED.
            if let Some(total) = self.session.config.conn_timeout {
                if self.started.elapsed() >= total {
                    if self.host().pause_on_connection_timeout() {
                        match self.pause_wait(&mut rx, "connection timeout").await {
                            PauseEnd::Stopped => return SessionEnd::Stopped,
                            PauseEnd::Resumed => {
                                self.started = Instant::now();
                                continue;
                            }
                        }
                    }
                    self.stats().count_error(ErrorCode::ConnectionTimeout);
                    self.emit(Event::new(EventId::ConnectionTimeout).fatal());
                    return SessionEnd::Fatal {
                        code: ErrorCode::ConnectionTimeout,
                        message: "failed to connect in time".into(),
                    };
                }
            }
            if self.connect_retry_max > 0 && self.attempts >= self.connect_retry_max {
                self.stats().count_error(ErrorCode::ConnectionTimeout);
                self.emit(Event::new(EventId::ConnectionTimeout).fatal());
                return SessionEnd::Fatal {
                    code: ErrorCode::ConnectionTimeout,
                    message: "connect-retry-max exceeded".into(),
                };
            }
            self.attempts += 1;

            match self.attempt(&mut rx).await {
                AttemptEnd::Stop => return SessionEnd::Stopped,
                AttemptEnd::End(end) => return end,
                AttemptEnd::Fatal { code, message } => {
                    if let Some(id) = event_for_error(code) {
                        self.emit(Event::with_info(id, utf8_printable(&message, 256)).fatal());
                    }
                    return SessionEnd::Fatal { code, message };
                }
                AttemptEnd::Pause(reason) => {
                    match self.pause_wait(&mut rx, &reason).await {
                        PauseEnd::Stopped => return SessionEnd::Stopped,
                        PauseEnd::Resumed => continue,
                    }
                }
                AttemptEnd::ReconnectDelay(delay) => {
                    self.stats().count_error(ErrorCode::NReconnect);
                    self.emit(Event::with_info(EventId::Reconnecting, "reconnect requested"));
                    if let PauseEnd::Stopped = self.backoff_sleep(&mut rx, delay).await {
                        return SessionEnd::Stopped;
                    }
                }
                AttemptEnd::Retry(code) => {
                    self.stats().count_error(ErrorCode::NReconnect);
                    self.emit(Event::with_info(EventId::Reconnecting, code.name()));
                    let delay = Duration::from_secs(self.backoff_secs);
                    self.backoff_secs = (self.backoff_secs + 1).min(5);
                    if let PauseEnd::Stopped = self.backoff_sleep(&mut rx, delay).await {
                        return SessionEnd::Stopped;
                    }
                }
            }
        }
    }

    async fn backoff_sleep(
        &mut self,
        rx: &mut UnboundedReceiver<Command>,
        delay: Duration,
    ) -> PauseEnd {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Stop) => return PauseEnd::Stopped,
                    Some(Command::Pause(reason)) => {
                        return self.pause_wait(rx, &reason).await;
                    }
                    Some(_) => continue,
                },
                _ = &mut sleep => return PauseEnd::Resumed,
            }
        }
    }

    async fn pause_wait(&mut self, rx: &mut UnboundedReceiver<Command>, reason: &str) -> PauseEnd {
        self.stats().count_error(ErrorCode::NPause);
        self.emit(Event::with_info(EventId::Pause, utf8_printable(reason, 256)));
        loop {
            match rx.recv().await {
                None | Some(Command::Stop) => return PauseEnd::Stopped,
                Some(Command::Resume) => {
                    self.emit(Event::new(EventId::Resume));
                    return PauseEnd::Resumed;
                }
                Some(Command::Reconnect(delay)) => {
                    tokio::time::sleep(delay).await;
                    self.emit(Event::new(EventId::Resume));
                    return PauseEnd::Resumed;
                }
                Some(_) => {}
            }
        }
    }

    async fn attempt(&mut self, rx: &mut UnboundedReceiver<Command>) -> AttemptEnd {
        let remote = match self.remotes.next() {
            Ok(r) => r,
            Err(e) => {
                self.stats().count_error(ErrorCode::ResolveError);
                return AttemptEnd::Fatal {
                    code: ErrorCode::ResolveError,
                    message: e.to_string(),
                };
            }
        };

        self.emit(Event::with_info(EventId::Resolve, remote.host.clone()));
        let addr = tokio::select! {
            biased;
            cmd = rx.recv() => return self.early_command(cmd),
            resolved = resolve(&remote) => match resolved {
                Ok(addrs) => addrs[0],
                Err(e) => {
                    self.stats().count_error(e.code());
                    return AttemptEnd::Retry(e.code());
                }
            },
        };

        self.emit(Event::with_info(EventId::Connecting, remote.describe()));
        let proxy = self.proxy.clone();
        let connect_timeout = self.session.config.connect_timeout;
        let mut link = tokio::select! {
            biased;
            cmd = rx.recv() => return self.early_command(cmd),
            connected = Link::connect(&remote, addr, connect_timeout, proxy.as_ref()) => {
                match connected {
                    Ok(link) => link,
                    Err(e) => {
                        self.stats().count_error(e.code());
                        if e.code() == ErrorCode::ProxyNeedCreds {
                            self.emit(Event::new(EventId::ProxyNeedCreds));
                            return AttemptEnd::Fatal {
                                code: ErrorCode::ProxyNeedCreds,
                                message: e.to_string(),
                            };
                        }
                        return AttemptEnd::Retry(e.code());
                    }
                }
            },
        };

        if !self.suppress_socket_protect {
            let protected = self.host().socket_protect(
                link.raw_fd(),
                addr.to_string().as_str(),
                addr.is_ipv6(),
            );
            if !protected {
                self.stats().count_error(ErrorCode::SocketProtectError);
                return AttemptEnd::Retry(ErrorCode::SocketProtectError);
            }
        }

        self.emit(Event::new(EventId::Wait));

        // External PKI: fetch the certificate chain from the host before
        // each handshake.
        if self.external_pki && self.tls_config.client_cert_pem.is_none() {
            let alias = self
                .session
                .config
                .external_pki_alias
                .clone()
                .unwrap_or_else(|| "default".into());
            let mut req = ExternalPkiCertRequest::new(&alias);
            self.host().external_pki_cert_request(&mut req);
            match req.take_chain() {
                Ok(chain) => self.tls_config.client_cert_pem = Some(chain),
                Err(e) => {
                    self.stats().count_error(ErrorCode::EpkiCertError);
                    return AttemptEnd::Fatal {
                        code: ErrorCode::EpkiCertError,
                        message: e.to_string(),
                    };
                }
            }
        }

        let credentials = if self.autologin {
            None
        } else {
            let creds = self.session.creds.lock();
            if !creds.defined() {
                return AttemptEnd::Fatal {
                    code: ErrorCode::NeedCreds,
                    message: "credentials required but not provided".into(),
                };
            }
            let pair = creds
                .auth_username()
                .and_then(|u| Ok((u, creds.auth_password(self.static_challenge)?)));
            match pair {
                Ok(pair) => Some(pair),
                Err(e) => {
                    return AttemptEnd::Fatal {
                        code: ErrorCode::NeedCreds,
                        message: e.to_string(),
                    }
                }
            }
        };

        let engine_config = match self.engine_config(credentials) {
            Ok(c) => c,
            Err(e) => {
                return AttemptEnd::Fatal {
                    code: e.code(),
                    message: e.to_string(),
                }
            }
        };

        let now = Instant::now();
        self.got_push = false;
        self.offloaded = false;
        let mut engine = ProtocolEngine::new(
            engine_config,
            Arc::clone(&self.session.tls_factory),
            self.signer.clone(),
            Arc::clone(&self.session.shared.stats),
            now,
        );
        if let Err(e) = engine.start(now) {
            self.stats().count_error(e.code());
            return AttemptEnd::Retry(e.code());
        }

        let end = self.steady(&mut engine, &mut link, rx).await;
        link.stop().await;
        end
    }

    fn early_command(&mut self, cmd: Option<Command>) -> AttemptEnd {
        match cmd {
            None | Some(Command::Stop) => AttemptEnd::Stop,
            Some(Command::Pause(reason)) => AttemptEnd::Pause(reason),
            Some(Command::Reconnect(delay)) => AttemptEnd::ReconnectDelay(delay),
            Some(_) => AttemptEnd::Retry(ErrorCode::NReconnect),
        }
    }

    /// Drive one established transport: handshake, then steady state.
    async fn steady(
        &mut self,
        engine: &mut ProtocolEngine,
        link: &mut Link,
        rx: &mut UnboundedReceiver<Command>,
    ) -> AttemptEnd {
        let mut tick = tokio::time::interval(Duration::from_millis(10));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_clock_tick = Instant::now();

        loop {
            // Flush engine output to the wire.
            while let Some(wire) = engine.poll_output() {
                if let Err(e) = link.send(wire).await {
                    self.stats().count_error(e.code());
                    return AttemptEnd::Retry(e.code());
                }
            }

            // Apply engine signals.
            while let Some(signal) = engine.poll_signal() {
                if let Some(end) = self.handle_signal(engine, link, signal) {
                    return end;
                }
            }

            if self.session.shared.commands.stop_requested() {
                engine.stop();
                return AttemptEnd::Stop;
            }

            let wake = engine
                .next_wake()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                cmd = rx.recv() => {
                    if let Some(end) = self.handle_command(engine, cmd) {
                        return end;
                    }
                }
                received = link.recv() => match received {
                    Ok(data) => {
                        if let Err(e) = engine.input(data, Instant::now()) {
                            if let Some(end) = self.classify(e) {
                                return end;
                            }
                        }
                    }
                    Err(e) if e.code() == ErrorCode::BadSrcAddr => {
                        self.stats().count_error(ErrorCode::BadSrcAddr);
                    }
                    Err(e) => {
                        self.stats().count_error(e.code());
                        return AttemptEnd::Retry(e.code());
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    if let Err(e) = engine.handle_time(Instant::now()) {
                        if let Some(end) = self.classify(e) {
                            return end;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.periodic(engine, &mut last_clock_tick);
                }
            }
        }
    }

    /// Bounded periodic work: tun pump, clock tick, offloaded stats.
    fn periodic(&mut self, engine: &mut ProtocolEngine, last_clock_tick: &mut Instant) {
        if engine.is_active() && !self.offloaded {
            let now = Instant::now();
            for _ in 0..32 {
                let Some(packet) = self.tun.try_recv() else {
                    break;
                };
                if let Err(e) = engine.tun_input(&packet, now) {
                    self.stats().count_error(e.code());
                }
            }
        }

        if let Some(rate) = self.session.config.clock_tick {
            if last_clock_tick.elapsed() >= rate {
                *last_clock_tick = Instant::now();
                self.host().clock_tick();
            }
        }

        if self.offloaded {
            let stats = Arc::clone(&self.session.shared.stats);
            if let Some(device) = self.dco.as_mut() {
                let now_stats = device.poll_stats();
                stats.inc(
                    crate::stats::Stat::TunBytesIn,
                    now_stats.bytes_out.saturating_sub(self.dco_seen.bytes_out),
                );
                stats.inc(
                    crate::stats::Stat::TunBytesOut,
                    now_stats.bytes_in.saturating_sub(self.dco_seen.bytes_in),
                );
                stats.inc(
                    crate::stats::Stat::TunPacketsIn,
                    now_stats
                        .packets_out
                        .saturating_sub(self.dco_seen.packets_out),
                );
                stats.inc(
                    crate::stats::Stat::TunPacketsOut,
                    now_stats
                        .packets_in
                        .saturating_sub(self.dco_seen.packets_in),
                );
                self.dco_seen = now_stats;
            }
        }
    }

    fn handle_command(
        &mut self,
        engine: &mut ProtocolEngine,
        cmd: Option<Command>,
    ) -> Option<AttemptEnd> {
        let now = Instant::now();
        match cmd {
            None | Some(Command::Stop) => {
                engine.stop();
                Some(AttemptEnd::Stop)
            }
            Some(Command::Pause(reason)) => {
                engine.stop();
                Some(AttemptEnd::Pause(reason))
            }
            Some(Command::Resume) => None,
            Some(Command::Reconnect(delay)) => {
                engine.stop();
                Some(AttemptEnd::ReconnectDelay(delay))
            }
            Some(Command::PostCcMsg(text)) => {
                if let Err(e) = engine.send_cc_message(&text, now) {
                    tracing::debug!("dropping cc message: {e}");
                }
                None
            }
            Some(Command::SendAppControl { protocol, payload }) => {
                let msg = ControlMessage::AppControl { protocol, payload };
                if let Err(e) = engine.send_control(&msg, now) {
                    tracing::debug!("dropping app control message: {e}");
                }
                None
            }
            Some(Command::StartCertCheck { epki_alias, .. }) => {
                tracing::info!(
                    epki = epki_alias.is_some(),
                    "cert-check handshake restarted"
                );
                None
            }
        }
    }

    fn handle_signal(
        &mut self,
        engine: &mut ProtocolEngine,
        link: &mut Link,
        signal: EngineSignal,
    ) -> Option<AttemptEnd> {
        let now = Instant::now();
        match signal {
            EngineSignal::HandshakeComplete => {
                if !self.autologin {
                    self.emit(Event::new(EventId::Auth));
                }
                self.emit(Event::new(EventId::GetConfig));
                if let Err(e) = engine.send_control(&ControlMessage::PushRequest, now) {
                    self.stats().count_error(e.code());
                    return Some(AttemptEnd::Retry(e.code()));
                }
                None
            }
            EngineSignal::Rekeyed { key_id } => {
                tracing::debug!(key_id, "rekeyed");
                if self.offloaded {
                    self.offload(engine, link);
                }
                None
            }
            EngineSignal::TunPacket(packet) => {
                if !self.offloaded {
                    if let Err(e) = self.tun.send(&packet) {
                        self.stats().count_error(ErrorCode::TunWriteError);
                        tracing::debug!("tun write failed: {e}");
                    }
                }
                None
            }
            EngineSignal::Control(msg) => self.handle_control(engine, link, msg),
        }
    }

    fn handle_control(
        &mut self,
        engine: &mut ProtocolEngine,
        link: &mut Link,
        msg: ControlMessage,
    ) -> Option<AttemptEnd> {
        match msg {
            ControlMessage::PushReply(csv) => {
                if self.got_push {
                    tracing::debug!("ignoring repeated push reply");
                    return None;
                }
                match self.process_push(engine, link, &csv) {
                    Ok(()) => None,
                    Err(e) => {
                        self.stats().count_error(e.code());
                        Some(AttemptEnd::Retry(e.code()))
                    }
                }
            }
            ControlMessage::AuthFailed(reason) => {
                if let Ok(challenge) = DynamicChallenge::parse(&reason) {
                    let event = Event::with_info(
                        EventId::DynamicChallenge,
                        challenge.challenge.clone(),
                    )
                    .with_payload(EventPayload::DynamicChallenge(challenge));
                    self.emit(event);
                    return Some(AttemptEnd::End(SessionEnd::Graceful {
                        token: "DYNAMIC_CHALLENGE",
                        error: false,
                        message: "dynamic challenge issued".into(),
                    }));
                }
                self.stats().count_error(ErrorCode::AuthFailed);
                // A rejected session token may still work with the real
                // password; fall back once.
                let purged = {
                    let mut creds = self.session.creds.lock();
                    if creds.session_token().is_some() {
                        creds.purge_session_token();
                        self.stats().count_error(ErrorCode::SessionExpired);
                        true
                    } else {
                        false
                    }
                };
                if purged || self.session.config.retry_on_auth_failed {
                    self.emit(Event::with_info(
                        EventId::AuthFailed,
                        utf8_printable(&reason, 256),
                    ));
                    Some(AttemptEnd::Retry(ErrorCode::AuthFailed))
                } else {
                    Some(AttemptEnd::Fatal {
                        code: ErrorCode::AuthFailed,
                        message: reason,
                    })
                }
            }
            ControlMessage::AuthPending { timeout } => {
                let info = match timeout {
                    Some(t) => format!("authentication pending, timeout {t}s"),
                    None => "authentication pending".into(),
                };
                self.emit(Event::with_info(EventId::Info, info));
                None
            }
            ControlMessage::Halt(reason) => {
                self.stats().count_error(ErrorCode::ClientHalt);
                Some(AttemptEnd::Fatal {
                    code: ErrorCode::ClientHalt,
                    message: reason,
                })
            }
            ControlMessage::Restart(reason) => {
                self.stats().count_error(ErrorCode::ClientRestart);
                self.emit(Event::with_info(
                    EventId::ClientRestart,
                    utf8_printable(&reason, 256),
                ));
                Some(AttemptEnd::Retry(ErrorCode::ClientRestart))
            }
            ControlMessage::Relay => {
                self.stats().count_error(ErrorCode::Relay);
                Some(AttemptEnd::Fatal {
                    code: ErrorCode::Relay,
                    message: "server requested relay".into(),
                })
            }
            ControlMessage::Info(text) => {
                if self.session.config.info {
                    self.emit(Event::with_info(EventId::Info, text));
                }
                None
            }
            ControlMessage::InfoPre(text) => {
                self.emit(Event::with_info(EventId::Info, text));
                None
            }
            ControlMessage::Echo(text) => {
                if self.session.config.echo {
                    self.emit(Event::with_info(EventId::Echo, text));
                }
                None
            }
            ControlMessage::AppControl { protocol, payload } => {
                self.host().acc_event(&AppControlMessage { protocol, payload });
                None
            }
            ControlMessage::PushRequest | ControlMessage::CrResponse(_) => None,
        }
    }

    fn process_push(
        &mut self,
        engine: &mut ProtocolEngine,
        link: &mut Link,
        csv: &str,
    ) -> Result<()> {
        let pushed = OptionList::parse_pushed(csv)?;

        // Keepalive parameters pushed by the server win over the profile.
        self.ping_interval = Duration::from_secs(pushed.get_num(
            "ping",
            0,
            self.ping_interval.as_secs(),
            1,
            3600,
        )?);
        self.ping_restart = Duration::from_secs(pushed.get_num(
            "ping-restart",
            0,
            self.ping_restart.as_secs(),
            1,
            7200,
        )?);
        engine.set_keepalive(self.ping_interval, self.ping_restart);

        if let Some(token) = pushed.get_optional("auth-token", 0, 256) {
            let username = {
                let mut creds = self.session.creds.lock();
                creds.set_session_token(&token);
                creds.username().to_string()
            };
            *self.session.shared.session_token.lock() = Some(SessionToken {
                username,
                session_id: token,
            });
        }

        self.remotes.process_push(&pushed)?;

        let settings = TunSettings::from_push(&pushed, &self.opts)?;
        self.emit(Event::with_info(
            EventId::AssignIp,
            settings.ip4.clone().unwrap_or_default(),
        ));
        let tun_name = match self.tun.establish(&settings) {
            Ok(name) => name,
            Err(e) => {
                return Err(Error::tagged(
                    ErrorCode::TunSetupFailed,
                    format!("tun setup failed: {e}"),
                ))
            }
        };
        self.emit(Event::with_info(
            EventId::AddRoutes,
            format!("{} routes", settings.routes.len()),
        ));

        let info = ConnectionInfo {
            defined: true,
            user: self.session.creds.lock().username().to_string(),
            server_host: self.remotes.current().host.clone(),
            server_port: link.peer_addr().port().to_string(),
            server_proto: self.remotes.current().protocol.name().to_string(),
            server_ip: link.peer_addr().ip().to_string(),
            vpn_ip4: settings.ip4.clone().unwrap_or_default(),
            vpn_ip6: settings.ip6.clone().unwrap_or_default(),
            vpn_mtu: settings.mtu.to_string(),
            gw4: settings.gw4.clone().unwrap_or_default(),
            gw6: settings.gw6.clone().unwrap_or_default(),
            tun_name,
        };
        *self.session.shared.connection_info.lock() = info.clone();

        self.emit(
            Event::with_info(
                EventId::Connected,
                format!("{}:{}", info.server_host, info.server_port),
            )
            .with_payload(EventPayload::Connected(Box::new(info))),
        );

        self.got_push = true;
        self.backoff_secs = 1;
        self.started = Instant::now();

        let unused = self.opts.unused();
        if !unused.is_empty() {
            self.stats().count_error(ErrorCode::UnusedOptions);
            self.emit(Event::with_info(
                EventId::Warn,
                format!("unused options: {}", unused.join(" ")),
            ));
        }

        if self.dco.is_some() {
            self.offload(engine, link);
        }
        Ok(())
    }

    /// Hand the data channel to the kernel device.
    fn offload(&mut self, engine: &mut ProtocolEngine, link: &mut Link) {
        let Some(device) = self.dco.as_mut() else {
            return;
        };
        let Some((key_id, tx, rx)) = engine.primary_key_material() else {
            return;
        };
        let handoff = DcoHandoff::new(link.peer_addr(), link.raw_fd(), key_id, &tx, &rx);
        match device.offload(handoff) {
            Ok(()) => {
                self.offloaded = true;
                tracing::info!(key_id, "data channel offloaded to kernel");
            }
            Err(e) => {
                tracing::warn!("kernel offload failed, staying in userspace: {e}");
            }
        }
    }

    /// Map an engine error onto the attempt outcome, counting it.
    fn classify(&mut self, error: Error) -> Option<AttemptEnd> {
        let code = error.code();
        self.stats().count_error(code);
        match code {
            ErrorCode::InactiveTimeout => Some(AttemptEnd::End(SessionEnd::Graceful {
                token: ErrorCode::InactiveTimeout.name(),
                error: false,
                message: "inactivity timeout".into(),
            })),
            code if code.is_fatal() => Some(AttemptEnd::Fatal {
                code,
                message: error.to_string(),
            }),
            code => Some(AttemptEnd::Retry(code)),
        }
    }

    fn engine_config(&mut self, credentials: Option<(String, String)>) -> Result<EngineConfig> {
        let opts = &self.opts;

        let reneg_secs = opts.get_num("reneg-sec", 0, 3600u64, 0, 604_800)?;
        let reneg_bytes = opts
            .find("reneg-bytes")
            .and_then(|o| o.arg(0))
            .and_then(|s| s.parse().ok());
        let reneg_pkts = opts
            .find("reneg-pkts")
            .and_then(|o| o.arg(0))
            .and_then(|s| s.parse().ok());

        // keepalive n m is shorthand for ping + ping-restart.
        let (ping, restart) = if let Some(opt) = opts.find("keepalive") {
            let ping: u64 = opt
                .arg(0)
                .and_then(|s| s.parse().ok())
                .unwrap_or(8);
            let restart: u64 = opt
                .arg(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(ping * 8);
            (ping, restart)
        } else {
            (
                opts.get_num("ping", 0, 8u64, 1, 3600)?,
                opts.get_num("ping-restart", 0, 60u64, 1, 7200)?,
            )
        };
        self.ping_interval = Duration::from_secs(ping);
        self.ping_restart = Duration::from_secs(restart);

        let inactive = opts.get_num("inactive", 0, 0u64, 0, 604_800)?;
        let hand_window = opts.get_num("hand-window", 0, 60u64, 5, 600)?;

        let compression = if opts.exists("compress") {
            Compression::Stub
        } else if opts.exists("comp-lzo") {
            tracing::warn!("legacy compression requested, using stub framing only");
            Compression::Stub
        } else {
            Compression::Disabled
        };

        let cipher = opts
            .get_optional("cipher", 0, 64)
            .unwrap_or_else(|| "CHACHA20-POLY1305".into());
        let auth_mode = if cipher.contains("CBC") {
            AuthMode::CipherAndHmac
        } else {
            AuthMode::Aead
        };
        let auth_digest = opts
            .get_optional("auth", 0, 32)
            .unwrap_or_else(|| "SHA256".into());

        let options_string = format!(
            "V4,dev-type tun,cipher {cipher},auth {auth_digest},keysize 256,tls-client"
        );

        let config = &self.session.config;
        let mut peer_info = vec![
            ("IV_VER".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("IV_PLAT".to_string(), std::env::consts::OS.to_string()),
            ("IV_PROTO".to_string(), "2".to_string()),
            (
                "IV_CIPHERS".to_string(),
                "CHACHA20-POLY1305:AES-256-GCM".to_string(),
            ),
        ];
        if !config.gui_version.is_empty() {
            peer_info.push(("IV_GUI_VER".into(), config.gui_version.clone()));
        }
        if !config.sso_methods.is_empty() {
            peer_info.push(("IV_SSO".into(), config.sso_methods.clone()));
        }
        if !config.app_custom_protocols.is_empty() {
            peer_info.push(("IV_ACC".into(), config.app_custom_protocols.clone()));
        }
        if !config.platform_version.is_empty() {
            peer_info.push(("IV_PLAT_VER".into(), config.platform_version.clone()));
        }
        peer_info.extend(config.peer_info.iter().cloned());

        Ok(EngineConfig {
            tls: self.tls_config.clone(),
            auth_mode,
            renegotiation: RekeyLimits {
                reneg_secs,
                reneg_bytes,
                reneg_pkts,
            },
            ping_interval: self.ping_interval,
            ping_restart: self.ping_restart,
            inactive_timeout: (inactive > 0).then(|| Duration::from_secs(inactive)),
            handshake_window: Duration::from_secs(hand_window),
            compression,
            options_string,
            peer_info,
            credentials,
            peer_id: None,
        })
    }
}
