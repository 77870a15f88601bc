//! Per-connection protocol engine.
//!
//! The engine is a sans-io state machine: the connect loop feeds it packets
//! from the transport and packets from the tun device, polls it for outgoing
//! wire packets and for signals, and calls into it when timers expire. It
//! owns the key choreography:
//!
//! ```text
//! INITIAL ──hard reset──▶ WAIT_RESET_ACK ──server reset──▶ WAIT_AUTH
//!     (TLS records as CONTROL_V1, then key exchange)          │
//!                                                             ▼
//!                      ACTIVE ◀──install first generation─────┘
//!                        │ soft reset (rekey) in background
//!                        ▼
//!                      ACTIVE' (new primary, old key lame-ducks)
//! ```
//!
//! Bounded errors (bad packet, replay, unknown key id) are counted and
//! dropped; connection-scoped failures surface as `Err` and restart the
//! outer connect loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::crypto::{
    AuthMode, DataContext, Direction, DirectionKeys, KeyExpansion, KeyRing, KeySource,
    RekeyLimits,
};
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::control::{
    split_messages, ControlMessage, KeyExchangeMessage,
};
use crate::protocol::{
    AckPacket, ControlPacket, DataPacket, Opcode, Packet, SessionId,
};
use crate::reliability::{AckQueue, PacketIdSend, RecvReliable, ReplayWindow, SendReliable};
use crate::stats::{Stat, StatsBank};
use crate::tls::{ExternalSigner, TlsConfig, TlsSession, TlsSessionFactory};

/// Data-channel keepalive magic, recognised after decrypt.
pub const PING_MAGIC: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

/// Compression stub opcode: payload is uncompressed.
const COMP_STUB: u8 = 0xFA;

/// Compression stub opcode: first and last payload bytes swapped.
const COMP_SWAP: u8 = 0xFB;

/// Data-channel compression framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No framing byte at all.
    #[default]
    Disabled,
    /// One stub opcode byte ahead of every payload.
    Stub,
}

impl Compression {
    pub(crate) fn encode(self, payload: &[u8]) -> Vec<u8> {
        match self {
            Compression::Disabled => payload.to_vec(),
            Compression::Stub => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.push(COMP_STUB);
                out.extend_from_slice(payload);
                out
            }
        }
    }

    pub(crate) fn decode(self, payload: &[u8]) -> std::result::Result<Vec<u8>, ErrorCode> {
        match self {
            Compression::Disabled => Ok(payload.to_vec()),
            Compression::Stub => match payload.first() {
                Some(&COMP_STUB) => Ok(payload[1..].to_vec()),
                Some(&COMP_SWAP) => {
                    let mut out = payload[1..].to_vec();
                    let len = out.len();
                    if len >= 2 {
                        out.swap(0, len - 1);
                    }
                    Ok(out)
                }
                _ => Err(ErrorCode::CompressError),
            },
        }
    }
}

/// Engine configuration, resolved from the profile and host config.
pub struct EngineConfig {
    pub tls: TlsConfig,
    pub auth_mode: AuthMode,
    pub renegotiation: RekeyLimits,
    /// Keepalive send interval.
    pub ping_interval: Duration,
    /// Reconnect after this long without any received packet.
    pub ping_restart: Duration,
    /// Optional inactivity disconnect (no tun traffic).
    pub inactive_timeout: Option<Duration>,
    /// Handshake completion deadline per negotiation.
    pub handshake_window: Duration,
    pub compression: Compression,
    /// Options string exchanged for compatibility checking.
    pub options_string: String,
    /// Peer-info key/values sent with the key exchange.
    pub peer_info: Vec<(String, String)>,
    /// Credentials for this attempt, when the profile is not autologin.
    pub credentials: Option<(String, String)>,
    /// Peer id for the V2 data framing.
    pub peer_id: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tls: TlsConfig::default(),
            auth_mode: AuthMode::Aead,
            renegotiation: RekeyLimits::default(),
            ping_interval: Duration::from_secs(8),
            ping_restart: Duration::from_secs(60),
            inactive_timeout: None,
            handshake_window: Duration::from_secs(60),
            compression: Compression::Disabled,
            options_string: String::new(),
            peer_info: Vec::new(),
            credentials: None,
            peer_id: None,
        }
    }
}

/// Milestones and payloads the engine hands up to the connect loop.
#[derive(Debug)]
pub enum EngineSignal {
    /// First key generation installed; the control channel is usable.
    HandshakeComplete,
    /// A background renegotiation finished and was promoted.
    Rekeyed { key_id: u8 },
    /// A post-handshake control message arrived.
    Control(ControlMessage),
    /// A decrypted IP packet for the tun device.
    TunPacket(Vec<u8>),
}

/// Per-key-id control channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// Our reset is out; waiting for the server's.
    WaitResetAck,
    /// TLS and key exchange in progress.
    WaitAuth,
    /// Keys installed; channel carries post-handshake messages.
    Active,
}

/// Overall engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initial,
    Handshaking,
    Active,
    Exiting,
}

struct ControlContext {
    key_id: u8,
    state: KeyState,
    /// Initial handshake (true) or background rekey (false).
    initial: bool,
    tls: Box<dyn TlsSession>,
    send: SendReliable,
    recv: RecvReliable,
    acks: AckQueue,
    ids: PacketIdSend,
    key_source: KeySource,
    key_exchange_sent: bool,
    peer_verified: bool,
    deadline: Option<Instant>,
}

impl ControlContext {
    fn new(
        key_id: u8,
        initial: bool,
        tls: Box<dyn TlsSession>,
        now: Instant,
        handshake_window: Duration,
    ) -> Self {
        Self {
            key_id,
            state: KeyState::WaitResetAck,
            initial,
            tls,
            send: SendReliable::new(),
            recv: RecvReliable::new(),
            acks: AckQueue::new(),
            ids: PacketIdSend::new(),
            key_source: KeySource::new_client(),
            key_exchange_sent: false,
            peer_verified: false,
            deadline: Some(now + handshake_window),
        }
    }
}

struct DataKeys {
    tx: DataContext,
    rx: DataContext,
    tx_ids: PacketIdSend,
    rx_replay: ReplayWindow,
    /// Raw direction keys, retained for kernel offload handoff.
    tx_keys: DirectionKeys,
    rx_keys: DirectionKeys,
}

/// The per-connection control/data state machine.
pub struct ProtocolEngine {
    config: EngineConfig,
    stats: Arc<StatsBank>,
    tls_factory: Arc<dyn TlsSessionFactory>,
    signer: Option<Arc<dyn ExternalSigner>>,

    state: EngineState,
    local_session_id: SessionId,
    remote_session_id: Option<SessionId>,

    primary_ctl: Option<ControlContext>,
    reneg_ctl: Option<ControlContext>,
    keys: KeyRing<DataKeys>,

    out: VecDeque<Bytes>,
    signals: VecDeque<EngineSignal>,

    last_send: Instant,
    last_recv: Instant,
    last_tun: Instant,
}

impl ProtocolEngine {
    /// Build an engine for one connection attempt.
    pub fn new(
        config: EngineConfig,
        tls_factory: Arc<dyn TlsSessionFactory>,
        signer: Option<Arc<dyn ExternalSigner>>,
        stats: Arc<StatsBank>,
        now: Instant,
    ) -> Self {
        Self {
            config,
            stats,
            tls_factory,
            signer,
            state: EngineState::Initial,
            local_session_id: SessionId::random(),
            remote_session_id: None,
            primary_ctl: None,
            reneg_ctl: None,
            keys: KeyRing::new(),
            out: VecDeque::new(),
            signals: VecDeque::new(),
            last_send: now,
            last_recv: now,
            last_tun: now,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether the first handshake has completed.
    pub fn is_active(&self) -> bool {
        self.state == EngineState::Active
    }

    /// Local 64-bit session id.
    pub fn session_id(&self) -> SessionId {
        self.local_session_id
    }

    /// Begin the initial handshake: send the client hard reset.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != EngineState::Initial {
            return Err(Error::proto("engine already started"));
        }
        self.state = EngineState::Handshaking;

        let tls = self
            .tls_factory
            .new_session(&self.config.tls, self.signer.clone())?;
        let mut ctl = ControlContext::new(0, true, tls, now, self.config.handshake_window);
        ctl.tls.start_handshake()?;

        let (opcode, payload) = match &self.config.tls.tls_crypt_v2_key {
            Some(blob) => (
                Opcode::ControlHardResetClientV3,
                Bytes::from(blob.clone().into_bytes()),
            ),
            None => (Opcode::ControlHardResetClientV2, Bytes::new()),
        };
        self.send_reliable(&mut ctl, opcode, payload, now)?;
        self.primary_ctl = Some(ctl);
        Ok(())
    }

    /// Ask the engine to stop; pending output can still be drained.
    pub fn stop(&mut self) {
        self.state = EngineState::Exiting;
    }

    /// Next outgoing wire packet, if any.
    pub fn poll_output(&mut self) -> Option<Bytes> {
        self.out.pop_front()
    }

    /// Next signal for the connect loop, if any.
    pub fn poll_signal(&mut self) -> Option<EngineSignal> {
        self.signals.pop_front()
    }

    /// Feed one packet received from the transport.
    pub fn input(&mut self, data: Bytes, now: Instant) -> Result<()> {
        if self.state == EngineState::Exiting {
            return Ok(());
        }
        self.stats.inc(Stat::BytesIn, data.len() as u64);
        self.stats.inc(Stat::PacketsIn, 1);

        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(_) => {
                self.stats.count_error(ErrorCode::BufferError);
                return Ok(());
            }
        };
        self.stats.note_packet_received();
        self.last_recv = now;

        match packet {
            Packet::Data(p) => self.input_data(p, now),
            Packet::Ack(p) => {
                self.check_remote_session(&p.session_id)?;
                if let Some(ctl) = self.ctl_for_key(p.key_id) {
                    ctl.send.on_ack(&p.acks);
                }
                Ok(())
            }
            Packet::Control(p) => self.input_control(p, now),
        }
    }

    /// Feed one IP packet read from the tun device.
    pub fn tun_input(&mut self, packet: &[u8], now: Instant) -> Result<()> {
        if self.state != EngineState::Active {
            self.stats.count_error(ErrorCode::KevPendingError);
            return Ok(());
        }
        self.stats.inc(Stat::TunBytesIn, packet.len() as u64);
        self.stats.inc(Stat::TunPacketsIn, 1);
        self.last_tun = now;
        self.send_data(packet, now)
    }

    /// Send a raw control-channel text message over the active channel.
    pub fn send_cc_message(&mut self, text: &str, now: Instant) -> Result<()> {
        let mut ctl = self
            .primary_ctl
            .take()
            .ok_or_else(|| Error::proto("control channel not established"))?;
        let result = (|| -> Result<()> {
            if ctl.state != KeyState::Active {
                return Err(Error::proto("control channel not yet active"));
            }
            let mut msg = text.as_bytes().to_vec();
            msg.push(0);
            ctl.tls.write_plaintext(&msg)?;
            self.pump_tls(&mut ctl, now)
        })();
        self.primary_ctl = Some(ctl);
        result
    }

    /// Send a parsed control message.
    pub fn send_control(&mut self, msg: &ControlMessage, now: Instant) -> Result<()> {
        self.send_cc_message(&msg.render(), now)
    }

    /// Drive time-based work: retransmits, keepalive, rekey, timeouts.
    pub fn handle_time(&mut self, now: Instant) -> Result<()> {
        if self.state == EngineState::Exiting {
            return Ok(());
        }

        for slot in [CtlSlot::Primary, CtlSlot::Reneg] {
            let Some(mut ctl) = self.take_ctl(slot) else {
                continue;
            };
            let result = self.ctl_handle_time(&mut ctl, now);
            self.store_ctl(slot, ctl);
            result?;
        }

        if self.state == EngineState::Active {
            // Keepalive send.
            if now.duration_since(self.last_send) >= self.config.ping_interval {
                self.send_ping(now)?;
            }
            // Peer liveness.
            if now.duration_since(self.last_recv) >= self.config.ping_restart {
                return Err(Error::Timeout("keepalive"));
            }
            // Tun inactivity.
            if let Some(limit) = self.config.inactive_timeout {
                if now.duration_since(self.last_tun) >= limit {
                    return Err(Error::Timeout("inactive"));
                }
            }
            // Background rekey.
            if self.reneg_ctl.is_none() {
                let due = self.keys.primary().is_some_and(|gen| {
                    self.config.renegotiation.due(
                        now.duration_since(gen.installed),
                        gen.bytes,
                        gen.packets,
                    )
                });
                if due {
                    self.start_rekey(now)?;
                }
            }
        }

        if self.keys.retire_expired(now) {
            tracing::debug!("lame duck key generation retired");
        }
        Ok(())
    }

    /// Earliest instant at which `handle_time` has work to do.
    pub fn next_wake(&self) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                wake = Some(match wake {
                    Some(w) => w.min(t),
                    None => t,
                });
            }
        };

        for ctl in [&self.primary_ctl, &self.reneg_ctl].into_iter().flatten() {
            consider(ctl.deadline);
            consider(ctl.send.next_timeout());
        }
        if self.state == EngineState::Active {
            consider(Some(self.last_send + self.config.ping_interval));
            consider(Some(self.last_recv + self.config.ping_restart));
            if let Some(limit) = self.config.inactive_timeout {
                consider(Some(self.last_tun + limit));
            }
            if self.reneg_ctl.is_none() {
                if let Some(gen) = self.keys.primary() {
                    if self.config.renegotiation.reneg_secs > 0 {
                        consider(Some(
                            gen.installed
                                + Duration::from_secs(self.config.renegotiation.reneg_secs),
                        ));
                    }
                }
            }
        }
        wake
    }

    /// Apply server-pushed keepalive parameters.
    pub fn set_keepalive(&mut self, interval: Duration, restart: Duration) {
        self.config.ping_interval = interval;
        self.config.ping_restart = restart;
    }

    /// Raw key material of the current primary generation, for kernel
    /// offload. `None` until the first generation is installed.
    pub fn primary_key_material(&self) -> Option<(u8, DirectionKeys, DirectionKeys)> {
        self.keys
            .primary()
            .map(|gen| (gen.key_id, gen.context.tx_keys.clone(), gen.context.rx_keys.clone()))
    }

    /// Kick off a background renegotiation (soft reset).
    pub fn start_rekey(&mut self, now: Instant) -> Result<()> {
        if self.reneg_ctl.is_some() || self.state != EngineState::Active {
            return Ok(());
        }
        self.stats.count_error(ErrorCode::NKeyLimitReneg);

        let key_id = self.keys.next_key_id();
        let tls = self
            .tls_factory
            .new_session(&self.config.tls, self.signer.clone())?;
        let mut ctl =
            ControlContext::new(key_id, false, tls, now, self.config.handshake_window);
        ctl.tls.start_handshake()?;
        self.send_reliable(&mut ctl, Opcode::ControlSoftResetV1, Bytes::new(), now)?;
        tracing::debug!(key_id, "starting key renegotiation");
        self.reneg_ctl = Some(ctl);
        Ok(())
    }

    // ---- internals ----------------------------------------------------

    fn queue_out(&mut self, wire: Bytes, now: Instant) {
        self.stats.inc(Stat::BytesOut, wire.len() as u64);
        self.stats.inc(Stat::PacketsOut, 1);
        self.last_send = now;
        self.out.push_back(wire);
    }

    fn send_reliable(
        &mut self,
        ctl: &mut ControlContext,
        opcode: Opcode,
        payload: Bytes,
        now: Instant,
    ) -> Result<()> {
        let packet_id = ctl.ids.next_id()?;
        let acks = ctl.acks.take_batch();
        let remote_session_id = if acks.is_empty() {
            None
        } else {
            Some(self.expect_remote()?)
        };
        let wire = Packet::Control(ControlPacket {
            opcode,
            key_id: ctl.key_id,
            session_id: self.local_session_id,
            acks,
            remote_session_id,
            packet_id,
            payload,
        })
        .encode();
        ctl.send.schedule(packet_id, wire.clone(), now)?;
        self.queue_out(wire, now);
        Ok(())
    }

    fn flush_acks(&mut self, ctl: &mut ControlContext, now: Instant) -> Result<()> {
        while !ctl.acks.is_empty() {
            let acks = ctl.acks.take_batch();
            let wire = Packet::Ack(AckPacket {
                key_id: ctl.key_id,
                session_id: self.local_session_id,
                acks,
                remote_session_id: self.expect_remote()?,
            })
            .encode();
            self.queue_out(wire, now);
        }
        Ok(())
    }

    fn expect_remote(&self) -> Result<SessionId> {
        self.remote_session_id
            .ok_or_else(|| Error::proto("remote session id not yet known"))
    }

    fn check_remote_session(&mut self, claimed: &SessionId) -> Result<()> {
        match self.remote_session_id {
            None => Ok(()),
            Some(known) if known == *claimed => Ok(()),
            Some(_) => Err(Error::proto(
                "server session id changed on one connection",
            )),
        }
    }

    fn ctl_for_key(&mut self, key_id: u8) -> Option<&mut ControlContext> {
        if self
            .primary_ctl
            .as_ref()
            .is_some_and(|c| c.key_id == key_id)
        {
            return self.primary_ctl.as_mut();
        }
        if self.reneg_ctl.as_ref().is_some_and(|c| c.key_id == key_id) {
            return self.reneg_ctl.as_mut();
        }
        None
    }

    fn take_ctl(&mut self, slot: CtlSlot) -> Option<ControlContext> {
        match slot {
            CtlSlot::Primary => self.primary_ctl.take(),
            CtlSlot::Reneg => self.reneg_ctl.take(),
        }
    }

    fn store_ctl(&mut self, slot: CtlSlot, ctl: ControlContext) {
        match slot {
            CtlSlot::Primary => self.primary_ctl = Some(ctl),
            CtlSlot::Reneg => self.reneg_ctl = Some(ctl),
        }
    }

    fn slot_for_key(&self, key_id: u8) -> Option<CtlSlot> {
        if self
            .primary_ctl
            .as_ref()
            .is_some_and(|c| c.key_id == key_id)
        {
            Some(CtlSlot::Primary)
        } else if self.reneg_ctl.as_ref().is_some_and(|c| c.key_id == key_id) {
            Some(CtlSlot::Reneg)
        } else {
            None
        }
    }

    fn input_control(&mut self, packet: ControlPacket, now: Instant) -> Result<()> {
        // Session id bookkeeping. The server's first reset announces its id;
        // a different id on the same connection afterwards is fatal.
        if packet.opcode == Opcode::ControlHardResetServerV2
            || packet.opcode == Opcode::ControlHardResetServerV1
        {
            self.check_remote_session(&packet.session_id)?;
            self.remote_session_id = Some(packet.session_id);
        } else {
            self.check_remote_session(&packet.session_id)?;
        }

        // Server-initiated soft reset: acknowledge by starting our own
        // renegotiation on the announced key id.
        if packet.opcode == Opcode::ControlSoftResetV1 && self.reneg_ctl.is_none() {
            self.start_rekey(now)?;
        }

        let Some(slot) = self.slot_for_key(packet.key_id) else {
            self.stats.count_error(ErrorCode::KeyStateError);
            return Ok(());
        };
        let mut ctl = self.take_ctl(slot).expect("slot checked above");
        let result = self.process_control(&mut ctl, packet, now);

        // A finished renegotiation replaces the primary control channel.
        let promote = slot == CtlSlot::Reneg && ctl.state == KeyState::Active;
        if promote {
            self.primary_ctl = Some(ctl);
        } else {
            self.store_ctl(slot, ctl);
        }
        result
    }

    fn process_control(
        &mut self,
        ctl: &mut ControlContext,
        packet: ControlPacket,
        now: Instant,
    ) -> Result<()> {
        if !packet.acks.is_empty() {
            ctl.send.on_ack(&packet.acks);
        }

        match packet.opcode {
            Opcode::ControlHardResetServerV1 | Opcode::ControlHardResetServerV2 => {
                if ctl.state == KeyState::WaitResetAck {
                    ctl.state = KeyState::WaitAuth;
                }
                // The server's reset consumes a packet id we must ack.
                match ctl.recv.receive(packet.packet_id, packet.payload) {
                    Ok(_) => ctl.acks.push(packet.packet_id),
                    Err(code) => {
                        self.stats.count_error(ErrorCode::ReplayError);
                        self.stats.count_error(code);
                        // Re-ack so the server stops retransmitting.
                        ctl.acks.push(packet.packet_id);
                    }
                }
            }
            Opcode::ControlSoftResetV1 => {
                if ctl.state == KeyState::WaitResetAck {
                    ctl.state = KeyState::WaitAuth;
                }
                match ctl.recv.receive(packet.packet_id, packet.payload) {
                    Ok(_) => ctl.acks.push(packet.packet_id),
                    Err(code) => {
                        self.stats.count_error(ErrorCode::ReplayError);
                        self.stats.count_error(code);
                        ctl.acks.push(packet.packet_id);
                    }
                }
            }
            Opcode::ControlV1 => {
                match ctl.recv.receive(packet.packet_id, packet.payload) {
                    Ok(records) => {
                        ctl.acks.push(packet.packet_id);
                        for record in records {
                            ctl.tls.push_ciphertext(&record)?;
                        }
                    }
                    Err(code) => {
                        self.stats.count_error(ErrorCode::ReplayError);
                        self.stats.count_error(code);
                        ctl.acks.push(packet.packet_id);
                    }
                }
                // An unexpected control packet while still waiting for the
                // reset ack is a key-state violation.
                if ctl.state == KeyState::WaitResetAck {
                    self.stats.count_error(ErrorCode::KeyStateError);
                    ctl.state = KeyState::WaitAuth;
                }
            }
            other => {
                self.stats.count_error(ErrorCode::KeyStateError);
                tracing::debug!(?other, "unexpected control opcode");
                return Ok(());
            }
        }

        self.pump_tls(ctl, now)?;
        self.flush_acks(ctl, now)
    }

    /// Move the TLS session forward: drain outgoing records, run the key
    /// exchange once established, deliver post-handshake messages.
    fn pump_tls(&mut self, ctl: &mut ControlContext, now: Instant) -> Result<()> {
        loop {
            let mut progressed = false;

            while let Some(record) = ctl.tls.pull_ciphertext() {
                self.send_reliable(ctl, Opcode::ControlV1, record, now)?;
                progressed = true;
            }

            if ctl.state == KeyState::WaitAuth && ctl.tls.is_established() {
                if !ctl.peer_verified {
                    self.verify_peer(ctl)?;
                    ctl.peer_verified = true;
                }
                if !ctl.key_exchange_sent {
                    let msg = KeyExchangeMessage {
                        key_source: ctl.key_source.clone(),
                        options_string: self.config.options_string.clone(),
                        username: self.config.credentials.as_ref().map(|c| c.0.clone()),
                        password: self.config.credentials.as_ref().map(|c| c.1.clone()),
                        peer_info: self.config.peer_info.clone(),
                    };
                    ctl.tls.write_plaintext(&msg.encode_client())?;
                    ctl.key_exchange_sent = true;
                    progressed = true;
                }
            }

            while let Some(plain) = ctl.tls.read_plaintext()? {
                progressed = true;
                if ctl.state == KeyState::WaitAuth {
                    self.install_keys(ctl, &plain, now)?;
                } else {
                    for line in split_messages(&plain) {
                        match ControlMessage::parse(&line) {
                            Some(msg) => self.signals.push_back(EngineSignal::Control(msg)),
                            None => {
                                tracing::debug!("ignoring unknown control message");
                            }
                        }
                    }
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn verify_peer(&mut self, ctl: &mut ControlContext) -> Result<()> {
        let version = ctl
            .tls
            .negotiated_version()
            .ok_or_else(|| Error::tls("no negotiated TLS version"))?;
        match ctl.tls.peer_certificate() {
            Some(cert) => {
                if let Err((code, msg)) = self.config.tls.verify_peer(&cert, version) {
                    return Err(Error::tagged(code, msg));
                }
            }
            None => {
                let policy_needs_cert = !self.config.tls.peer_fingerprints.is_empty()
                    || self.config.tls.ns_cert_type.is_some()
                    || !self.config.tls.remote_cert_ku.is_empty()
                    || self.config.tls.remote_cert_eku.is_some()
                    || self.config.tls.x509_name_check.is_some();
                if policy_needs_cert {
                    return Err(Error::tagged(
                        ErrorCode::CertVerifyFail,
                        "peer presented no certificate",
                    ));
                }
            }
        }
        Ok(())
    }

    fn install_keys(&mut self, ctl: &mut ControlContext, reply: &[u8], now: Instant) -> Result<()> {
        let (server_source, server_options) = KeyExchangeMessage::decode_server(reply)
            .map_err(|e| {
                self.stats.count_error(ErrorCode::KevNegotiateError);
                e
            })?;
        if !server_options.is_empty() && server_options != self.config.options_string {
            tracing::warn!("options string mismatch with peer");
        }

        let remote = self.expect_remote()?;
        let expansion = KeyExpansion::generate(
            &ctl.key_source,
            &server_source,
            self.local_session_id.as_bytes(),
            remote.as_bytes(),
        );
        let tx_keys = DirectionKeys::from_expansion(&expansion, Direction::Encrypt, false);
        let rx_keys = DirectionKeys::from_expansion(&expansion, Direction::Decrypt, false);
        let data_keys = DataKeys {
            tx: DataContext::new(&tx_keys, self.config.auth_mode),
            rx: DataContext::new(&rx_keys, self.config.auth_mode),
            tx_ids: PacketIdSend::new(),
            rx_replay: ReplayWindow::new(),
            tx_keys,
            rx_keys,
        };

        ctl.state = KeyState::Active;
        ctl.deadline = None;

        if ctl.initial {
            self.keys.install_first(ctl.key_id, data_keys, now)?;
            self.state = EngineState::Active;
            self.signals.push_back(EngineSignal::HandshakeComplete);
            tracing::info!(key_id = ctl.key_id, "data channel keys installed");
        } else {
            self.keys.install_secondary(ctl.key_id, data_keys, now)?;
            self.keys
                .promote_secondary(now, self.config.ping_interval)?;
            self.signals
                .push_back(EngineSignal::Rekeyed { key_id: ctl.key_id });
            tracing::info!(key_id = ctl.key_id, "rekey complete, generation promoted");
        }
        Ok(())
    }

    fn input_data(&mut self, packet: DataPacket, now: Instant) -> Result<()> {
        let aad = packet.aad();
        let Some((gen, _role)) = self.keys.lookup_mut(packet.key_id) else {
            self.stats.count_error(ErrorCode::KeyStateError);
            return Ok(());
        };

        if let Err(code) = gen.context.rx_replay.test_add(packet.packet_id as u64) {
            self.stats.count_error(ErrorCode::ReplayError);
            self.stats.count_error(code);
            return Ok(());
        }

        let plain = match gen.context.rx.open(
            packet.packet_id as u64,
            &aad,
            &packet.payload,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.stats.count_error(e.code());
                return Ok(());
            }
        };
        gen.account(plain.len());

        if plain.as_slice() == PING_MAGIC {
            tracing::trace!("keepalive ping received");
            return Ok(());
        }

        let payload = match self.config.compression.decode(&plain) {
            Ok(p) => p,
            Err(code) => {
                self.stats.count_error(code);
                return Ok(());
            }
        };

        self.last_tun = now;
        self.stats.inc(Stat::TunBytesOut, payload.len() as u64);
        self.stats.inc(Stat::TunPacketsOut, 1);
        self.signals.push_back(EngineSignal::TunPacket(payload));
        Ok(())
    }

    fn send_data(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        let framed = self.config.compression.encode(payload);
        let peer_id = self.config.peer_id;
        let Some(gen) = self.keys.primary_mut() else {
            self.stats.count_error(ErrorCode::KevPendingError);
            return Ok(());
        };
        let packet_id = gen.context.tx_ids.next_id()?;
        let mut packet = DataPacket {
            opcode: if peer_id.is_some() {
                Opcode::DataV2
            } else {
                Opcode::DataV1
            },
            key_id: gen.key_id,
            peer_id,
            packet_id,
            payload: Bytes::new(),
        };
        let sealed = gen
            .context
            .tx
            .seal(packet_id as u64, &packet.aad(), &framed)?;
        gen.account(framed.len());
        packet.payload = Bytes::from(sealed);
        let wire = Packet::Data(packet).encode();
        self.queue_out(wire, now);
        Ok(())
    }

    fn send_ping(&mut self, now: Instant) -> Result<()> {
        tracing::trace!("sending keepalive ping");
        self.send_data(&PING_MAGIC, now)
    }

    fn ctl_handle_time(&mut self, ctl: &mut ControlContext, now: Instant) -> Result<()> {
        if let Some(deadline) = ctl.deadline {
            if now >= deadline {
                return Err(Error::Timeout("handshake"));
            }
        }
        for (_, wire) in ctl.send.due_retransmits(now) {
            self.queue_out(wire, now);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtlSlot {
    Primary,
    Reneg,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeServer;
    use crate::tls::MemoryTlsFactory;

    fn test_engine(config: EngineConfig) -> (ProtocolEngine, Arc<StatsBank>, Instant) {
        let stats = Arc::new(StatsBank::new());
        stats.mark_ready();
        let factory = Arc::new(MemoryTlsFactory::default());
        let now = Instant::now();
        let engine = ProtocolEngine::new(config, factory, None, Arc::clone(&stats), now);
        (engine, stats, now)
    }

    fn pump(engine: &mut ProtocolEngine, server: &mut FakeServer, now: Instant) {
        for _ in 0..20 {
            let mut moved = false;
            while let Some(wire) = engine.poll_output() {
                server.input(wire, now).unwrap();
                moved = true;
            }
            while let Some(wire) = server.poll_output() {
                engine.input(wire, now).unwrap();
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn connected_pair() -> (ProtocolEngine, FakeServer, Arc<StatsBank>, Instant) {
        let (mut engine, stats, now) = test_engine(EngineConfig::default());
        let mut server = FakeServer::new();
        engine.start(now).unwrap();
        pump(&mut engine, &mut server, now);
        assert!(engine.is_active());
        (engine, server, stats, now)
    }

    #[test]
    fn test_handshake_completes() {
        let (mut engine, _server, _stats, _now) = connected_pair();
        let mut saw_complete = false;
        while let Some(signal) = engine.poll_signal() {
            if matches!(signal, EngineSignal::HandshakeComplete) {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[test]
    fn test_no_data_before_keys() {
        let (mut engine, stats, now) = test_engine(EngineConfig::default());
        engine.start(now).unwrap();
        // Drain the reset; no key generation exists yet.
        while engine.poll_output().is_some() {}

        engine.tun_input(b"ip packet", now).unwrap();
        assert!(engine.poll_output().is_none());
        assert!(stats.error_count(ErrorCode::KevPendingError) >= 1);
    }

    #[test]
    fn test_data_round_trip() {
        let (mut engine, mut server, _stats, now) = connected_pair();

        engine.tun_input(b"tun payload", now).unwrap();
        let wire = engine.poll_output().unwrap();
        let received = server.decrypt_data(wire).unwrap();
        assert_eq!(received, b"tun payload");

        let back = server.encrypt_data(b"server payload", now);
        engine.input(back, now).unwrap();
        let mut delivered = None;
        while let Some(signal) = engine.poll_signal() {
            if let EngineSignal::TunPacket(p) = signal {
                delivered = Some(p);
            }
        }
        assert_eq!(delivered.unwrap(), b"server payload");
    }

    #[test]
    fn test_replayed_data_is_dropped() {
        let (mut engine, mut server, stats, now) = connected_pair();

        let wire = server.encrypt_data(b"payload", now);
        engine.input(wire.clone(), now).unwrap();
        engine.input(wire, now).unwrap();

        let delivered = std::iter::from_fn(|| engine.poll_signal())
            .filter(|s| matches!(s, EngineSignal::TunPacket(_)))
            .count();
        assert_eq!(delivered, 1);
        assert!(stats.error_count(ErrorCode::ReplayError) >= 1);
        assert!(stats.error_count(ErrorCode::PktidReplay) >= 1);
    }

    #[test]
    fn test_unknown_key_id_counted_not_fatal() {
        let (mut engine, mut server, stats, now) = connected_pair();

        let mut wire = server.encrypt_data(b"payload", now).to_vec();
        // Rewrite the key id bits to an unused id.
        wire[0] = (wire[0] & !0x07) | 0x05;
        engine.input(Bytes::from(wire), now).unwrap();

        assert!(stats.error_count(ErrorCode::KeyStateError) >= 1);
        assert!(engine.is_active());
    }

    #[test]
    fn test_control_message_dispatch() {
        let (mut engine, mut server, _stats, now) = connected_pair();

        server.send_cc_message("INFO,server says hi", now);
        pump(&mut engine, &mut server, now);

        let mut info = None;
        while let Some(signal) = engine.poll_signal() {
            if let EngineSignal::Control(ControlMessage::Info(text)) = signal {
                info = Some(text);
            }
        }
        assert_eq!(info.as_deref(), Some("server says hi"));
    }

    #[test]
    fn test_push_request_reply() {
        let (mut engine, mut server, _stats, now) = connected_pair();
        server.push_options = "ifconfig 10.8.0.2 255.255.255.0,ping 8,ping-restart 60".into();

        engine
            .send_control(&ControlMessage::PushRequest, now)
            .unwrap();
        pump(&mut engine, &mut server, now);

        let mut reply = None;
        while let Some(signal) = engine.poll_signal() {
            if let EngineSignal::Control(ControlMessage::PushReply(opts)) = signal {
                reply = Some(opts);
            }
        }
        assert!(reply.unwrap().contains("ifconfig 10.8.0.2"));
        assert!(server.messages.iter().any(|m| m == "PUSH_REQUEST"));
    }

    #[test]
    fn test_rekey_promotes_generation() {
        let (mut engine, mut server, stats, now) = connected_pair();

        engine.start_rekey(now).unwrap();
        pump(&mut engine, &mut server, now);

        let mut rekeyed = None;
        while let Some(signal) = engine.poll_signal() {
            if let EngineSignal::Rekeyed { key_id } = signal {
                rekeyed = Some(key_id);
            }
        }
        assert_eq!(rekeyed, Some(1));
        assert!(stats.error_count(ErrorCode::NKeyLimitReneg) >= 1);

        // Data still flows on the new generation.
        engine.tun_input(b"after rekey", now).unwrap();
        let wire = engine.poll_output().unwrap();
        assert_eq!(server.decrypt_data(wire).unwrap(), b"after rekey");
    }

    #[test]
    fn test_rekey_on_time_limit() {
        let config = EngineConfig {
            renegotiation: RekeyLimits {
                reneg_secs: 5,
                reneg_bytes: None,
                reneg_pkts: None,
            },
            ..EngineConfig::default()
        };
        let (mut engine, _stats, now) = test_engine(config);
        let mut server = FakeServer::new();
        engine.start(now).unwrap();
        pump(&mut engine, &mut server, now);
        assert!(engine.is_active());

        let later = now + Duration::from_secs(6);
        engine.handle_time(later).unwrap();
        pump(&mut engine, &mut server, later);

        let rekeyed = std::iter::from_fn(|| engine.poll_signal())
            .any(|s| matches!(s, EngineSignal::Rekeyed { .. }));
        assert!(rekeyed);
    }

    #[test]
    fn test_keepalive_ping_and_timeout() {
        let (mut engine, mut server, _stats, now) = connected_pair();
        while engine.poll_output().is_some() {}

        // Quiet for longer than the ping interval: a ping goes out.
        let later = now + Duration::from_secs(9);
        engine.handle_time(later).unwrap();
        let wire = engine.poll_output().expect("ping packet");
        assert_eq!(server.decrypt_data(wire), None); // ping is consumed internally

        // Nothing received for the restart window: keepalive timeout.
        let much_later = later + Duration::from_secs(61);
        let err = engine.handle_time(much_later).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeepaliveTimeout);
    }

    #[test]
    fn test_handshake_timeout() {
        let (mut engine, _stats, now) = test_engine(EngineConfig::default());
        engine.start(now).unwrap();

        let later = now + Duration::from_secs(61);
        let err = engine.handle_time(later).unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandshakeTimeout);
    }

    #[test]
    fn test_retransmission() {
        let (mut engine, _stats, now) = test_engine(EngineConfig::default());
        engine.start(now).unwrap();
        let first = engine.poll_output().unwrap();

        // No ack arrives; the reset is retransmitted after the base interval.
        engine.handle_time(now + Duration::from_secs(3)).unwrap();
        let retrans = engine.poll_output().expect("retransmitted reset");
        assert_eq!(first, retrans);
    }

    #[test]
    fn test_session_id_change_is_fatal() {
        let (mut engine, mut server, _stats, now) = connected_pair();

        server.corrupt_session_id();
        server.send_cc_message("INFO,x", now);
        let wire = server.poll_output().unwrap();
        assert!(engine.input(wire, now).is_err());
    }

    #[test]
    fn test_compression_stub_round_trip() {
        let config = EngineConfig {
            compression: Compression::Stub,
            ..EngineConfig::default()
        };
        let (mut engine, _stats, now) = test_engine(config);
        let mut server = FakeServer::new().with_compression();
        engine.start(now).unwrap();
        pump(&mut engine, &mut server, now);
        assert!(engine.is_active());

        engine.tun_input(b"compressed path", now).unwrap();
        let wire = engine.poll_output().unwrap();
        assert_eq!(server.decrypt_data(wire).unwrap(), b"compressed path");
    }

    #[test]
    fn test_compression_swap_opcode() {
        assert_eq!(
            Compression::Stub.decode(&[COMP_SWAP, b'c', b'b', b'a']).unwrap(),
            b"abc".to_vec()
        );
        assert_eq!(
            Compression::Stub.decode(&[COMP_STUB, b'x', b'y']).unwrap(),
            b"xy".to_vec()
        );
        assert_eq!(
            Compression::Stub.decode(&[0x00, b'x']),
            Err(ErrorCode::CompressError)
        );
    }

    #[test]
    fn test_next_wake_tracks_timers() {
        let (mut engine, _stats, now) = test_engine(EngineConfig::default());
        assert!(engine.next_wake().is_none());
        engine.start(now).unwrap();
        // A handshake is pending: both the retransmit timer and the
        // handshake deadline are set.
        let wake = engine.next_wake().unwrap();
        assert!(wake <= now + Duration::from_secs(2));
    }

    #[test]
    fn test_stop_quiesces() {
        let (mut engine, mut server, _stats, now) = connected_pair();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Exiting);

        let wire = server.encrypt_data(b"late", now);
        engine.input(wire, now).unwrap();
        assert!(engine.poll_signal().is_none());
        engine.handle_time(now + Duration::from_secs(600)).unwrap();
    }
}
