//! In-process fake server for engine and session tests.
//!
//! Speaks the real wire protocol (resets, reliability, TLS records over
//! CONTROL_V1, key exchange, pushes) against the client engine, without any
//! sockets. Tests drive it by shuttling encoded packets back and forth.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::crypto::{
    AuthMode, DataContext, Direction, DirectionKeys, KeyExpansion, KeySource,
};
use crate::error::Result;
use crate::protocol::control::{split_messages, ControlMessage, KeyExchangeMessage};
use crate::protocol::engine::{Compression, PING_MAGIC};
use crate::protocol::{AckPacket, ControlPacket, DataPacket, Opcode, Packet, SessionId};
use crate::reliability::{AckQueue, PacketIdSend, RecvReliable, ReplayWindow, SendReliable};
use crate::tls::{MemoryTls, TlsRole, TlsSession, TlsVersion};

/// How the fake server treats client credentials.
#[derive(Debug, Clone)]
pub enum AuthBehavior {
    /// Accept anything.
    Accept,
    /// Reject with `AUTH_FAILED,<reason>` after the key exchange.
    Fail(String),
}

struct ServerCtl {
    key_id: u8,
    tls: MemoryTls,
    send: SendReliable,
    recv: RecvReliable,
    acks: AckQueue,
    ids: PacketIdSend,
    keys_done: bool,
}

impl ServerCtl {
    fn new(key_id: u8) -> Self {
        Self {
            key_id,
            tls: MemoryTls::new(TlsRole::Server, TlsVersion::V1_3, None),
            send: SendReliable::new(),
            recv: RecvReliable::new(),
            acks: AckQueue::new(),
            ids: PacketIdSend::new(),
            keys_done: false,
        }
    }
}

struct ServerKeys {
    tx: DataContext,
    rx: DataContext,
    tx_ids: PacketIdSend,
    rx_replay: ReplayWindow,
}

pub struct FakeServer {
    session_id: SessionId,
    client_session_id: Option<SessionId>,
    ctl: ServerCtl,
    keys: Option<ServerKeys>,
    key_source: KeySource,
    out: VecDeque<Bytes>,
    compression: Compression,

    /// Options returned on `PUSH_REQUEST`.
    pub push_options: String,
    /// Credential policy.
    pub auth: AuthBehavior,
    /// Username seen in the key exchange.
    pub seen_username: Option<String>,
    /// Password seen in the key exchange.
    pub seen_password: Option<String>,
    /// Control messages received after the handshake.
    pub messages: Vec<String>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            session_id: SessionId::random(),
            client_session_id: None,
            ctl: ServerCtl::new(0),
            keys: None,
            key_source: KeySource::new_server(),
            out: VecDeque::new(),
            compression: Compression::Disabled,
            push_options:
                "ifconfig 10.8.0.2 255.255.255.0,route-gateway 10.8.0.1,ping 8,ping-restart 60"
                    .into(),
            auth: AuthBehavior::Accept,
            seen_username: None,
            seen_password: None,
            messages: Vec::new(),
        }
    }

    pub fn with_compression(mut self) -> Self {
        self.compression = Compression::Stub;
        self
    }

    /// Flip the session id mid-connection to provoke the fatal check.
    pub fn corrupt_session_id(&mut self) {
        self.session_id = SessionId::random();
    }

    pub fn poll_output(&mut self) -> Option<Bytes> {
        self.out.pop_front()
    }

    pub fn input(&mut self, wire: Bytes, now: Instant) -> Result<()> {
        let packet = Packet::decode(wire)?;
        match packet {
            Packet::Ack(p) => {
                self.ctl.send.on_ack(&p.acks);
                Ok(())
            }
            Packet::Control(p) => self.input_control(p, now),
            Packet::Data(_) => Ok(()),
        }
    }

    fn input_control(&mut self, p: ControlPacket, now: Instant) -> Result<()> {
        if self.client_session_id.is_none() {
            self.client_session_id = Some(p.session_id);
        }
        if !p.acks.is_empty() {
            self.ctl.send.on_ack(&p.acks);
        }

        match p.opcode {
            Opcode::ControlHardResetClientV2 | Opcode::ControlHardResetClientV3 => {
                // A reset from an unknown session id starts a new
                // connection; drop any previous state.
                if self.client_session_id != Some(p.session_id) {
                    self.ctl = ServerCtl::new(0);
                    self.keys = None;
                    self.key_source = KeySource::new_server();
                    self.client_session_id = Some(p.session_id);
                }
                if self.ctl.recv.receive(p.packet_id, p.payload).is_ok() {
                    self.ctl.acks.push(p.packet_id);
                    self.send_reliable(Opcode::ControlHardResetServerV2, Bytes::new(), now)?;
                } else {
                    self.ctl.acks.push(p.packet_id);
                }
            }
            Opcode::ControlSoftResetV1 => {
                // Client renegotiation: fresh control context on the new id.
                let mut ctl = ServerCtl::new(p.key_id);
                let _ = ctl.recv.receive(p.packet_id, p.payload);
                ctl.acks.push(p.packet_id);
                self.ctl = ctl;
                self.key_source = KeySource::new_server();
                self.send_reliable(Opcode::ControlSoftResetV1, Bytes::new(), now)?;
            }
            Opcode::ControlV1 => {
                match self.ctl.recv.receive(p.packet_id, p.payload) {
                    Ok(records) => {
                        self.ctl.acks.push(p.packet_id);
                        for record in records {
                            self.ctl.tls.push_ciphertext(&record)?;
                        }
                    }
                    Err(_) => {
                        self.ctl.acks.push(p.packet_id);
                    }
                }
            }
            _ => {}
        }

        self.pump_tls(now)?;
        self.flush_acks(now);
        Ok(())
    }

    fn pump_tls(&mut self, now: Instant) -> Result<()> {
        loop {
            let mut progressed = false;

            while let Some(record) = self.ctl.tls.pull_ciphertext() {
                self.send_reliable(Opcode::ControlV1, record, now)?;
                progressed = true;
            }

            while let Some(plain) = self.ctl.tls.read_plaintext()? {
                progressed = true;
                if !self.ctl.keys_done {
                    let (client_source, _opts, username, password, _pi) =
                        KeyExchangeMessage::decode_client(&plain)?;
                    self.seen_username = Some(username);
                    self.seen_password = Some(password);

                    let reply =
                        KeyExchangeMessage::encode_server(&self.key_source, "");
                    self.ctl.tls.write_plaintext(&reply)?;

                    let client_sid = self.client_session_id.expect("client sid known");
                    let expansion = KeyExpansion::generate(
                        &client_source,
                        &self.key_source,
                        client_sid.as_bytes(),
                        self.session_id.as_bytes(),
                    );
                    self.keys = Some(ServerKeys {
                        tx: DataContext::new(
                            &DirectionKeys::from_expansion(&expansion, Direction::Encrypt, true),
                            AuthMode::Aead,
                        ),
                        rx: DataContext::new(
                            &DirectionKeys::from_expansion(&expansion, Direction::Decrypt, true),
                            AuthMode::Aead,
                        ),
                        tx_ids: PacketIdSend::new(),
                        rx_replay: ReplayWindow::new(),
                    });
                    self.ctl.keys_done = true;

                    if let AuthBehavior::Fail(reason) = self.auth.clone() {
                        self.queue_cc(&format!("AUTH_FAILED,{reason}"));
                    }
                } else {
                    for line in split_messages(&plain) {
                        if line == "PUSH_REQUEST" {
                            let reply = ControlMessage::PushReply(self.push_options.clone());
                            self.queue_cc(&reply.render());
                        }
                        self.messages.push(line);
                    }
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn queue_cc(&mut self, text: &str) {
        let mut msg = text.as_bytes().to_vec();
        msg.push(0);
        self.ctl.tls.write_plaintext(&msg).expect("established");
    }

    /// Send a control-channel message to the client.
    pub fn send_cc_message(&mut self, text: &str, now: Instant) {
        self.queue_cc(text);
        self.pump_tls(now).expect("pump");
        self.flush_acks(now);
    }

    fn send_reliable(&mut self, opcode: Opcode, payload: Bytes, now: Instant) -> Result<()> {
        let packet_id = self.ctl.ids.next_id()?;
        let acks = self.ctl.acks.take_batch();
        let remote_session_id = if acks.is_empty() {
            None
        } else {
            self.client_session_id
        };
        let wire = Packet::Control(ControlPacket {
            opcode,
            key_id: self.ctl.key_id,
            session_id: self.session_id,
            acks,
            remote_session_id,
            packet_id,
            payload,
        })
        .encode();
        self.ctl.send.schedule(packet_id, wire.clone(), now)?;
        self.out.push_back(wire);
        Ok(())
    }

    fn flush_acks(&mut self, _now: Instant) {
        while !self.ctl.acks.is_empty() {
            let acks = self.ctl.acks.take_batch();
            let Some(client_sid) = self.client_session_id else {
                return;
            };
            let wire = Packet::Ack(AckPacket {
                key_id: self.ctl.key_id,
                session_id: self.session_id,
                acks,
                remote_session_id: client_sid,
            })
            .encode();
            self.out.push_back(wire);
        }
    }

    /// Encrypt a payload as a server-to-client data packet.
    pub fn encrypt_data(&mut self, payload: &[u8], _now: Instant) -> Bytes {
        let framed = self.compression.encode(payload);
        let keys = self.keys.as_mut().expect("data keys installed");
        let packet_id = keys.tx_ids.next_id().expect("id space");
        let mut packet = DataPacket {
            opcode: Opcode::DataV1,
            key_id: self.ctl.key_id,
            peer_id: None,
            packet_id,
            payload: Bytes::new(),
        };
        let sealed = keys
            .tx
            .seal(packet_id as u64, &packet.aad(), &framed)
            .expect("seal");
        packet.payload = Bytes::from(sealed);
        Packet::Data(packet).encode()
    }

    /// Decrypt a client-to-server data packet. Returns `None` for pings,
    /// non-data packets, and authentication failures.
    pub fn decrypt_data(&mut self, wire: Bytes) -> Option<Vec<u8>> {
        let Ok(Packet::Data(packet)) = Packet::decode(wire) else {
            return None;
        };
        let keys = self.keys.as_mut()?;
        keys.rx_replay.test_add(packet.packet_id as u64).ok()?;
        let plain = keys
            .rx
            .open(packet.packet_id as u64, &packet.aad(), &packet.payload)
            .ok()?;
        if plain.as_slice() == PING_MAGIC {
            return None;
        }
        self.compression.decode(&plain).ok()
    }
}
