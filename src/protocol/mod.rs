//! Wire protocol: opcodes and packet framing.
//!
//! Every packet starts with one header byte: the opcode in the high 5 bits
//! and the key id in the low 3 bits. Control-channel packets carry the
//! sender's 64-bit session id, an optional ACK block, and a 32-bit packet
//! id ahead of the TLS ciphertext payload:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ op<<3|key_id (1) │ session id (8) │ ack count (1)            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ack ids (4 × n)  │ remote session id (8, when n > 0)         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ packet id (4)    │ payload (TLS ciphertext)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Data packets are lean: header byte, packet id (plus a 24-bit peer id in
//! the V2 framing), then the authenticated ciphertext.

pub mod control;
pub mod engine;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Largest packet accepted from or offered to a transport.
pub const MAX_PACKET: usize = 4096;

/// Packet opcodes (high 5 bits of the header byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ControlHardResetClientV1 = 1,
    ControlHardResetServerV1 = 2,
    ControlSoftResetV1 = 3,
    ControlV1 = 4,
    AckV1 = 5,
    DataV1 = 6,
    ControlHardResetClientV2 = 7,
    ControlHardResetServerV2 = 8,
    DataV2 = 9,
    ControlHardResetClientV3 = 10,
}

impl Opcode {
    /// Whether packets with this opcode ride the control channel.
    pub fn is_control(self) -> bool {
        !matches!(self, Opcode::DataV1 | Opcode::DataV2)
    }

    /// Whether this opcode initiates a fresh key negotiation.
    pub fn is_hard_reset(self) -> bool {
        matches!(
            self,
            Opcode::ControlHardResetClientV1
                | Opcode::ControlHardResetClientV2
                | Opcode::ControlHardResetClientV3
                | Opcode::ControlHardResetServerV1
                | Opcode::ControlHardResetServerV2
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::ControlHardResetClientV1),
            2 => Ok(Opcode::ControlHardResetServerV1),
            3 => Ok(Opcode::ControlSoftResetV1),
            4 => Ok(Opcode::ControlV1),
            5 => Ok(Opcode::AckV1),
            6 => Ok(Opcode::DataV1),
            7 => Ok(Opcode::ControlHardResetClientV2),
            8 => Ok(Opcode::ControlHardResetServerV2),
            9 => Ok(Opcode::DataV2),
            10 => Ok(Opcode::ControlHardResetClientV3),
            other => Err(Error::proto(format!("unknown opcode {other}"))),
        }
    }
}

/// A 64-bit session identifier, chosen randomly per side per connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 8]);

impl SessionId {
    /// A fresh random id.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A control-channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub opcode: Opcode,
    pub key_id: u8,
    pub session_id: SessionId,
    pub acks: Vec<u32>,
    /// The peer's session id; present whenever ACK ids are attached.
    pub remote_session_id: Option<SessionId>,
    pub packet_id: u32,
    pub payload: Bytes,
}

/// A standalone acknowledgment packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub key_id: u8,
    pub session_id: SessionId,
    pub acks: Vec<u32>,
    pub remote_session_id: SessionId,
}

/// A data-channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub opcode: Opcode,
    pub key_id: u8,
    /// 24-bit peer id, V2 framing only.
    pub peer_id: Option<u32>,
    pub packet_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    /// The header bytes authenticated as AAD by the data-channel cipher.
    pub fn aad(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.push((self.opcode as u8) << 3 | (self.key_id & 0x07));
        if let Some(peer_id) = self.peer_id {
            buf.extend_from_slice(&peer_id.to_be_bytes()[1..4]);
        }
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        buf
    }
}

/// Any parsed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control(ControlPacket),
    Ack(AckPacket),
    Data(DataPacket),
}

impl Packet {
    /// Opcode of this packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Control(p) => p.opcode,
            Packet::Ack(_) => Opcode::AckV1,
            Packet::Data(p) => p.opcode,
        }
    }

    /// Key id of this packet.
    pub fn key_id(&self) -> u8 {
        match self {
            Packet::Control(p) => p.key_id,
            Packet::Ack(p) => p.key_id,
            Packet::Data(p) => p.key_id,
        }
    }

    /// Serialize to wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Packet::Control(p) => {
                buf.put_u8((p.opcode as u8) << 3 | (p.key_id & 0x07));
                buf.put_slice(p.session_id.as_bytes());
                buf.put_u8(p.acks.len() as u8);
                for ack in &p.acks {
                    buf.put_u32(*ack);
                }
                if !p.acks.is_empty() {
                    let remote = p
                        .remote_session_id
                        .expect("acks require a remote session id");
                    buf.put_slice(remote.as_bytes());
                }
                buf.put_u32(p.packet_id);
                buf.put_slice(&p.payload);
            }
            Packet::Ack(p) => {
                buf.put_u8((Opcode::AckV1 as u8) << 3 | (p.key_id & 0x07));
                buf.put_slice(p.session_id.as_bytes());
                buf.put_u8(p.acks.len() as u8);
                for ack in &p.acks {
                    buf.put_u32(*ack);
                }
                buf.put_slice(p.remote_session_id.as_bytes());
            }
            Packet::Data(p) => {
                buf.put_u8((p.opcode as u8) << 3 | (p.key_id & 0x07));
                if let Some(peer_id) = p.peer_id {
                    buf.put_slice(&peer_id.to_be_bytes()[1..4]);
                }
                buf.put_u32(p.packet_id);
                buf.put_slice(&p.payload);
            }
        }
        buf.freeze()
    }

    /// Parse from wire form.
    pub fn decode(mut data: Bytes) -> Result<Packet> {
        if data.is_empty() {
            return Err(Error::proto("empty packet"));
        }
        if data.len() > MAX_PACKET {
            return Err(Error::proto(format!("packet too large: {}", data.len())));
        }
        let header = data.get_u8();
        let opcode = Opcode::try_from(header >> 3)?;
        let key_id = header & 0x07;

        match opcode {
            Opcode::DataV1 => {
                if data.len() < 4 {
                    return Err(Error::proto("truncated data packet"));
                }
                Ok(Packet::Data(DataPacket {
                    opcode,
                    key_id,
                    peer_id: None,
                    packet_id: data.get_u32(),
                    payload: data,
                }))
            }
            Opcode::DataV2 => {
                if data.len() < 7 {
                    return Err(Error::proto("truncated data packet"));
                }
                let mut peer = [0u8; 4];
                peer[1] = data.get_u8();
                peer[2] = data.get_u8();
                peer[3] = data.get_u8();
                Ok(Packet::Data(DataPacket {
                    opcode,
                    key_id,
                    peer_id: Some(u32::from_be_bytes(peer)),
                    packet_id: data.get_u32(),
                    payload: data,
                }))
            }
            Opcode::AckV1 => {
                if data.len() < 9 {
                    return Err(Error::proto("truncated ack packet"));
                }
                let session_id = read_session_id(&mut data);
                let count = data.get_u8() as usize;
                if data.len() < count * 4 + 8 {
                    return Err(Error::proto("truncated ack block"));
                }
                let mut acks = Vec::with_capacity(count);
                for _ in 0..count {
                    acks.push(data.get_u32());
                }
                let remote_session_id = read_session_id(&mut data);
                Ok(Packet::Ack(AckPacket {
                    key_id,
                    session_id,
                    acks,
                    remote_session_id,
                }))
            }
            _ => {
                if data.len() < 9 {
                    return Err(Error::proto("truncated control packet"));
                }
                let session_id = read_session_id(&mut data);
                let count = data.get_u8() as usize;
                let mut needed = count * 4 + 4;
                if count > 0 {
                    needed += 8;
                }
                if data.len() < needed {
                    return Err(Error::proto("truncated control packet"));
                }
                let mut acks = Vec::with_capacity(count);
                for _ in 0..count {
                    acks.push(data.get_u32());
                }
                let remote_session_id = if count > 0 {
                    Some(read_session_id(&mut data))
                } else {
                    None
                };
                let packet_id = data.get_u32();
                Ok(Packet::Control(ControlPacket {
                    opcode,
                    key_id,
                    session_id,
                    acks,
                    remote_session_id,
                    packet_id,
                    payload: data,
                }))
            }
        }
    }
}

fn read_session_id(data: &mut Bytes) -> SessionId {
    let mut id = [0u8; 8];
    data.copy_to_slice(&mut id);
    SessionId(id)
}
