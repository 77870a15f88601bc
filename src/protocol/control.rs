//! Post-handshake control messages.
//!
//! A line-oriented small-message protocol rides the established TLS
//! channel: pushes, auth results, server directives, and the app-custom
//! control channel. Messages are NUL- or newline-terminated; unknown
//! messages are ignored by the dispatcher.
//!
//! The key-exchange message that seeds the data channel also lives here: a
//! length-prefixed bundle of key source, options string, credentials, and
//! peer-info lines.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::KeySource;
use crate::error::{Error, Result};
use crate::options::utf8_printable;

/// One parsed control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client asks for the configuration push.
    PushRequest,
    /// Server's configuration push; payload is the comma-separated options.
    PushReply(String),
    /// Authentication rejected; optional reason.
    AuthFailed(String),
    /// Authentication deferred; optional extended timeout in seconds.
    AuthPending { timeout: Option<u64> },
    /// Server orders the client to stop.
    Halt(String),
    /// Server orders a reconnect.
    Restart(String),
    /// Informational text for the host.
    Info(String),
    /// Pre-auth informational text (SSO method hints).
    InfoPre(String),
    /// Text echoed to the host when enabled.
    Echo(String),
    /// Challenge response (client to server), base64.
    CrResponse(String),
    /// Relay through this server to the next hop.
    Relay,
    /// App-custom control channel message.
    AppControl { protocol: String, payload: String },
}

impl ControlMessage {
    /// Parse one message line. Unknown messages return `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\0', '\n', '\r']);
        if line.is_empty() {
            return None;
        }

        if line == "PUSH_REQUEST" {
            return Some(ControlMessage::PushRequest);
        }
        if let Some(rest) = line.strip_prefix("PUSH_REPLY,") {
            return Some(ControlMessage::PushReply(rest.to_string()));
        }
        if line == "AUTH_FAILED" {
            return Some(ControlMessage::AuthFailed(String::new()));
        }
        if let Some(rest) = line.strip_prefix("AUTH_FAILED,") {
            return Some(ControlMessage::AuthFailed(utf8_printable(rest, 256)));
        }
        if line == "AUTH_PENDING" {
            return Some(ControlMessage::AuthPending { timeout: None });
        }
        if let Some(rest) = line.strip_prefix("AUTH_PENDING,") {
            let timeout = rest
                .split(',')
                .find_map(|kv| kv.strip_prefix("timeout="))
                .and_then(|v| v.parse().ok());
            return Some(ControlMessage::AuthPending { timeout });
        }
        if line == "HALT" {
            return Some(ControlMessage::Halt(String::new()));
        }
        if let Some(rest) = line.strip_prefix("HALT,") {
            return Some(ControlMessage::Halt(utf8_printable(rest, 256)));
        }
        if line == "RESTART" {
            return Some(ControlMessage::Restart(String::new()));
        }
        if let Some(rest) = line.strip_prefix("RESTART,") {
            return Some(ControlMessage::Restart(utf8_printable(rest, 256)));
        }
        if let Some(rest) = line.strip_prefix("INFO_PRE,") {
            return Some(ControlMessage::InfoPre(utf8_printable(rest, 256)));
        }
        if let Some(rest) = line.strip_prefix("INFO,") {
            return Some(ControlMessage::Info(utf8_printable(rest, 256)));
        }
        if let Some(rest) = line.strip_prefix("ECHO,") {
            return Some(ControlMessage::Echo(utf8_printable(rest, 256)));
        }
        if let Some(rest) = line.strip_prefix("CR_RESPONSE,") {
            return Some(ControlMessage::CrResponse(rest.to_string()));
        }
        if line == "RELAY" {
            return Some(ControlMessage::Relay);
        }
        if let Some(rest) = line.strip_prefix("ACC,") {
            let (protocol, payload) = rest.split_once(',')?;
            return Some(ControlMessage::AppControl {
                protocol: protocol.to_string(),
                payload: payload.to_string(),
            });
        }
        None
    }

    /// Render to wire form (without terminator).
    pub fn render(&self) -> String {
        match self {
            ControlMessage::PushRequest => "PUSH_REQUEST".into(),
            ControlMessage::PushReply(opts) => format!("PUSH_REPLY,{opts}"),
            ControlMessage::AuthFailed(reason) if reason.is_empty() => "AUTH_FAILED".into(),
            ControlMessage::AuthFailed(reason) => format!("AUTH_FAILED,{reason}"),
            ControlMessage::AuthPending { timeout: None } => "AUTH_PENDING".into(),
            ControlMessage::AuthPending { timeout: Some(t) } => {
                format!("AUTH_PENDING,timeout={t}")
            }
            ControlMessage::Halt(reason) if reason.is_empty() => "HALT".into(),
            ControlMessage::Halt(reason) => format!("HALT,{reason}"),
            ControlMessage::Restart(reason) if reason.is_empty() => "RESTART".into(),
            ControlMessage::Restart(reason) => format!("RESTART,{reason}"),
            ControlMessage::Info(text) => format!("INFO,{text}"),
            ControlMessage::InfoPre(text) => format!("INFO_PRE,{text}"),
            ControlMessage::Echo(text) => format!("ECHO,{text}"),
            ControlMessage::CrResponse(b64) => format!("CR_RESPONSE,{b64}"),
            ControlMessage::Relay => "RELAY".into(),
            ControlMessage::AppControl { protocol, payload } => {
                format!("ACC,{protocol},{payload}")
            }
        }
    }
}

/// Split a TLS plaintext record into message lines (NUL or newline
/// separated).
pub fn split_messages(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .split(['\0', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The key-exchange bundle sent through the established TLS channel.
///
/// Client to server: key source (with pre-master), options string,
/// credentials, peer-info lines. Server to client: key source (randoms
/// only) and options string.
#[derive(Debug, Clone)]
pub struct KeyExchangeMessage {
    pub key_source: KeySource,
    pub options_string: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub peer_info: Vec<(String, String)>,
}

fn put_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn get_field(data: &mut Bytes) -> Result<Bytes> {
    if data.len() < 2 {
        return Err(Error::proto("truncated key exchange field"));
    }
    let len = data.get_u16() as usize;
    if data.len() < len {
        return Err(Error::proto("truncated key exchange field body"));
    }
    Ok(data.split_to(len))
}

impl KeyExchangeMessage {
    /// Encode the client-side message (pre-master included).
    pub fn encode_client(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        put_field(&mut buf, &self.key_source.encode(true));
        put_field(&mut buf, self.options_string.as_bytes());
        put_field(&mut buf, self.username.as_deref().unwrap_or("").as_bytes());
        put_field(&mut buf, self.password.as_deref().unwrap_or("").as_bytes());

        let peer_info: String = self
            .peer_info
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        put_field(&mut buf, peer_info.as_bytes());
        buf.to_vec()
    }

    /// Decode the server-side reply: key source (randoms only) and options
    /// string.
    pub fn decode_server(data: &[u8]) -> Result<(KeySource, String)> {
        let mut data = Bytes::copy_from_slice(data);
        let ks = get_field(&mut data)?;
        let key_source = KeySource::decode(&ks, false)?;
        let opts = get_field(&mut data)?;
        let options_string = String::from_utf8(opts.to_vec())
            .map_err(|_| Error::proto("options string is not UTF-8"))?;
        Ok((key_source, options_string))
    }

    /// Decode a client-side message (used by test harnesses standing in for
    /// the server).
    pub fn decode_client(
        data: &[u8],
    ) -> Result<(KeySource, String, String, String, Vec<(String, String)>)> {
        let mut data = Bytes::copy_from_slice(data);
        let ks = get_field(&mut data)?;
        let key_source = KeySource::decode(&ks, true)?;
        let options_string = String::from_utf8(get_field(&mut data)?.to_vec())
            .map_err(|_| Error::proto("options string is not UTF-8"))?;
        let username = String::from_utf8(get_field(&mut data)?.to_vec())
            .map_err(|_| Error::proto("username is not UTF-8"))?;
        let password = String::from_utf8(get_field(&mut data)?.to_vec())
            .map_err(|_| Error::proto("password is not UTF-8"))?;
        let peer_info_raw = String::from_utf8(get_field(&mut data)?.to_vec())
            .map_err(|_| Error::proto("peer info is not UTF-8"))?;
        let peer_info = peer_info_raw
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok((key_source, options_string, username, password, peer_info))
    }

    /// Encode a server-side reply (used by test harnesses).
    pub fn encode_server(key_source: &KeySource, options_string: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        put_field(&mut buf, &key_source.encode(false));
        put_field(&mut buf, options_string.as_bytes());
        buf.to_vec()
    }
}
