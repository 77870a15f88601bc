//! TLS wrapper.
//!
//! The control channel tunnels a TLS session whose I/O never touches the
//! network: outgoing ciphertext is drained by the protocol engine and framed
//! as control payload, incoming control payload is pushed into the session's
//! inbound buffer. The concrete TLS library is a collaborator behind
//! [`TlsSession`]; this module owns the seam, the certificate policy checks
//! parsed from the profile, and [`MemoryTls`], the deterministic in-process
//! session used by the test harness and reference embedders.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorCode, Result};
use crate::options::{utf8_printable, OptionList};

/// TLS protocol versions, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

impl TlsVersion {
    /// Parse a profile token (`1.2`, `tls_1_2`, ...).
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "1.0" | "tls_1_0" => Ok(TlsVersion::V1_0),
            "1.1" | "tls_1_1" => Ok(TlsVersion::V1_1),
            "1.2" | "tls_1_2" => Ok(TlsVersion::V1_2),
            "1.3" | "tls_1_3" => Ok(TlsVersion::V1_3),
            other => Err(Error::tls(format!(
                "bad TLS version: {}",
                utf8_printable(other, 16)
            ))),
        }
    }
}

/// Certificate strength profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertProfile {
    /// Allow 1024-bit RSA and SHA1 signatures.
    Legacy,
    /// Require 2048-bit RSA and SHA256 or better.
    #[default]
    Preferred,
    /// Require Suite B algorithms.
    SuiteB,
}

impl CertProfile {
    /// Parse a profile token.
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "legacy" => Ok(CertProfile::Legacy),
            "preferred" => Ok(CertProfile::Preferred),
            "suiteb" => Ok(CertProfile::SuiteB),
            other => Err(Error::tls(format!(
                "bad tls-cert-profile: {}",
                utf8_printable(other, 32)
            ))),
        }
    }
}

/// Expected peer certificate role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsCertType {
    Server,
    Client,
}

/// How to match the peer certificate's X.509 name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X509NameCheck {
    /// Full subject DN, exact.
    SubjectExact(String),
    /// Common-name RDN, exact.
    RdnExact(String),
    /// Common-name RDN, prefix.
    RdnPrefix(String),
}

/// The peer certificate view the TLS collaborator hands back for policy
/// checks.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate {
    /// Rendered subject DN, e.g. `C=US, O=Example, CN=vpn.example.com`.
    pub subject: String,
    /// Subject common name.
    pub common_name: String,
    /// Netscape certificate type, when present.
    pub ns_cert_type: Option<NsCertType>,
    /// Key usage bits, when present.
    pub key_usage: Vec<u16>,
    /// Extended key usage OIDs or names, when present.
    pub ext_key_usage: Vec<String>,
    /// Raw DER encoding.
    pub der: Vec<u8>,
}

impl PeerCertificate {
    /// SHA-256 fingerprint of the DER encoding.
    pub fn fingerprint(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.der);
        hasher.finalize().into()
    }
}

/// TLS policy parsed from the profile.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle in PEM form; may be empty when fingerprint pinning is used.
    pub ca_pem: String,
    /// Optional CRL in PEM form.
    pub crl_pem: Option<String>,
    /// Client certificate, unless external PKI is in use.
    pub client_cert_pem: Option<String>,
    /// Client private key; absent means external PKI.
    pub client_key_pem: Option<String>,
    /// The private key lives outside the process.
    pub external_pki: bool,
    /// Minimum negotiated TLS version.
    pub min_version: Option<TlsVersion>,
    /// Certificate strength requirements.
    pub cert_profile: CertProfile,
    /// Required Netscape certificate type.
    pub ns_cert_type: Option<NsCertType>,
    /// Required key-usage values (any match accepts).
    pub remote_cert_ku: Vec<u16>,
    /// Required extended-key-usage OID or name.
    pub remote_cert_eku: Option<String>,
    /// X.509 name check.
    pub x509_name_check: Option<X509NameCheck>,
    /// Pinned peer fingerprints (SHA-256); non-empty replaces CA validation.
    pub peer_fingerprints: Vec<[u8; 32]>,
    /// Client key blob attached to the initial reset when configured.
    pub tls_crypt_v2_key: Option<String>,
}

impl TlsConfig {
    /// Parse the TLS policy directives out of a profile.
    pub fn from_options(opts: &OptionList) -> Result<Self> {
        let mut config = TlsConfig {
            ca_pem: opts.cat("ca"),
            ..TlsConfig::default()
        };

        if opts.exists("crl-verify") {
            let crl = opts.cat("crl-verify");
            if !crl.is_empty() {
                config.crl_pem = Some(crl);
            }
        }

        let cert = opts.cat("cert");
        if !cert.is_empty() {
            config.client_cert_pem = Some(cert);
        }
        let key = opts.cat("key");
        if !key.is_empty() {
            config.client_key_pem = Some(key);
        }
        config.external_pki = config.client_cert_pem.is_some() && config.client_key_pem.is_none();

        if let Some(opt) = opts.find("tls-version-min") {
            let token = opt
                .arg(0)
                .ok_or_else(|| Error::tls("tls-version-min missing argument"))?;
            config.min_version = Some(TlsVersion::parse(token)?);
        }

        if let Some(profile) = opts.get_optional("tls-cert-profile", 0, 32) {
            config.cert_profile = CertProfile::parse(&profile)?;
        }

        if let Some(kind) = opts.get_optional("ns-cert-type", 0, 16) {
            config.ns_cert_type = Some(match kind.as_str() {
                "server" => NsCertType::Server,
                "client" => NsCertType::Client,
                other => {
                    return Err(Error::tls(format!(
                        "bad ns-cert-type: {}",
                        utf8_printable(other, 16)
                    )))
                }
            });
        }

        // remote-cert-tls is shorthand for the ku/eku pair of a role.
        if let Some(role) = opts.get_optional("remote-cert-tls", 0, 16) {
            match role.as_str() {
                "server" => {
                    config.remote_cert_ku = vec![0x00a0, 0x0088];
                    config.remote_cert_eku = Some("TLS Web Server Authentication".into());
                }
                "client" => {
                    config.remote_cert_ku = vec![0x0080, 0x0008, 0x0088];
                    config.remote_cert_eku = Some("TLS Web Client Authentication".into());
                }
                other => {
                    return Err(Error::tls(format!(
                        "bad remote-cert-tls: {}",
                        utf8_printable(other, 16)
                    )))
                }
            }
        }

        if let Some(opt) = opts.find("remote-cert-ku") {
            let mut values = Vec::new();
            for token in &opt.tokens()[1..] {
                let v = u16::from_str_radix(token.trim_start_matches("0x"), 16)
                    .map_err(|_| Error::tls(format!("bad remote-cert-ku value: {token}")))?;
                values.push(v);
            }
            config.remote_cert_ku = values;
        }

        if let Some(eku) = opts.get_optional("remote-cert-eku", 0, 128) {
            config.remote_cert_eku = Some(eku);
        }

        if let Some(opt) = opts.find("verify-x509-name") {
            let name = opt
                .arg(0)
                .ok_or_else(|| Error::tls("verify-x509-name missing name"))?
                .to_string();
            config.x509_name_check = Some(match opt.arg(1).unwrap_or("subject") {
                "subject" => X509NameCheck::SubjectExact(name),
                "name" => X509NameCheck::RdnExact(name),
                "name-prefix" => X509NameCheck::RdnPrefix(name),
                other => {
                    return Err(Error::tls(format!(
                        "bad verify-x509-name type: {}",
                        utf8_printable(other, 16)
                    )))
                }
            });
        } else if let Some(name) = opts.get_optional("tls-remote", 0, 256) {
            config.x509_name_check = Some(X509NameCheck::RdnPrefix(name));
        }

        for opt in opts.find_all("peer-fingerprint") {
            if let Some(body) = opt.arg(0) {
                for line in body.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    config.peer_fingerprints.push(parse_fingerprint(line)?);
                }
            }
        }

        let tls_crypt_v2 = opts.cat("tls-crypt-v2");
        if !tls_crypt_v2.is_empty() {
            config.tls_crypt_v2_key = Some(tls_crypt_v2);
        }

        if config.ca_pem.is_empty() && config.peer_fingerprints.is_empty() {
            return Err(Error::tls(
                "profile needs a ca or at least one peer-fingerprint",
            ));
        }

        Ok(config)
    }

    /// Run every configured policy check against the peer certificate.
    ///
    /// The chain-of-trust validation itself happens inside the TLS
    /// collaborator; these are the additional checks layered on top.
    pub fn verify_peer(
        &self,
        cert: &PeerCertificate,
        version: TlsVersion,
    ) -> std::result::Result<(), (ErrorCode, String)> {
        if let Some(min) = self.min_version {
            if version < min {
                return Err((
                    ErrorCode::TlsVersionMin,
                    format!("peer negotiated {version:?}, minimum is {min:?}"),
                ));
            }
        }

        if !self.peer_fingerprints.is_empty() {
            let actual = cert.fingerprint();
            let matched = self
                .peer_fingerprints
                .iter()
                .any(|pinned| constant_time_eq(pinned, &actual));
            if !matched {
                return Err((
                    ErrorCode::CertVerifyFail,
                    "peer certificate matches no pinned fingerprint".into(),
                ));
            }
        }

        if let Some(required) = self.ns_cert_type {
            if cert.ns_cert_type != Some(required) {
                return Err((
                    ErrorCode::CertVerifyFail,
                    format!("ns-cert-type mismatch, wanted {required:?}"),
                ));
            }
        }

        if !self.remote_cert_ku.is_empty() {
            let ok = cert
                .key_usage
                .iter()
                .any(|ku| self.remote_cert_ku.contains(ku));
            if !ok {
                return Err((
                    ErrorCode::CertVerifyFail,
                    "peer certificate key usage not accepted".into(),
                ));
            }
        }

        if let Some(eku) = &self.remote_cert_eku {
            if !cert.ext_key_usage.iter().any(|e| e == eku) {
                return Err((
                    ErrorCode::CertVerifyFail,
                    format!("peer certificate lacks extended key usage {eku}"),
                ));
            }
        }

        if let Some(check) = &self.x509_name_check {
            let ok = match check {
                X509NameCheck::SubjectExact(want) => cert.subject == *want,
                X509NameCheck::RdnExact(want) => cert.common_name == *want,
                X509NameCheck::RdnPrefix(want) => cert.common_name.starts_with(want),
            };
            if !ok {
                return Err((
                    ErrorCode::CertVerifyFail,
                    format!(
                        "peer X.509 name '{}' rejected",
                        utf8_printable(&cert.common_name, 64)
                    ),
                ));
            }
        }

        Ok(())
    }
}

fn parse_fingerprint(text: &str) -> Result<[u8; 32]> {
    let cleaned: String = text.chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|_| Error::tls(format!("bad fingerprint: {}", utf8_printable(text, 96))))?;
    bytes
        .try_into()
        .map_err(|_| Error::tls("fingerprint must be 32 bytes of hex"))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// External signer capability used when the private key lives outside the
/// process. The adapter marshals to the host and blocks the handshake until
/// the signature (or an error) comes back.
pub trait ExternalSigner: Send + Sync {
    /// Sign `data`; an error aborts the handshake fatally.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// A TLS session with memory-buffered I/O.
///
/// The wrapper never touches the network: the engine moves ciphertext in and
/// out as control-channel payload.
pub trait TlsSession: Send {
    /// Kick off the handshake, queueing the first flight of ciphertext.
    fn start_handshake(&mut self) -> Result<()>;

    /// Feed ciphertext received from the peer.
    fn push_ciphertext(&mut self, data: &[u8]) -> Result<()>;

    /// Drain one outgoing ciphertext record, if any.
    fn pull_ciphertext(&mut self) -> Option<Bytes>;

    /// Write application plaintext into the session.
    fn write_plaintext(&mut self, data: &[u8]) -> Result<()>;

    /// Read one decrypted application record, if any.
    fn read_plaintext(&mut self) -> Result<Option<Bytes>>;

    /// Whether the handshake has completed.
    fn is_established(&self) -> bool;

    /// Negotiated protocol version, once established.
    fn negotiated_version(&self) -> Option<TlsVersion>;

    /// Peer certificate view for policy checks, once established.
    fn peer_certificate(&self) -> Option<PeerCertificate>;
}

/// Creates one TLS session per handshake (including rekeys).
pub trait TlsSessionFactory: Send + Sync {
    /// Build a session for the given policy.
    fn new_session(
        &self,
        config: &TlsConfig,
        signer: Option<Arc<dyn ExternalSigner>>,
    ) -> Result<Box<dyn TlsSession>>;
}

/// Role of a [`MemoryTls`] endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

const MEMORY_TLS_CLIENT_HELLO: &[u8] = b"MTLS1-CLIENT-HELLO";
const MEMORY_TLS_SERVER_HELLO: &[u8] = b"MTLS1-SERVER-HELLO";

/// Deterministic in-process TLS session.
///
/// Runs a two-message hello exchange and then frames plaintext as
/// length-prefixed records. Used by the test harness and by reference
/// embedders that terminate real TLS elsewhere; production deployments
/// supply a TLS-library-backed [`TlsSession`].
pub struct MemoryTls {
    role: TlsRole,
    established: bool,
    hello_sent: bool,
    inbound: BytesMut,
    out_records: VecDeque<Bytes>,
    plain_in: VecDeque<Bytes>,
    version: TlsVersion,
    peer_cert: Option<PeerCertificate>,
    signer: Option<Arc<dyn ExternalSigner>>,
}

impl MemoryTls {
    /// Build an endpoint.
    pub fn new(role: TlsRole, version: TlsVersion, peer_cert: Option<PeerCertificate>) -> Self {
        Self {
            role,
            established: false,
            hello_sent: false,
            inbound: BytesMut::new(),
            out_records: VecDeque::new(),
            plain_in: VecDeque::new(),
            version,
            peer_cert,
            signer: None,
        }
    }

    /// Attach an external signer exercised once during the handshake.
    pub fn with_signer(mut self, signer: Arc<dyn ExternalSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    fn queue_record(&mut self, payload: &[u8]) {
        let mut rec = BytesMut::with_capacity(2 + payload.len());
        rec.put_u16(payload.len() as u16);
        rec.put_slice(payload);
        self.out_records.push_back(rec.freeze());
    }

    fn my_hello(&self) -> &'static [u8] {
        match self.role {
            TlsRole::Client => MEMORY_TLS_CLIENT_HELLO,
            TlsRole::Server => MEMORY_TLS_SERVER_HELLO,
        }
    }

    fn peer_hello(&self) -> &'static [u8] {
        match self.role {
            TlsRole::Client => MEMORY_TLS_SERVER_HELLO,
            TlsRole::Server => MEMORY_TLS_CLIENT_HELLO,
        }
    }

    fn process_inbound(&mut self) -> Result<()> {
        loop {
            if self.inbound.len() < 2 {
                return Ok(());
            }
            let len = u16::from_be_bytes([self.inbound[0], self.inbound[1]]) as usize;
            if self.inbound.len() < 2 + len {
                return Ok(());
            }
            self.inbound.advance(2);
            let payload = self.inbound.split_to(len).freeze();

            if !self.established {
                if payload.as_ref() != self.peer_hello() {
                    return Err(Error::tagged(
                        ErrorCode::TlsAlertHandshakeFailure,
                        "unexpected handshake message",
                    ));
                }
                // The server answers the client's hello; the external signer
                // (when present) proves possession of the client key here.
                if self.role == TlsRole::Server && !self.hello_sent {
                    self.hello_sent = true;
                    let hello = self.my_hello().to_vec();
                    self.queue_record(&hello);
                }
                if self.role == TlsRole::Client {
                    if let Some(signer) = self.signer.clone() {
                        let sig = signer.sign(MEMORY_TLS_CLIENT_HELLO)?;
                        self.queue_record(&sig);
                    }
                }
                self.established = true;
            } else {
                self.plain_in.push_back(payload);
            }
        }
    }
}

impl TlsSession for MemoryTls {
    fn start_handshake(&mut self) -> Result<()> {
        if self.role == TlsRole::Client && !self.hello_sent {
            self.hello_sent = true;
            let hello = self.my_hello().to_vec();
            self.queue_record(&hello);
        }
        Ok(())
    }

    fn push_ciphertext(&mut self, data: &[u8]) -> Result<()> {
        self.inbound.extend_from_slice(data);
        self.process_inbound()
    }

    fn pull_ciphertext(&mut self) -> Option<Bytes> {
        self.out_records.pop_front()
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<()> {
        if !self.established {
            return Err(Error::tls("session not established"));
        }
        self.queue_record(data);
        Ok(())
    }

    fn read_plaintext(&mut self) -> Result<Option<Bytes>> {
        Ok(self.plain_in.pop_front())
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn negotiated_version(&self) -> Option<TlsVersion> {
        self.established.then_some(self.version)
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        if self.established {
            self.peer_cert.clone()
        } else {
            None
        }
    }
}

/// Factory producing [`MemoryTls`] client sessions.
pub struct MemoryTlsFactory {
    /// Version the fake negotiation reports.
    pub version: TlsVersion,
    /// Certificate the fake peer presents.
    pub peer_cert: Option<PeerCertificate>,
}

impl Default for MemoryTlsFactory {
    fn default() -> Self {
        Self {
            version: TlsVersion::V1_3,
            peer_cert: None,
        }
    }
}

impl TlsSessionFactory for MemoryTlsFactory {
    fn new_session(
        &self,
        _config: &TlsConfig,
        signer: Option<Arc<dyn ExternalSigner>>,
    ) -> Result<Box<dyn TlsSession>> {
        let mut session = MemoryTls::new(TlsRole::Client, self.version, self.peer_cert.clone());
        if let Some(signer) = signer {
            session = session.with_signer(signer);
        }
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shuttle(from: &mut MemoryTls, to: &mut MemoryTls) {
        while let Some(rec) = from.pull_ciphertext() {
            to.push_ciphertext(&rec).unwrap();
        }
    }

    fn established_pair() -> (MemoryTls, MemoryTls) {
        let mut client = MemoryTls::new(TlsRole::Client, TlsVersion::V1_3, None);
        let mut server = MemoryTls::new(TlsRole::Server, TlsVersion::V1_3, None);
        client.start_handshake().unwrap();
        shuttle(&mut client, &mut server);
        shuttle(&mut server, &mut client);
        (client, server)
    }

    #[test]
    fn test_memory_tls_handshake() {
        let (client, server) = established_pair();
        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(client.negotiated_version(), Some(TlsVersion::V1_3));
    }

    #[test]
    fn test_memory_tls_plaintext_flow() {
        let (mut client, mut server) = established_pair();
        client.write_plaintext(b"key exchange message").unwrap();
        shuttle(&mut client, &mut server);
        let got = server.read_plaintext().unwrap().unwrap();
        assert_eq!(got.as_ref(), b"key exchange message");

        server.write_plaintext(b"reply").unwrap();
        shuttle(&mut server, &mut client);
        assert_eq!(client.read_plaintext().unwrap().unwrap().as_ref(), b"reply");
    }

    #[test]
    fn test_memory_tls_fragmented_records() {
        let mut client = MemoryTls::new(TlsRole::Client, TlsVersion::V1_3, None);
        let mut server = MemoryTls::new(TlsRole::Server, TlsVersion::V1_3, None);
        client.start_handshake().unwrap();
        let rec = client.pull_ciphertext().unwrap();
        // Deliver byte by byte; the record layer must reassemble.
        for b in rec.iter() {
            server.push_ciphertext(&[*b]).unwrap();
        }
        assert!(server.is_established());
    }

    #[test]
    fn test_memory_tls_bad_handshake() {
        let mut server = MemoryTls::new(TlsRole::Server, TlsVersion::V1_3, None);
        let mut garbage = BytesMut::new();
        garbage.put_u16(4);
        garbage.put_slice(b"junk");
        let err = server.push_ciphertext(&garbage).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TlsAlertHandshakeFailure);
    }

    fn tls_opts(extra: &str) -> OptionList {
        let text = format!("<ca>\npem data\n</ca>\n{extra}");
        OptionList::parse(&text).unwrap()
    }

    #[test]
    fn test_config_parsing() {
        let opts = tls_opts(
            "tls-version-min 1.2\ntls-cert-profile preferred\nremote-cert-tls server\nverify-x509-name vpn.example.com name\n",
        );
        let config = TlsConfig::from_options(&opts).unwrap();
        assert_eq!(config.min_version, Some(TlsVersion::V1_2));
        assert_eq!(config.cert_profile, CertProfile::Preferred);
        assert!(!config.remote_cert_ku.is_empty());
        assert_eq!(
            config.x509_name_check,
            Some(X509NameCheck::RdnExact("vpn.example.com".into()))
        );
        assert!(!config.external_pki);
    }

    #[test]
    fn test_config_requires_trust_anchor() {
        let opts = OptionList::parse("client\n").unwrap();
        assert!(TlsConfig::from_options(&opts).is_err());
    }

    #[test]
    fn test_config_external_pki_detection() {
        let opts = OptionList::parse("<ca>\npem\n</ca>\n<cert>\npem\n</cert>\n").unwrap();
        let config = TlsConfig::from_options(&opts).unwrap();
        assert!(config.external_pki);
    }

    #[test]
    fn test_config_peer_fingerprint() {
        let fp = "00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff:00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff";
        let opts = OptionList::parse(&format!("<peer-fingerprint>\n{fp}\n</peer-fingerprint>\n"))
            .unwrap();
        let config = TlsConfig::from_options(&opts).unwrap();
        assert_eq!(config.peer_fingerprints.len(), 1);
        assert_eq!(config.peer_fingerprints[0][0], 0x00);
        assert_eq!(config.peer_fingerprints[0][31], 0xff);
    }

    fn server_cert() -> PeerCertificate {
        PeerCertificate {
            subject: "C=US, O=Example, CN=vpn.example.com".into(),
            common_name: "vpn.example.com".into(),
            ns_cert_type: Some(NsCertType::Server),
            key_usage: vec![0x00a0],
            ext_key_usage: vec!["TLS Web Server Authentication".into()],
            der: b"fake der".to_vec(),
        }
    }

    #[test]
    fn test_verify_peer_passes() {
        let opts = tls_opts(
            "tls-version-min 1.2\nremote-cert-tls server\nns-cert-type server\nverify-x509-name vpn.example.com name\n",
        );
        let config = TlsConfig::from_options(&opts).unwrap();
        assert!(config
            .verify_peer(&server_cert(), TlsVersion::V1_3)
            .is_ok());
    }

    #[test]
    fn test_verify_peer_version_min() {
        let opts = tls_opts("tls-version-min 1.3\n");
        let config = TlsConfig::from_options(&opts).unwrap();
        let (code, _) = config
            .verify_peer(&server_cert(), TlsVersion::V1_2)
            .unwrap_err();
        assert_eq!(code, ErrorCode::TlsVersionMin);
    }

    #[test]
    fn test_verify_peer_name_checks() {
        let cert = server_cert();

        let exact = tls_opts("verify-x509-name vpn.example.com name\n");
        assert!(TlsConfig::from_options(&exact)
            .unwrap()
            .verify_peer(&cert, TlsVersion::V1_3)
            .is_ok());

        let prefix = tls_opts("verify-x509-name vpn. name-prefix\n");
        assert!(TlsConfig::from_options(&prefix)
            .unwrap()
            .verify_peer(&cert, TlsVersion::V1_3)
            .is_ok());

        let wrong = tls_opts("verify-x509-name other.example.com name\n");
        let (code, _) = TlsConfig::from_options(&wrong)
            .unwrap()
            .verify_peer(&cert, TlsVersion::V1_3)
            .unwrap_err();
        assert_eq!(code, ErrorCode::CertVerifyFail);
    }

    #[test]
    fn test_verify_peer_ku_eku() {
        let mut cert = server_cert();
        cert.key_usage = vec![0x0001];
        let opts = tls_opts("remote-cert-tls server\n");
        let (code, _) = TlsConfig::from_options(&opts)
            .unwrap()
            .verify_peer(&cert, TlsVersion::V1_3)
            .unwrap_err();
        assert_eq!(code, ErrorCode::CertVerifyFail);
    }

    #[test]
    fn test_verify_peer_fingerprint_pinning() {
        let cert = server_cert();
        let fp = cert.fingerprint();
        let fp_hex = hex::encode(fp);

        let opts = OptionList::parse(&format!(
            "<peer-fingerprint>\n{fp_hex}\n</peer-fingerprint>\n"
        ))
        .unwrap();
        let config = TlsConfig::from_options(&opts).unwrap();
        assert!(config.verify_peer(&cert, TlsVersion::V1_3).is_ok());

        let mut other = cert.clone();
        other.der = b"different der".to_vec();
        let (code, _) = config.verify_peer(&other, TlsVersion::V1_3).unwrap_err();
        assert_eq!(code, ErrorCode::CertVerifyFail);
    }

    struct FailingSigner;
    impl ExternalSigner for FailingSigner {
        fn sign(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::tagged(ErrorCode::EpkiSignError, "host refused"))
        }
    }

    #[test]
    fn test_external_signer_failure_aborts_handshake() {
        let mut client = MemoryTls::new(TlsRole::Client, TlsVersion::V1_3, None)
            .with_signer(Arc::new(FailingSigner));
        let mut server = MemoryTls::new(TlsRole::Server, TlsVersion::V1_3, None);
        client.start_handshake().unwrap();
        shuttle(&mut client, &mut server);

        // Server's hello arrives; the client then invokes the signer, which
        // fails and aborts.
        let rec = server.pull_ciphertext().unwrap();
        let err = client.push_ciphertext(&rec).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EpkiSignError);
    }
}
