//! External PKI marshalling.
//!
//! When the profile carries a certificate but no private key, signing is
//! delegated to the host: the handshake suspends, a sign request with the
//! base64-encoded to-be-signed blob crosses the capability boundary, and the
//! handshake resumes with the returned signature (or aborts on error).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{Error, ErrorCode, Result};

/// Signature algorithm descriptor sent with a sign request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignAlgorithm {
    /// RSA with PKCS#1 v1.5 padding; data carries the digest prefix.
    RsaPkcs1,
    /// RSA-PSS with the given hash and salt length.
    RsaPss { hash: String, salt_len: String },
    /// ECDSA, optionally with an explicit hash.
    Ecdsa { hash: Option<String> },
}

impl SignAlgorithm {
    /// Algorithm token as the host sees it.
    pub fn name(&self) -> &'static str {
        match self {
            SignAlgorithm::RsaPkcs1 => "RSA_PKCS1_PADDING",
            SignAlgorithm::RsaPss { .. } => "RSA_PKCS1_PSS_PADDING",
            SignAlgorithm::Ecdsa { .. } => "ECDSA",
        }
    }

    /// Hash algorithm field, when the descriptor carries one.
    pub fn hash_alg(&self) -> Option<&str> {
        match self {
            SignAlgorithm::RsaPkcs1 => None,
            SignAlgorithm::RsaPss { hash, .. } => Some(hash),
            SignAlgorithm::Ecdsa { hash } => hash.as_deref(),
        }
    }

    /// PSS salt length field, when applicable.
    pub fn salt_len(&self) -> Option<&str> {
        match self {
            SignAlgorithm::RsaPss { salt_len, .. } => Some(salt_len),
            _ => None,
        }
    }
}

/// Request for the client certificate chain.
#[derive(Debug, Clone, Default)]
pub struct ExternalPkiCertRequest {
    /// Alias selecting the key in the host's store.
    pub alias: String,
    /// Host writes: leaf certificate in PEM form.
    pub cert: String,
    /// Host writes: intermediates and root, optional.
    pub supporting_chain: String,
    /// Host writes: set on failure.
    pub error: bool,
    /// Host writes: error description.
    pub error_text: String,
    /// Host writes: the alias itself was unknown.
    pub invalid_alias: bool,
}

/// Request for one signature.
#[derive(Debug, Clone)]
pub struct ExternalPkiSignRequest {
    /// Alias selecting the key in the host's store.
    pub alias: String,
    /// To-be-signed blob, base64-encoded.
    pub data: String,
    /// Algorithm token (see [`SignAlgorithm::name`]).
    pub algorithm: String,
    /// Optional hash algorithm, e.g. `SHA256`.
    pub hash_alg: String,
    /// Optional PSS salt length.
    pub salt_len: String,
    /// Host writes: signature, base64-encoded.
    pub sig: String,
    /// Host writes: set on failure.
    pub error: bool,
    /// Host writes: error description.
    pub error_text: String,
}

impl ExternalPkiSignRequest {
    /// Build a request for the given blob and algorithm.
    pub fn new(alias: &str, data: &[u8], algorithm: &SignAlgorithm) -> Self {
        Self {
            alias: alias.to_string(),
            data: BASE64.encode(data),
            algorithm: algorithm.name().to_string(),
            hash_alg: algorithm.hash_alg().unwrap_or("").to_string(),
            salt_len: algorithm.salt_len().unwrap_or("").to_string(),
            sig: String::new(),
            error: false,
            error_text: String::new(),
        }
    }

    /// Decode the host's answer into raw signature bytes.
    pub fn take_signature(&self) -> Result<Vec<u8>> {
        if self.error {
            return Err(Error::tagged(
                ErrorCode::EpkiSignError,
                format!("external PKI sign failed: {}", self.error_text),
            ));
        }
        if self.sig.is_empty() {
            return Err(Error::tagged(
                ErrorCode::EpkiSignError,
                "external PKI returned no signature",
            ));
        }
        BASE64
            .decode(&self.sig)
            .map_err(|_| Error::tagged(ErrorCode::EpkiSignError, "signature is not valid base64"))
    }
}

impl ExternalPkiCertRequest {
    /// Build a cert request for an alias.
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            ..Self::default()
        }
    }

    /// Full PEM chain (leaf then supporting chain), or the typed error.
    pub fn take_chain(&self) -> Result<String> {
        if self.error {
            return Err(Error::tagged(
                ErrorCode::EpkiCertError,
                format!("external PKI cert failed: {}", self.error_text),
            ));
        }
        if self.cert.is_empty() {
            return Err(Error::tagged(
                ErrorCode::EpkiCertError,
                "external PKI returned no certificate",
            ));
        }
        let mut chain = self.cert.clone();
        if !self.supporting_chain.is_empty() {
            if !chain.ends_with('\n') {
                chain.push('\n');
            }
            chain.push_str(&self.supporting_chain);
        }
        Ok(chain)
    }
}
