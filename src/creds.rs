//! Credentials and challenge handling.
//!
//! Carries the username/password pair, the response to a static challenge,
//! the dynamic-challenge cookie, and the server-issued session token that
//! replaces the password on later authentications. All secret fields are
//! zeroized on drop.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::options::utf8_printable;

/// Credentials supplied by the host before `connect()`.
#[derive(Debug, Default, Clone)]
pub struct ProvideCreds {
    pub username: String,
    pub password: String,
    /// Response to a static or dynamic challenge.
    pub response: String,
    /// Cookie from a previous `DYNAMIC_CHALLENGE` event.
    pub dynamic_challenge_cookie: String,
    pub http_proxy_user: String,
    pub http_proxy_pass: String,
}

/// Session credentials as used by the handshake.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
    response: String,
    dynamic_challenge_cookie: String,
    http_proxy_user: String,
    http_proxy_pass: String,
    session_token: String,
    #[zeroize(skip)]
    username_locked: bool,
}

impl Credentials {
    /// Install host-provided credentials. A profile-locked username wins
    /// over the provided one.
    pub fn provide(&mut self, creds: ProvideCreds) {
        if !self.username_locked {
            self.username = creds.username;
        }
        self.password = creds.password;
        self.response = creds.response;
        self.dynamic_challenge_cookie = creds.dynamic_challenge_cookie;
        self.http_proxy_user = creds.http_proxy_user;
        self.http_proxy_pass = creds.http_proxy_pass;
    }

    /// Pin the username to the profile's value.
    pub fn lock_username(&mut self, username: &str) {
        self.username = username.to_string();
        self.username_locked = true;
    }

    /// Username sent during authentication. With a dynamic-challenge cookie
    /// present the cookie's embedded username wins.
    pub fn auth_username(&self) -> Result<String> {
        if !self.dynamic_challenge_cookie.is_empty() {
            let dc = DynamicChallenge::parse(&self.dynamic_challenge_cookie)?;
            return Ok(dc.username);
        }
        Ok(self.username.clone())
    }

    /// Password sent during authentication.
    ///
    /// Priority: session token, then dynamic-challenge response, then the
    /// static-challenge combined form, then the plain password.
    pub fn auth_password(&self, static_challenge: bool) -> Result<String> {
        if !self.session_token.is_empty() {
            return Ok(self.session_token.clone());
        }
        if !self.dynamic_challenge_cookie.is_empty() {
            let dc = DynamicChallenge::parse(&self.dynamic_challenge_cookie)?;
            if self.response.is_empty() {
                return Err(Error::Creds("dynamic challenge response missing".into()));
            }
            return Ok(dc.response_password(&self.response));
        }
        if static_challenge {
            if self.response.is_empty() {
                return Err(Error::Creds("static challenge response missing".into()));
            }
            return Ok(format!(
                "SCRV1:{}:{}",
                BASE64.encode(&self.password),
                BASE64.encode(&self.response)
            ));
        }
        Ok(self.password.clone())
    }

    /// Whether a username/password pair is available.
    pub fn defined(&self) -> bool {
        !self.username.is_empty() && (!self.password.is_empty() || !self.session_token.is_empty())
    }

    /// Install a server-issued session token.
    pub fn set_session_token(&mut self, token: &str) {
        self.session_token = token.to_string();
    }

    /// The current session token, if any.
    pub fn session_token(&self) -> Option<&str> {
        if self.session_token.is_empty() {
            None
        } else {
            Some(self.session_token.as_str())
        }
    }

    /// Forget the session token, falling back to the password.
    pub fn purge_session_token(&mut self) {
        self.session_token.zeroize();
        self.session_token = String::new();
    }

    /// Proxy credentials, when configured.
    pub fn proxy_creds(&self) -> Option<(&str, &str)> {
        if self.http_proxy_user.is_empty() {
            None
        } else {
            Some((&self.http_proxy_user, &self.http_proxy_pass))
        }
    }

    /// Username for host-visible reporting.
    pub fn username(&self) -> &str {
        &self.username
    }
}

/// A parsed dynamic challenge, delivered to the host as an event and echoed
/// back as a cookie with the next `provide_creds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicChallenge {
    pub challenge: String,
    pub echo: bool,
    pub response_required: bool,
    pub state_id: String,
    pub username: String,
}

const COOKIE_PREFIX: &str = "CRV1:";

impl DynamicChallenge {
    /// Parse a `CRV1:<flags>:<state_id>:<b64 username>:<challenge>` cookie.
    pub fn parse(cookie: &str) -> Result<Self> {
        let rest = cookie
            .strip_prefix(COOKIE_PREFIX)
            .ok_or_else(|| Error::Creds("bad dynamic challenge cookie prefix".into()))?;
        let mut parts = rest.splitn(4, ':');
        let flags = parts
            .next()
            .ok_or_else(|| Error::Creds("cookie missing flags".into()))?;
        let state_id = parts
            .next()
            .ok_or_else(|| Error::Creds("cookie missing state id".into()))?;
        let username_b64 = parts
            .next()
            .ok_or_else(|| Error::Creds("cookie missing username".into()))?;
        let challenge = parts
            .next()
            .ok_or_else(|| Error::Creds("cookie missing challenge text".into()))?;

        let username = BASE64
            .decode(username_b64)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or_else(|| Error::Creds("cookie username not valid base64".into()))?;

        Ok(Self {
            challenge: utf8_printable(challenge, 256),
            echo: flags.split(',').any(|f| f == "E"),
            response_required: flags.split(',').any(|f| f == "R"),
            state_id: state_id.to_string(),
            username,
        })
    }

    /// Render this challenge back into cookie form.
    pub fn encode(&self) -> String {
        let mut flags = Vec::new();
        if self.echo {
            flags.push("E");
        }
        if self.response_required {
            flags.push("R");
        }
        format!(
            "{}{}:{}:{}:{}",
            COOKIE_PREFIX,
            flags.join(","),
            self.state_id,
            BASE64.encode(&self.username),
            self.challenge
        )
    }

    /// Password value answering this challenge.
    pub fn response_password(&self, response: &str) -> String {
        format!("CRV1::{}::{}", self.state_id, response)
    }
}
