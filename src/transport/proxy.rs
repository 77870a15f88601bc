//! HTTP CONNECT proxy transport.
//!
//! Negotiates `CONNECT host:port` with optional Basic authentication and
//! hands back the raw stream, which then behaves as a plain TCP link.
//! Digest and NTLM challenges are recognised but not implemented; NTLM-only
//! proxies surface the missing-crypto error, and absent credentials surface
//! the needs-credentials error so the host can prompt.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, ErrorCode, Result};
use crate::options::{utf8_printable, OptionList};

/// Cap on the proxy response header block.
const MAX_RESPONSE: usize = 8 * 1024;

/// Proxy endpoint and credentials.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Permit HTTP Basic (cleartext) authentication.
    pub allow_cleartext_auth: bool,
}

impl ProxyConfig {
    /// Parse `http-proxy host port` from a profile, if present.
    pub fn from_options(opts: &OptionList) -> Result<Option<Self>> {
        let Some(opt) = opts.find("http-proxy") else {
            return Ok(None);
        };
        let host = opt
            .arg(0)
            .ok_or_else(|| Error::Proxy("http-proxy: missing host".into()))?
            .to_string();
        let port: u16 = opt
            .arg(1)
            .ok_or_else(|| Error::Proxy("http-proxy: missing port".into()))?
            .parse()
            .map_err(|_| Error::Proxy("http-proxy: bad port".into()))?;
        Ok(Some(Self {
            host,
            port,
            username: None,
            password: None,
            allow_cleartext_auth: true,
        }))
    }

    /// Install credentials from the host.
    pub fn set_creds(&mut self, username: &str, password: &str) {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
    }

    fn basic_auth_header(&self) -> Option<String> {
        let (user, pass) = (self.username.as_ref()?, self.password.as_ref()?);
        Some(format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(format!("{user}:{pass}"))
        ))
    }
}

/// Establish a tunnel to `target_host:target_port` through the proxy.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    // First round without credentials; retry once on 407 when allowed.
    match connect_once(proxy, target_host, target_port, false).await {
        Err(e) if e.code() == ErrorCode::ProxyNeedCreds => {
            if proxy.username.is_some() && proxy.allow_cleartext_auth {
                connect_once(proxy, target_host, target_port, true).await
            } else {
                Err(e)
            }
        }
        other => other,
    }
}

async fn connect_once(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    with_auth: bool,
) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| {
            Error::tagged(
                ErrorCode::ProxyError,
                format!("cannot reach proxy {}:{}: {e}", proxy.host, proxy.port),
            )
        })?;

    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n"
    );
    if with_auth {
        match proxy.basic_auth_header() {
            Some(header) => request.push_str(&header),
            None => {
                return Err(Error::tagged(
                    ErrorCode::ProxyNeedCreds,
                    "proxy requires credentials",
                ))
            }
        }
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::tagged(ErrorCode::ProxyError, format!("proxy send: {e}")))?;

    let headers = read_response(&mut stream).await?;
    let status = parse_status(&headers)?;

    match status {
        200..=299 => Ok(stream),
        407 => {
            let challenges = auth_challenges(&headers);
            if challenges.iter().any(|c| c.eq_ignore_ascii_case("basic")) {
                Err(Error::tagged(
                    ErrorCode::ProxyNeedCreds,
                    "proxy requires authentication",
                ))
            } else if challenges.iter().any(|c| c.eq_ignore_ascii_case("ntlm")) {
                Err(Error::tagged(
                    ErrorCode::NtlmMissingCrypto,
                    "proxy offers only NTLM authentication",
                ))
            } else {
                Err(Error::tagged(
                    ErrorCode::ProxyError,
                    "proxy offered no usable authentication scheme",
                ))
            }
        }
        other => Err(Error::tagged(
            ErrorCode::ProxyError,
            format!("proxy CONNECT failed with status {other}"),
        )),
    }
}

async fn read_response(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_RESPONSE {
            return Err(Error::tagged(
                ErrorCode::ProxyError,
                "proxy response header block too large",
            ));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| Error::tagged(ErrorCode::ProxyError, format!("proxy recv: {e}")))?;
        if n == 0 {
            return Err(Error::tagged(
                ErrorCode::ProxyError,
                "proxy closed connection during handshake",
            ));
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_status(headers: &str) -> Result<u16> {
    let status_line = headers.lines().next().unwrap_or("");
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(Error::tagged(
            ErrorCode::ProxyError,
            format!("bad proxy status line: {}", utf8_printable(status_line, 64)),
        ));
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::tagged(ErrorCode::ProxyError, "proxy status code missing"))
}

fn auth_challenges(headers: &str) -> Vec<String> {
    headers
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("proxy-authenticate") {
                Some(
                    value
                        .trim()
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_string(),
                )
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_proxy(responses: Vec<&'static str>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap();
                // Keep the request for assertions via the response body.
                let _request = String::from_utf8_lossy(&buf[..n]).into_owned();
                stream.write_all(response.as_bytes()).await.unwrap();
                if response.starts_with("HTTP/1.1 200") {
                    // Tunnel established; echo one record back.
                    let n = stream.read(&mut buf).await.unwrap();
                    stream.write_all(&buf[..n]).await.unwrap();
                }
            }
        });
        addr
    }

    fn config(addr: std::net::SocketAddr) -> ProxyConfig {
        ProxyConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            username: None,
            password: None,
            allow_cleartext_auth: true,
        }
    }

    #[tokio::test]
    async fn test_connect_success() {
        let addr = fake_proxy(vec!["HTTP/1.1 200 Connection established\r\n\r\n"]).await;
        let mut stream = connect_via_proxy(&config(addr), "vpn.example.com", 443)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_missing_creds_surfaces_need_creds() {
        let addr = fake_proxy(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n",
        ])
        .await;
        let err = connect_via_proxy(&config(addr), "vpn.example.com", 443)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProxyNeedCreds);
    }

    #[tokio::test]
    async fn test_retry_with_basic_auth() {
        let addr = fake_proxy(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n",
            "HTTP/1.1 200 Connection established\r\n\r\n",
        ])
        .await;
        let mut proxy = config(addr);
        proxy.set_creds("user", "pass");
        assert!(connect_via_proxy(&proxy, "vpn.example.com", 443)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ntlm_only_is_missing_crypto() {
        let addr = fake_proxy(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\n\r\n",
        ])
        .await;
        let err = connect_via_proxy(&config(addr), "vpn.example.com", 443)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NtlmMissingCrypto);
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let addr = fake_proxy(vec!["HTTP/1.1 502 Bad Gateway\r\n\r\n"]).await;
        let err = connect_via_proxy(&config(addr), "vpn.example.com", 443)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProxyError);
    }

    #[test]
    fn test_config_from_options() {
        let opts = OptionList::parse("http-proxy proxy.local 8080\n").unwrap();
        let proxy = ProxyConfig::from_options(&opts).unwrap().unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.port, 8080);

        let opts = OptionList::parse("client\n").unwrap();
        assert!(ProxyConfig::from_options(&opts).unwrap().is_none());

        let opts = OptionList::parse("http-proxy onlyhost\n").unwrap();
        assert!(ProxyConfig::from_options(&opts).is_err());
    }
}
