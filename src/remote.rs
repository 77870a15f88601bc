//! Remote candidate list.
//!
//! The profile's `remote` directives expand into an ordered list of
//! `(host, port, transport, ip version)` candidates. The connect loop walks
//! the list with a cursor, cycling when it runs off the end; a server push
//! may replace the list, and an embedder hook may supply the next candidate
//! dynamically.

use std::net::SocketAddr;

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::options::{utf8_printable, OptionList};

/// Transport protocol of a remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    /// TCP reached through an HTTP CONNECT proxy.
    TcpViaHttp,
}

impl Protocol {
    /// Short name as written in a profile.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::TcpViaHttp => "tcp-via-http",
        }
    }

    /// Whether the candidate uses a stream transport.
    pub fn is_stream(self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

/// IP version preference of a remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    Any,
    V4,
    V6,
}

/// One connectable candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub ip_version: IpVersion,
    /// Pre-resolved address, when the host is a literal IP or an override
    /// hook supplied one.
    pub resolved: Option<SocketAddr>,
}

impl Remote {
    /// Build a candidate, validating host and port the way profile parsing
    /// does.
    pub fn new(host: &str, port: u16, protocol: Protocol, ip_version: IpVersion) -> Result<Self> {
        validate_host(host)?;
        if port == 0 {
            return Err(Error::Remote(format!("bad port number: {port}")));
        }
        let resolved = host
            .parse::<std::net::IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, port));
        Ok(Self {
            host: host.to_string(),
            port,
            protocol,
            ip_version,
            resolved,
        })
    }

    /// `host:port (proto)` for logs and events.
    pub fn describe(&self) -> String {
        format!("{}:{} ({})", self.host, self.port, self.protocol.name())
    }
}

fn validate_host(host: &str) -> Result<()> {
    let ok = !host.is_empty()
        && host.len() <= 256
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':');
    if ok {
        Ok(())
    } else {
        Err(Error::Remote(format!(
            "bad remote host: {}",
            utf8_printable(host, 64)
        )))
    }
}

/// Parse a profile proto token into `(protocol, ip version, adaptive)`.
fn parse_proto(token: &str) -> Result<(Protocol, IpVersion, bool)> {
    match token {
        "udp" => Ok((Protocol::Udp, IpVersion::Any, false)),
        "udp4" => Ok((Protocol::Udp, IpVersion::V4, false)),
        "udp6" => Ok((Protocol::Udp, IpVersion::V6, false)),
        "tcp" | "tcp-client" => Ok((Protocol::Tcp, IpVersion::Any, false)),
        "tcp4" | "tcp4-client" => Ok((Protocol::Tcp, IpVersion::V4, false)),
        "tcp6" | "tcp6-client" => Ok((Protocol::Tcp, IpVersion::V6, false)),
        "adaptive" => Ok((Protocol::Udp, IpVersion::Any, true)),
        other => Err(Error::Remote(format!(
            "bad proto: {}",
            utf8_printable(other, 32)
        ))),
    }
}

/// Embedder hook that can substitute the next remote before an attempt.
///
/// Called at most once per connection attempt, synchronously on the session
/// loop. An `Err` surfaces as a fatal resolve-class failure.
pub trait RemoteOverrideHook: Send {
    fn next_remote(&self, current: &Remote) -> std::result::Result<Remote, String>;
}

/// Ordered, cycling list of remote candidates.
pub struct RemoteList {
    remotes: Vec<Remote>,
    index: usize,
    cycle_generation: u64,
    override_hook: Option<Box<dyn RemoteOverrideHook>>,
}

impl RemoteList {
    /// Build the candidate list from profile options.
    ///
    /// `proto_override` forces every candidate onto one transport;
    /// `ip_override` narrows the address family. `remote-random` shuffles
    /// once at construction; cycle order is deterministic thereafter.
    pub fn from_options(
        opts: &OptionList,
        proto_override: Option<Protocol>,
        ip_override: Option<IpVersion>,
    ) -> Result<Self> {
        let use_proxy = opts.exists("http-proxy");
        let mut remotes = Vec::new();

        for opt in opts.find_all("remote") {
            let host = opt
                .arg(0)
                .ok_or_else(|| Error::Remote("remote: missing host".into()))?;
            let port: u16 = match opt.arg(1) {
                None => 1194,
                Some(raw) => raw.parse().map_err(|_| {
                    Error::Remote(format!("bad remote port: {}", utf8_printable(raw, 16)))
                })?,
            };
            let (proto, ipver, adaptive) = match opt.arg(2) {
                None => (Protocol::Udp, IpVersion::Any, false),
                Some(tok) => parse_proto(tok)?,
            };

            let protos: Vec<Protocol> = match proto_override {
                Some(p) => vec![p],
                None if adaptive => vec![Protocol::Udp, Protocol::Tcp],
                None => match proto {
                    Protocol::Udp => vec![Protocol::Udp],
                    _ => vec![Protocol::Tcp],
                },
            };
            let ipver = match ip_override {
                Some(v) => v,
                None => ipver,
            };

            for p in protos {
                // A configured HTTP proxy reroutes every stream candidate.
                let p = if p.is_stream() && use_proxy {
                    Protocol::TcpViaHttp
                } else {
                    p
                };
                remotes.push(Remote::new(host, port, p, ipver)?);
            }
        }

        if remotes.is_empty() {
            return Err(Error::Remote("profile has no remote entries".into()));
        }

        if opts.exists("remote-random") {
            SecureRandom::shuffle(&mut remotes);
        }

        Ok(Self {
            remotes,
            index: 0,
            cycle_generation: 0,
            override_hook: None,
        })
    }

    /// Install the per-attempt override hook.
    pub fn set_override_hook(&mut self, hook: Box<dyn RemoteOverrideHook>) {
        self.override_hook = Some(hook);
    }

    /// Candidate count.
    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    /// Whether the list is empty (never true after construction).
    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Candidate the cursor points at, without advancing.
    pub fn current(&self) -> &Remote {
        &self.remotes[self.index]
    }

    /// All candidates in cycle order.
    pub fn iter(&self) -> impl Iterator<Item = &Remote> {
        self.remotes.iter()
    }

    /// How many times the cursor has wrapped.
    pub fn cycle_generation(&self) -> u64 {
        self.cycle_generation
    }

    /// Next candidate for a connection attempt, advancing the cursor. The
    /// override hook, when installed, gets one synchronous call and its
    /// result replaces the list candidate.
    pub fn next(&mut self) -> Result<Remote> {
        let candidate = self.remotes[self.index].clone();
        self.index += 1;
        if self.index >= self.remotes.len() {
            self.index = 0;
            self.cycle_generation += 1;
        }

        if let Some(hook) = &self.override_hook {
            match hook.next_remote(&candidate) {
                Ok(remote) => return Ok(remote),
                Err(e) => {
                    return Err(Error::Remote(format!(
                        "remote override hook failed: {}",
                        utf8_printable(&e, 256)
                    )))
                }
            }
        }
        Ok(candidate)
    }

    /// Merge a pushed option set. When it carries `remote` entries the list
    /// is replaced and the cursor reset; returns whether that happened.
    pub fn process_push(&mut self, pushed: &OptionList) -> Result<bool> {
        if pushed.find_all("remote").is_empty() {
            return Ok(false);
        }
        let replacement = RemoteList::from_options(pushed, None, None)?;
        self.remotes = replacement.remotes;
        self.index = 0;
        self.cycle_generation += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(text: &str) -> OptionList {
        OptionList::parse(text).unwrap()
    }

    #[test]
    fn test_single_remote() {
        let mut list =
            RemoteList::from_options(&opts("remote vpn.example.com 1194 udp\n"), None, None)
                .unwrap();
        assert_eq!(list.len(), 1);
        let r = list.next().unwrap();
        assert_eq!(r.host, "vpn.example.com");
        assert_eq!(r.port, 1194);
        assert_eq!(r.protocol, Protocol::Udp);
        assert!(r.resolved.is_none());
    }

    #[test]
    fn test_literal_ip_preresolves() {
        let list = RemoteList::from_options(&opts("remote 192.0.2.1 443 tcp\n"), None, None)
            .unwrap();
        let r = list.current();
        assert_eq!(
            r.resolved,
            Some("192.0.2.1:443".parse().unwrap())
        );
    }

    #[test]
    fn test_cycling_and_generation() {
        let mut list = RemoteList::from_options(
            &opts("remote a.example.com 1194 udp\nremote b.example.com 443 tcp\n"),
            None,
            None,
        )
        .unwrap();
        assert_eq!(list.cycle_generation(), 0);
        assert_eq!(list.next().unwrap().host, "a.example.com");
        assert_eq!(list.next().unwrap().host, "b.example.com");
        assert_eq!(list.cycle_generation(), 1);
        assert_eq!(list.next().unwrap().host, "a.example.com");
    }

    #[test]
    fn test_adaptive_expands() {
        let list =
            RemoteList::from_options(&opts("remote x.example.com 1194 adaptive\n"), None, None)
                .unwrap();
        let protos: Vec<_> = list.iter().map(|r| r.protocol).collect();
        assert_eq!(protos, vec![Protocol::Udp, Protocol::Tcp]);
    }

    #[test]
    fn test_proto_override() {
        let list = RemoteList::from_options(
            &opts("remote x.example.com 1194 udp\n"),
            Some(Protocol::Tcp),
            None,
        )
        .unwrap();
        assert_eq!(list.current().protocol, Protocol::Tcp);
    }

    #[test]
    fn test_proxy_reroutes_tcp() {
        let list = RemoteList::from_options(
            &opts("remote x.example.com 443 tcp\nhttp-proxy proxy.local 8080\n"),
            None,
            None,
        )
        .unwrap();
        assert_eq!(list.current().protocol, Protocol::TcpViaHttp);
    }

    #[test]
    fn test_ip_version_suffix() {
        let list =
            RemoteList::from_options(&opts("remote x.example.com 1194 udp6\n"), None, None)
                .unwrap();
        assert_eq!(list.current().ip_version, IpVersion::V6);
    }

    #[test]
    fn test_bad_inputs() {
        assert!(RemoteList::from_options(&opts("client\n"), None, None).is_err());
        assert!(
            RemoteList::from_options(&opts("remote host 0 udp\n"), None, None).is_err()
        );
        assert!(RemoteList::from_options(
            &opts("remote bad_host!! 1194 udp\n"),
            None,
            None
        )
        .is_err());
        assert!(
            RemoteList::from_options(&opts("remote h 1194 sctp\n"), None, None).is_err()
        );
    }

    struct FixedHook;
    impl RemoteOverrideHook for FixedHook {
        fn next_remote(&self, _current: &Remote) -> std::result::Result<Remote, String> {
            Remote::new("10.0.0.9", 4000, Protocol::Udp, IpVersion::V4)
                .map_err(|e| e.to_string())
        }
    }

    struct FailingHook;
    impl RemoteOverrideHook for FailingHook {
        fn next_remote(&self, _current: &Remote) -> std::result::Result<Remote, String> {
            Err("no remote available".into())
        }
    }

    #[test]
    fn test_override_hook() {
        let mut list =
            RemoteList::from_options(&opts("remote a.example.com 1194 udp\n"), None, None)
                .unwrap();
        list.set_override_hook(Box::new(FixedHook));
        let r = list.next().unwrap();
        assert_eq!(r.host, "10.0.0.9");
        assert_eq!(r.port, 4000);

        list.set_override_hook(Box::new(FailingHook));
        assert!(list.next().is_err());
    }

    #[test]
    fn test_process_push_replaces() {
        let mut list =
            RemoteList::from_options(&opts("remote a.example.com 1194 udp\n"), None, None)
                .unwrap();
        let pushed = OptionList::parse_pushed("remote b.example.com 443 tcp").unwrap();
        assert!(list.process_push(&pushed).unwrap());
        assert_eq!(list.len(), 1);
        assert_eq!(list.current().host, "b.example.com");

        let no_remotes = OptionList::parse_pushed("ping 8").unwrap();
        assert!(!list.process_push(&no_remotes).unwrap());
    }

    #[test]
    fn test_remote_random_keeps_all_candidates() {
        let text = "remote a.example.com 1\nremote b.example.com 2\nremote c.example.com 3\nremote-random\n";
        let list = RemoteList::from_options(&opts(text), None, None).unwrap();
        let mut hosts: Vec<_> = list.iter().map(|r| r.host.clone()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["a.example.com", "b.example.com", "c.example.com"]);
    }
}
