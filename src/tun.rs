//! Platform tun seam.
//!
//! The platform network adapter is a collaborator owned by the host; the
//! core builds a [`TunSettings`] out of the server's pushed options and
//! drives the adapter through the [`TunDevice`] capability. `NullTun` is the
//! teardown/no-op variant; `ChannelTun` backs hosts and tests that pump
//! packets themselves.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::options::OptionList;

/// Default interface MTU when nothing is pushed or configured.
pub const DEFAULT_MTU: u16 = 1500;

/// One IPv4 route pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: String,
    pub netmask: String,
    pub gateway: Option<String>,
}

/// Everything needed to build the platform interface.
#[derive(Debug, Clone, Default)]
pub struct TunSettings {
    pub ip4: Option<String>,
    pub netmask4: Option<String>,
    pub ip6: Option<String>,
    pub gw4: Option<String>,
    pub gw6: Option<String>,
    pub mtu: u16,
    pub dns: Vec<String>,
    pub routes: Vec<RouteEntry>,
    pub routes6: Vec<String>,
    pub redirect_gateway: bool,
    /// `redirect-gateway local`: the server is on the local net, so the
    /// control socket needs no protection.
    pub redirect_gateway_local: bool,
}

impl TunSettings {
    /// Build settings from the pushed overlay, falling back to the base
    /// profile for MTU.
    pub fn from_push(pushed: &OptionList, base: &OptionList) -> Result<Self> {
        let mut settings = TunSettings {
            mtu: DEFAULT_MTU,
            ..TunSettings::default()
        };

        if let Some(opt) = pushed.find("ifconfig") {
            settings.ip4 = opt.arg(0).map(str::to_string);
            settings.netmask4 = opt.arg(1).map(str::to_string);
        }
        if let Some(opt) = pushed.find("ifconfig-ipv6") {
            settings.ip6 = opt.arg(0).map(str::to_string);
            settings.gw6 = opt.arg(1).map(str::to_string);
        }
        if let Some(gw) = pushed.get_optional("route-gateway", 0, 64) {
            settings.gw4 = Some(gw);
        }

        for opt in pushed.find_all("route") {
            let network = opt
                .arg(0)
                .ok_or_else(|| Error::options("route: missing network"))?
                .to_string();
            settings.routes.push(RouteEntry {
                network,
                netmask: opt.arg(1).unwrap_or("255.255.255.255").to_string(),
                gateway: opt.arg(2).map(str::to_string),
            });
        }
        for opt in pushed.find_all("route-ipv6") {
            if let Some(net) = opt.arg(0) {
                settings.routes6.push(net.to_string());
            }
        }

        for opt in pushed.find_all("dhcp-option") {
            if opt.arg(0) == Some("DNS") || opt.arg(0) == Some("DNS6") {
                if let Some(addr) = opt.arg(1) {
                    settings.dns.push(addr.to_string());
                }
            }
        }

        if let Some(opt) = pushed.find("redirect-gateway") {
            settings.redirect_gateway = true;
            settings.redirect_gateway_local =
                opt.tokens()[1..].iter().any(|flag| flag == "local");
        } else if let Some(opt) = base.find("redirect-gateway") {
            settings.redirect_gateway = true;
            settings.redirect_gateway_local =
                opt.tokens()[1..].iter().any(|flag| flag == "local");
        }

        let mtu = pushed.get_num("tun-mtu", 0, 0u16, 576, 9000)?;
        settings.mtu = if mtu != 0 {
            mtu
        } else {
            base.get_num("tun-mtu", 0, DEFAULT_MTU, 576, 9000)?
        };

        Ok(settings)
    }
}

/// The platform adapter capability.
pub trait TunDevice: Send {
    /// Create the interface; returns its name.
    fn establish(&mut self, settings: &TunSettings) -> Result<String>;

    /// Write one IP packet toward the platform stack.
    fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// One IP packet from the platform stack, when available.
    fn try_recv(&mut self) -> Option<Vec<u8>>;

    /// Tear the interface down.
    fn close(&mut self) {}
}

/// No-op adapter installed at teardown.
pub struct NullTun;

impl TunDevice for NullTun {
    fn establish(&mut self, _settings: &TunSettings) -> Result<String> {
        Ok("null".into())
    }

    fn send(&mut self, _packet: &[u8]) -> Result<()> {
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Default)]
struct ChannelTunShared {
    to_host: VecDeque<Vec<u8>>,
    from_host: VecDeque<Vec<u8>>,
    name: Option<String>,
}

/// Queue-backed adapter: the host (or a test) pumps packets through the
/// paired [`TunPump`].
pub struct ChannelTun {
    shared: Arc<Mutex<ChannelTunShared>>,
    name: String,
}

/// Host-side handle of a [`ChannelTun`].
#[derive(Clone)]
pub struct TunPump {
    shared: Arc<Mutex<ChannelTunShared>>,
}

impl ChannelTun {
    /// Build an adapter and its host-side pump.
    pub fn new(name: &str) -> (Self, TunPump) {
        let shared = Arc::new(Mutex::new(ChannelTunShared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
                name: name.to_string(),
            },
            TunPump { shared },
        )
    }
}

impl TunDevice for ChannelTun {
    fn establish(&mut self, _settings: &TunSettings) -> Result<String> {
        self.shared.lock().name = Some(self.name.clone());
        Ok(self.name.clone())
    }

    fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.shared.lock().to_host.push_back(packet.to_vec());
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.shared.lock().from_host.pop_front()
    }

    fn close(&mut self) {
        self.shared.lock().name = None;
    }
}

impl TunPump {
    /// Queue a packet as if the platform stack emitted it.
    pub fn inject(&self, packet: Vec<u8>) {
        self.shared.lock().from_host.push_back(packet);
    }

    /// Take one packet the session wrote to the interface.
    pub fn outbound(&self) -> Option<Vec<u8>> {
        self.shared.lock().to_host.pop_front()
    }

    /// Whether the interface is currently established.
    pub fn is_up(&self) -> bool {
        self.shared.lock().name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pushed(text: &str) -> OptionList {
        OptionList::parse_pushed(text).unwrap()
    }

    #[test]
    fn test_settings_from_push() {
        let push = pushed(
            "ifconfig 10.8.0.2 255.255.255.0,route-gateway 10.8.0.1,route 192.168.1.0 255.255.255.0,dhcp-option DNS 8.8.8.8,tun-mtu 1400,redirect-gateway def1",
        );
        let base = OptionList::parse("client\n").unwrap();
        let settings = TunSettings::from_push(&push, &base).unwrap();

        assert_eq!(settings.ip4.as_deref(), Some("10.8.0.2"));
        assert_eq!(settings.netmask4.as_deref(), Some("255.255.255.0"));
        assert_eq!(settings.gw4.as_deref(), Some("10.8.0.1"));
        assert_eq!(settings.mtu, 1400);
        assert_eq!(settings.dns, vec!["8.8.8.8"]);
        assert_eq!(settings.routes.len(), 1);
        assert!(settings.redirect_gateway);
        assert!(!settings.redirect_gateway_local);
    }

    #[test]
    fn test_settings_ipv6_and_local_flag() {
        let push = pushed("ifconfig-ipv6 fd00::2/64 fd00::1,redirect-gateway local def1");
        let base = OptionList::parse("client\n").unwrap();
        let settings = TunSettings::from_push(&push, &base).unwrap();
        assert_eq!(settings.ip6.as_deref(), Some("fd00::2/64"));
        assert_eq!(settings.gw6.as_deref(), Some("fd00::1"));
        assert!(settings.redirect_gateway_local);
    }

    #[test]
    fn test_mtu_fallback_to_base() {
        let push = pushed("ifconfig 10.8.0.2 255.255.255.0");
        let base = OptionList::parse("tun-mtu 1380\n").unwrap();
        let settings = TunSettings::from_push(&push, &base).unwrap();
        assert_eq!(settings.mtu, 1380);

        let base = OptionList::parse("client\n").unwrap();
        let settings = TunSettings::from_push(&push, &base).unwrap();
        assert_eq!(settings.mtu, DEFAULT_MTU);
    }

    #[test]
    fn test_channel_tun_round_trip() {
        let (mut tun, pump) = ChannelTun::new("tun0");
        assert!(!pump.is_up());
        let name = tun.establish(&TunSettings::default()).unwrap();
        assert_eq!(name, "tun0");
        assert!(pump.is_up());

        tun.send(b"packet out").unwrap();
        assert_eq!(pump.outbound().unwrap(), b"packet out");

        pump.inject(b"packet in".to_vec());
        assert_eq!(tun.try_recv().unwrap(), b"packet in");
        assert!(tun.try_recv().is_none());

        tun.close();
        assert!(!pump.is_up());
    }
}
