//! Configuration data model and loader.
//!
//! `AllProxiesConfig` is what a surrounding service (or the `tproxyd`
//! binary) hands to the `Manager`. YAML is the primary on-disk format; JSON
//! is accepted too, the same dual-format trick the teacher's
//! `app::config::from_str` uses to sniff the leading byte.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scope::ScopeId;

/// Parses `txt` as YAML, falling back to JSON when it looks like a JSON
/// document (leading `{`). Mirrors the teacher's format-sniffing `from_str`.
pub fn from_str(txt: &str) -> Result<AllProxiesConfig> {
    let trimmed = txt.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| Error::config(e.to_string()))
    } else {
        serde_yaml::from_str(trimmed).map_err(|e| Error::config(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllProxiesConfig {
    #[serde(rename = "AllProxies")]
    pub all_proxies: HashMap<ScopeId, ScopeProxies>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct ScopeProxies {
    #[serde(default)]
    pub proxies: HashMap<ProtocolTag, Vec<Proxy>>,
    #[serde(default)]
    pub proxy_program: Vec<String>,
    #[serde(default)]
    pub white_list: Vec<String>,
    pub t_port: u16,
    /// `rename_all = "PascalCase"` would yield `DnsPort`; the wire format
    /// keeps the acronym capitalized as `DNSPort`.
    #[serde(default, rename = "DNSPort")]
    pub dns_port: u16,
    #[serde(default, rename = "FakeIPRange")]
    pub fake_ip_range: Option<String>,
    /// Which proxy in `proxies[selected_protocol]` is currently active.
    #[serde(default)]
    pub selected_protocol: Option<ProtocolTag>,
    #[serde(default)]
    pub selected_name: Option<String>,
}

impl ScopeProxies {
    pub fn fake_ip_net(&self) -> Result<Option<IpNet>> {
        match &self.fake_ip_range {
            None => Ok(None),
            Some(s) => s
                .parse::<IpNet>()
                .map(Some)
                .map_err(|e| Error::config(format!("invalid FakeIPRange {s:?}: {e}"))),
        }
    }

    pub fn selected_proxy(&self) -> Option<&Proxy> {
        let proto = self.selected_protocol.as_ref()?;
        let name = self.selected_name.as_ref()?;
        self.proxies
            .get(proto)
            .and_then(|list| list.iter().find(|p| &p.name == name))
    }

    pub fn is_whitelisted(&self, exec_path: &str) -> bool {
        self.white_list.iter().any(|p| p == exec_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolTag {
    Http,
    Sock4,
    #[serde(rename = "sock5-tcp")]
    Sock5Tcp,
    #[serde(rename = "sock5-udp")]
    Sock5Udp,
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Http => "http",
            ProtocolTag::Sock4 => "sock4",
            ProtocolTag::Sock5Tcp => "sock5-tcp",
            ProtocolTag::Sock5Udp => "sock5-udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct Proxy {
    pub name: String,
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Require strict RFC 1929 status byte (`0x00`) rather than the lenient
    /// `0x00`-or-`0x05` check the original server tolerated. See DESIGN.md.
    #[serde(default)]
    pub strict_socks5_auth: bool,
}

impl Proxy {
    pub fn server_addr(&self) -> Result<IpAddr> {
        self.server
            .parse()
            .map_err(|_| Error::config(format!("proxy server {:?} is not a literal IP address; DNS resolution is out of core scope", self.server)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_yaml() {
        let yaml = "
AllProxies:
  Main:
    Proxies:
      sock5-tcp:
        - Name: default
          Server: 127.0.0.1
          Port: 1080
    ProxyProgram:
      - /usr/bin/curl
    TPort: 8900
    DNSPort: 8901
    FakeIPRange: 198.18.0.0/16
";
        let cfg = from_str(yaml).unwrap();
        let main = cfg.all_proxies.get(&ScopeId::Main).unwrap();
        assert_eq!(main.t_port, 8900);
        assert_eq!(main.dns_port, 8901);
        assert_eq!(main.proxy_program, vec!["/usr/bin/curl".to_string()]);
        let proxies = main.proxies.get(&ProtocolTag::Sock5Tcp).unwrap();
        assert_eq!(proxies[0].port, 1080);
    }

    #[test]
    fn parse_simple_json() {
        let json = r#"{"AllProxies":{"App":{"Proxies":{},"ProxyProgram":[],"WhiteList":[],"TPort":9000,"DNSPort":0}}}"#;
        let cfg = from_str(json).unwrap();
        let app = cfg.all_proxies.get(&ScopeId::App).unwrap();
        assert_eq!(app.t_port, 9000);
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = "
AllProxies:
  Main:
    TPort: 1
    Bogus: true
";
        assert!(from_str(yaml).is_err());
    }

    #[test]
    fn round_trips_through_yaml() {
        let mut proxies = HashMap::new();
        proxies.insert(
            ProtocolTag::Http,
            vec![Proxy {
                name: "p1".into(),
                server: "10.0.0.1".into(),
                port: 3128,
                r#type: None,
                user_name: Some("u".into()),
                password: None,
                strict_socks5_auth: false,
            }],
        );
        let sp = ScopeProxies {
            proxies,
            proxy_program: vec!["/bin/app".into()],
            white_list: vec![],
            t_port: 7000,
            dns_port: 0,
            fake_ip_range: Some("198.18.0.0/16".into()),
            selected_protocol: Some(ProtocolTag::Http),
            selected_name: Some("p1".into()),
        };
        let mut all = HashMap::new();
        all.insert(ScopeId::App, sp);
        let cfg = AllProxiesConfig { all_proxies: all };

        let text = serde_yaml::to_string(&cfg).unwrap();
        let back = from_str(&text).unwrap();
        let app = back.all_proxies.get(&ScopeId::App).unwrap();
        assert_eq!(app.t_port, 7000);
        assert_eq!(app.selected_proxy().unwrap().server, "10.0.0.1");
    }
}
