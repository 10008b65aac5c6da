//! Destination keys.
//!
//! A [`DestinationKey`] names a pool of interchangeable connections: the
//! origin, how it is reached (proxy, TLS) and the isolation context. Its
//! canonical [`hash_key`](DestinationKey::hash_key) is what the manager
//! indexes entries by.

use crate::socket::proxy::{ProxySettings, ProxyType};
use std::net::IpAddr;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    host: String,
    port: u16,
    end_to_end_ssl: bool,
    proxy: Option<ProxySettings>,
    anonymous: bool,
    private: bool,
    be_conservative: bool,
    isolation: String,
    hash_key: String,
}

impl DestinationKey {
    pub fn new(host: impl Into<String>, port: u16, end_to_end_ssl: bool) -> Self {
        let mut key = Self {
            host: host.into(),
            port,
            end_to_end_ssl,
            proxy: None,
            anonymous: false,
            private: false,
            be_conservative: false,
            isolation: String::new(),
            hash_key: String::new(),
        };
        key.rebuild_hash_key();
        key
    }

    /// Build a key from a request URL. Returns `None` without a host or port.
    pub fn from_url(url: &Url, proxy: Option<ProxySettings>) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        let ssl = matches!(url.scheme(), "https" | "wss");
        Some(Self::new(host, port, ssl).with_proxy(proxy))
    }

    pub fn with_proxy(mut self, proxy: Option<ProxySettings>) -> Self {
        self.proxy = proxy;
        self.rebuild_hash_key();
        self
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self.rebuild_hash_key();
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self.rebuild_hash_key();
        self
    }

    pub fn with_be_conservative(mut self, be_conservative: bool) -> Self {
        self.be_conservative = be_conservative;
        self.rebuild_hash_key();
        self
    }

    /// Isolation context (e.g. a top-level site); connections never cross it.
    pub fn with_isolation(mut self, isolation: impl Into<String>) -> Self {
        self.isolation = isolation.into();
        self.rebuild_hash_key();
        self
    }

    // Layout: five flag bytes, then host:port, then the proxy for tunnels and
    // transparent proxies, then the isolation suffix.
    //   [0] P/T/.  plaintext or TLS http proxy
    //   [1] S/.    end-to-end TLS
    //   [2] A/.    anonymous
    //   [3] P/.    private
    //   [4] C/.    be conservative
    fn rebuild_hash_key(&mut self) {
        let mut flags = [b'.'; 5];
        if self.using_https_proxy() {
            flags[0] = b'T';
        } else if self.using_http_proxy() {
            flags[0] = b'P';
        }
        if self.end_to_end_ssl {
            flags[1] = b'S';
        }
        if self.anonymous {
            flags[2] = b'A';
        }
        if self.private {
            flags[3] = b'P';
        }
        if self.be_conservative {
            flags[4] = b'C';
        }

        let mut key: String = flags.iter().map(|b| *b as char).collect();
        match &self.proxy {
            Some(proxy) if self.using_http_proxy() && !self.using_connect() => {
                let (host, port) = proxy.host_port();
                key.push_str(&format!("{host}:{port}"));
            }
            _ => key.push_str(&format!("{}:{}", self.host, self.port)),
        }
        if let Some(proxy) = &self.proxy {
            if !self.using_http_proxy() || self.using_connect() {
                let (host, port) = proxy.host_port();
                key.push_str(&format!(" ({}:{host}:{port})", proxy.proxy_type().as_str()));
            }
        }
        if !self.isolation.is_empty() {
            key.push_str(&format!("[{}]", self.isolation));
        }
        self.hash_key = key;
    }

    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn end_to_end_ssl(&self) -> bool {
        self.end_to_end_ssl
    }

    pub fn proxy(&self) -> Option<&ProxySettings> {
        self.proxy.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn be_conservative(&self) -> bool {
        self.be_conservative
    }

    pub fn isolation(&self) -> &str {
        &self.isolation
    }

    pub fn using_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    /// HTTP or HTTPS proxy (anything that speaks HTTP to us).
    pub fn using_http_proxy(&self) -> bool {
        matches!(self.proxy.as_ref().map(|p| p.proxy_type()), Some(ProxyType::Http | ProxyType::Https))
    }

    pub fn using_https_proxy(&self) -> bool {
        matches!(self.proxy.as_ref().map(|p| p.proxy_type()), Some(ProxyType::Https))
    }

    /// TLS to the origin through an HTTP proxy needs a CONNECT tunnel.
    pub fn using_connect(&self) -> bool {
        self.using_http_proxy() && self.end_to_end_ssl
    }

    /// Whether the first hop (origin or proxy) is TLS.
    pub fn first_hop_ssl(&self) -> bool {
        self.end_to_end_ssl || self.using_https_proxy()
    }

    /// Key of the entry that holds multiplexed sessions to an HTTPS proxy.
    ///
    /// Only meaningful for HTTPS proxies; returns `None` otherwise.
    pub fn wildcard(&self) -> Option<DestinationKey> {
        if !self.using_https_proxy() {
            return None;
        }
        let mut key = DestinationKey::new("*", 0, true)
            .with_anonymous(self.anonymous)
            .with_private(self.private)
            .with_isolation(self.isolation.clone());
        key.proxy = self.proxy.clone();
        key.rebuild_hash_key();
        Some(key)
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == "*" && self.port == 0
    }

    /// Private-network address literal (RFC 1918, link-local, IPv6 ULA).
    pub fn is_local_ip_literal(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_link_local(),
            Ok(IpAddr::V6(v6)) => {
                let first = v6.segments()[0];
                (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
            }
            Err(_) => false,
        }
    }
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hash_key)
    }
}
