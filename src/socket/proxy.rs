use url::Url;

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    /// HTTP proxy (CONNECT for HTTPS)
    Http,
    /// HTTPS proxy (TLS to proxy)
    Https,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks5 => "socks",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ProxyType::Http => 80,
            ProxyType::Https => 443,
            ProxyType::Socks5 => 1080,
        }
    }
}

/// The proxy hop in front of a destination.
///
/// Two destinations share connections only if their proxies compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxySettings {
    proxy_type: ProxyType,
    host: String,
    port: u16,
}

impl ProxySettings {
    /// Create proxy settings from URL string.
    pub fn new(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str).ok()?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        let proxy_type = match url.scheme() {
            "https" => ProxyType::Https,
            "socks5" | "socks5h" | "socks4" | "socks4a" => ProxyType::Socks5, // Treat as SOCKS
            "http" => ProxyType::Http,
            _ => return None,
        };
        let host = url.host_str()?.to_string();
        let port = url.port().unwrap_or(proxy_type.default_port());
        Some(Self { proxy_type, host, port })
    }

    pub fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    /// Get proxy host and port.
    pub fn host_port(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_type_from_scheme() {
        assert_eq!(ProxySettings::new("http://proxy:8080").unwrap().proxy_type(), ProxyType::Http);
        assert_eq!(ProxySettings::new("https://proxy").unwrap().proxy_type(), ProxyType::Https);
        assert_eq!(ProxySettings::new("socks5h://proxy").unwrap().proxy_type(), ProxyType::Socks5);
        assert!(ProxySettings::new("ftp://proxy").is_none());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(ProxySettings::new("http://p").unwrap().host_port(), ("p", 80));
        assert_eq!(ProxySettings::new("https://p").unwrap().host_port(), ("p", 443));
        assert_eq!(ProxySettings::new("socks5://p").unwrap().host_port(), ("p", 1080));
        assert_eq!(ProxySettings::new("http://p:3128").unwrap().host_port(), ("p", 3128));
    }
}
