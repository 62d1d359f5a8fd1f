use crate::config::UpstreamProxyConfig;
use crate::error::ProxyError;
use base64::{Engine as _, engine::general_purpose};
use log::info;
use percent_encoding::percent_decode_str;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    fn from_url_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks5" | "socks5h" | "socks" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks5 => 1080,
        }
    }

    /// HTTP(S) proxies speak CONNECT and absolute-form requests themselves.
    pub fn is_native(self) -> bool {
        matches!(self, ProxyScheme::Http | ProxyScheme::Https)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    /// Value for a `Proxy-Authorization` header.
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()))
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamProxySpec {
    pub url: Url,
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl UpstreamProxySpec {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ProxyError::Config(format!("Invalid upstream proxy URL {}: {}", raw, e)))?;

        let scheme = ProxyScheme::from_url_scheme(url.scheme()).ok_or_else(|| {
            ProxyError::Config(format!("Unsupported upstream proxy scheme: {}", url.scheme()))
        })?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("Upstream proxy URL has no host: {}", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or_else(|| scheme.default_port());

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(ProxyCredentials {
                username: decode_userinfo(url.username()),
                password: url.password().map(decode_userinfo).unwrap_or_default(),
            })
        };

        Ok(Self {
            url,
            scheme,
            host,
            port,
            credentials,
        })
    }

    /// `host:port` with IPv6 hosts bracketed.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(ProxyCredentials::basic_auth)
    }
}

fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// How outbound connections reach their destination.
#[derive(Debug, Clone)]
pub enum ConnectorStrategy {
    Direct,
    /// HTTP(S) proxy: CONNECT for tunnels and TLS origins, absolute-form for plain HTTP.
    NativeProxy(UpstreamProxySpec),
    /// SOCKS5 proxy: dial the proxy, then ask it to connect onward.
    ProxyDial(UpstreamProxySpec),
}

impl ConnectorStrategy {
    pub fn upstream(&self) -> Option<&UpstreamProxySpec> {
        match self {
            ConnectorStrategy::Direct => None,
            ConnectorStrategy::NativeProxy(spec) | ConnectorStrategy::ProxyDial(spec) => Some(spec),
        }
    }
}

impl fmt::Display for ConnectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorStrategy::Direct => write!(f, "direct"),
            ConnectorStrategy::NativeProxy(spec) => write!(f, "native proxy {}", spec.host_port()),
            ConnectorStrategy::ProxyDial(spec) => write!(f, "socks5 proxy {}", spec.host_port()),
        }
    }
}

pub struct UpstreamRouter;

impl UpstreamRouter {
    pub fn route(config: &UpstreamProxyConfig) -> Result<ConnectorStrategy, ProxyError> {
        if !config.enabled {
            return Ok(ConnectorStrategy::Direct);
        }
        if config.url.trim().is_empty() {
            return Err(ProxyError::Config("Upstream proxy enabled without a URL".to_string()));
        }

        let spec = UpstreamProxySpec::parse(&config.url)?;
        let strategy = if spec.scheme.is_native() {
            ConnectorStrategy::NativeProxy(spec)
        } else {
            ConnectorStrategy::ProxyDial(spec)
        };
        info!("Outbound connections use {}", strategy);
        Ok(strategy)
    }
}
