use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Values substituted when a numeric option is left at 0.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_DNS_CACHE_EXPIRY_SECS: u64 = 3600;
pub const DEFAULT_DNS_CACHE_SIZE: usize = 8192;
pub const DEFAULT_TLS_SESSION_CACHE_SIZE: usize = 1000;
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 8;

pub const DEFAULT_FILTER: &str = "direct";

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8087))
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_string()
}

fn default_true() -> bool {
    true
}

fn or_default_secs(value: u64, default: u64) -> Duration {
    Duration::from_secs(if value == 0 { default } else { value })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// Outbound dialing behaviour. Zero-valued numbers select the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialerConfig {
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_true")]
    pub dual_stack: bool,
    #[serde(default)]
    pub retry_times: u32,
    /// Delay between attempts, in seconds with fractional precision.
    #[serde(default)]
    pub retry_delay: f64,
    #[serde(default)]
    pub dns_cache_expiry_seconds: u64,
    #[serde(default)]
    pub dns_cache_size: usize,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_DIAL_TIMEOUT_SECS,
            keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECS,
            dual_stack: true,
            retry_times: 2,
            retry_delay: 0.1,
            dns_cache_expiry_seconds: DEFAULT_DNS_CACHE_EXPIRY_SECS,
            dns_cache_size: DEFAULT_DNS_CACHE_SIZE,
        }
    }
}

impl DialerConfig {
    pub fn timeout(&self) -> Duration {
        or_default_secs(self.timeout_seconds, DEFAULT_DIAL_TIMEOUT_SECS)
    }

    pub fn keep_alive(&self) -> Duration {
        or_default_secs(self.keep_alive_seconds, DEFAULT_KEEP_ALIVE_SECS)
    }

    pub fn dns_cache_expiry(&self) -> Duration {
        or_default_secs(self.dns_cache_expiry_seconds, DEFAULT_DNS_CACHE_EXPIRY_SECS)
    }

    pub fn dns_cache_capacity(&self) -> usize {
        if self.dns_cache_size == 0 {
            DEFAULT_DNS_CACHE_SIZE
        } else {
            self.dns_cache_size
        }
    }

    /// Only meaningful after validation has rejected negative or non-finite values.
    pub fn retry_delay(&self) -> Duration {
        if self.retry_delay.is_finite() && self.retry_delay > 0.0 {
            Duration::from_secs_f64(self.retry_delay)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsClientConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub session_cache_size: usize,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            session_cache_size: DEFAULT_TLS_SESSION_CACHE_SIZE,
        }
    }
}

impl TlsClientConfig {
    pub fn session_cache_capacity(&self) -> usize {
        if self.session_cache_size == 0 {
            DEFAULT_TLS_SESSION_CACHE_SIZE
        } else {
            self.session_cache_size
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub disable_keep_alives: bool,
    #[serde(default)]
    pub disable_compression: bool,
    #[serde(default)]
    pub tls_handshake_timeout_seconds: u64,
    #[serde(default)]
    pub max_idle_connections_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            disable_keep_alives: false,
            disable_compression: false,
            tls_handshake_timeout_seconds: DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS,
            max_idle_connections_per_host: DEFAULT_MAX_IDLE_PER_HOST,
        }
    }
}

impl TransportConfig {
    pub fn tls_handshake_timeout(&self) -> Duration {
        or_default_secs(self.tls_handshake_timeout_seconds, DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS)
    }

    /// Idle pool size per destination; keep-alive off means nothing is pooled.
    pub fn pool_max_idle_per_host(&self) -> usize {
        if self.disable_keep_alives {
            0
        } else if self.max_idle_connections_per_host == 0 {
            DEFAULT_MAX_IDLE_PER_HOST
        } else {
            self.max_idle_connections_per_host
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Name of the registered filter the host dispatches to.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub dialer: DialerConfig,
    #[serde(default)]
    pub proxy: UpstreamProxyConfig,
    #[serde(default)]
    pub tls: TlsClientConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            filter: default_filter(),
            dialer: DialerConfig::default(),
            proxy: UpstreamProxyConfig::default(),
            tls: TlsClientConfig::default(),
            transport: TransportConfig::default(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Cannot read {}: {}", path, e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ProxyError> {
        serde_json::from_str(content).map_err(|e| ProxyError::Config(format!("Invalid configuration: {}", e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "listenAddr": "0.0.0.0:3128",
            "dialer": {
                "timeoutSeconds": 5,
                "keepAliveSeconds": 15,
                "dualStack": false,
                "retryTimes": 3,
                "retryDelay": 0.25,
                "dnsCacheExpirySeconds": 60,
                "dnsCacheSize": 16
            },
            "proxy": { "enabled": true, "url": "socks5://127.0.0.1:1080" },
            "tls": { "insecureSkipVerify": true, "sessionCacheSize": 32 },
            "transport": {
                "disableKeepAlives": true,
                "disableCompression": true,
                "tlsHandshakeTimeoutSeconds": 4,
                "maxIdleConnectionsPerHost": 2
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3128".parse().unwrap());
        assert_eq!(config.filter, "direct");
        assert_eq!(config.dialer.timeout(), Duration::from_secs(5));
        assert!(!config.dialer.dual_stack);
        assert_eq!(config.dialer.retry_times, 3);
        assert_eq!(config.dialer.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.dialer.dns_cache_capacity(), 16);
        assert!(config.proxy.enabled);
        assert!(config.tls.insecure_skip_verify);
        assert_eq!(config.tls.session_cache_capacity(), 32);
        assert_eq!(config.transport.tls_handshake_timeout(), Duration::from_secs(4));
        // keep-alive disabled wins over the configured idle limit
        assert_eq!(config.transport.pool_max_idle_per_host(), 0);
    }

    #[test]
    fn test_zero_values_select_defaults() {
        let json = r#"{
            "dialer": { "timeoutSeconds": 0, "dnsCacheSize": 0, "dnsCacheExpirySeconds": 0 },
            "transport": { "tlsHandshakeTimeoutSeconds": 0, "maxIdleConnectionsPerHost": 0 },
            "tls": { "sessionCacheSize": 0 }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.dialer.timeout(), Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS));
        assert_eq!(config.dialer.dns_cache_capacity(), DEFAULT_DNS_CACHE_SIZE);
        assert_eq!(config.dialer.dns_cache_expiry(), Duration::from_secs(DEFAULT_DNS_CACHE_EXPIRY_SECS));
        assert_eq!(config.dialer.retry_delay(), Duration::ZERO);
        assert_eq!(config.tls.session_cache_capacity(), DEFAULT_TLS_SESSION_CACHE_SIZE);
        assert_eq!(
            config.transport.tls_handshake_timeout(),
            Duration::from_secs(DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS)
        );
        assert_eq!(config.transport.pool_max_idle_per_host(), DEFAULT_MAX_IDLE_PER_HOST);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let result = Config::from_json(r#"{ "dialer": { "retryTimes": -1 } }"#);
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("direct.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.proxy.enabled = true;
        config.proxy.url = "http://upstream:3128".to_string();
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert!(loaded.proxy.enabled);
        assert_eq!(loaded.proxy.url, "http://upstream:3128");
        assert_eq!(loaded.dialer.retry_times, 2);
    }
}
