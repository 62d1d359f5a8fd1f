//! Startup validation for the direct filter configuration
//!
//! Errors are fatal: the process must not start with a configuration that
//! cannot be used. Warnings cover options that are legal but surprising,
//! most notably zero-valued numbers that silently select a built-in default.

use crate::config::{
    Config, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_DNS_CACHE_EXPIRY_SECS, DEFAULT_DNS_CACHE_SIZE,
    DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_IDLE_PER_HOST, DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_TLS_SESSION_CACHE_SIZE,
};
use crate::error::ProxyError;
use crate::upstream::UpstreamProxySpec;

const MAX_RETRY_DELAY_SECS: f64 = 60.0;
const MAX_SENSIBLE_RETRIES: u32 = 10;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }

    /// Collapse into a configuration error when any check failed.
    pub fn into_result(self) -> Result<Self, ProxyError> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(ProxyError::Config(self.errors.join("; ")))
        }
    }
}

pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_dialer(config, &mut result);
    validate_upstream_proxy(config, &mut result);
    validate_tls(config, &mut result);
    validate_transport(config, &mut result);

    if config.filter.trim().is_empty() {
        result.add_error("filter name must not be empty".to_string());
    }
    if config.listen_addr.port() == 0 {
        result.add_warning("listenAddr uses port 0; the OS will pick an ephemeral port".to_string());
    }

    result
}

fn warn_zero_default(result: &mut ValidationResult, option: &str, value: u64, default: u64, unit: &str) {
    if value == 0 {
        result.add_warning(format!("{} is 0; using default of {}{}", option, default, unit));
    }
}

fn validate_dialer(config: &Config, result: &mut ValidationResult) {
    let dialer = &config.dialer;

    warn_zero_default(result, "dialer.timeoutSeconds", dialer.timeout_seconds, DEFAULT_DIAL_TIMEOUT_SECS, "s");
    warn_zero_default(result, "dialer.keepAliveSeconds", dialer.keep_alive_seconds, DEFAULT_KEEP_ALIVE_SECS, "s");
    warn_zero_default(
        result,
        "dialer.dnsCacheExpirySeconds",
        dialer.dns_cache_expiry_seconds,
        DEFAULT_DNS_CACHE_EXPIRY_SECS,
        "s",
    );
    warn_zero_default(result, "dialer.dnsCacheSize", dialer.dns_cache_size as u64, DEFAULT_DNS_CACHE_SIZE as u64, " entries");

    if !dialer.retry_delay.is_finite() || dialer.retry_delay < 0.0 {
        result.add_error(format!(
            "dialer.retryDelay must be a non-negative number of seconds, got {}",
            dialer.retry_delay
        ));
    } else if dialer.retry_delay > MAX_RETRY_DELAY_SECS {
        result.add_error(format!(
            "dialer.retryDelay of {}s exceeds the {}s maximum",
            dialer.retry_delay, MAX_RETRY_DELAY_SECS
        ));
    }

    if dialer.retry_times > MAX_SENSIBLE_RETRIES {
        result.add_warning(format!(
            "dialer.retryTimes of {} makes a failing dial block for a long time",
            dialer.retry_times
        ));
    }
    if dialer.retry_times > 0 && dialer.retry_delay == 0.0 {
        result.add_suggestion("dialer.retryDelay of 0 retries immediately; consider a small delay such as 0.1".to_string());
    }
}

fn validate_upstream_proxy(config: &Config, result: &mut ValidationResult) {
    if !config.proxy.enabled {
        return;
    }
    if config.proxy.url.trim().is_empty() {
        result.add_error("proxy.enabled is true but proxy.url is empty".to_string());
        return;
    }
    if let Err(e) = UpstreamProxySpec::parse(&config.proxy.url) {
        result.add_error(format!("proxy.url is unusable: {}", e));
    }
}

fn validate_tls(config: &Config, result: &mut ValidationResult) {
    if config.tls.insecure_skip_verify {
        result.add_warning("tls.insecureSkipVerify disables certificate verification for every upstream".to_string());
    }
    warn_zero_default(
        result,
        "tls.sessionCacheSize",
        config.tls.session_cache_size as u64,
        DEFAULT_TLS_SESSION_CACHE_SIZE as u64,
        " sessions",
    );
}

fn validate_transport(config: &Config, result: &mut ValidationResult) {
    let transport = &config.transport;

    warn_zero_default(
        result,
        "transport.tlsHandshakeTimeoutSeconds",
        transport.tls_handshake_timeout_seconds,
        DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS,
        "s",
    );

    if transport.disable_keep_alives {
        if transport.max_idle_connections_per_host > 0 {
            result.add_suggestion(
                "transport.maxIdleConnectionsPerHost has no effect while disableKeepAlives is set".to_string(),
            );
        }
    } else {
        warn_zero_default(
            result,
            "transport.maxIdleConnectionsPerHost",
            transport.max_idle_connections_per_host as u64,
            DEFAULT_MAX_IDLE_PER_HOST as u64,
            "",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_success() {
        let result = validate_config(&Config::default());
        assert!(result.is_valid, "errors: {:?}", result.errors);
        assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    }

    #[test]
    fn test_negative_retry_delay_is_fatal() {
        let mut config = Config::default();
        config.dialer.retry_delay = -0.5;
        let result = validate_config(&config);
        assert!(!result.is_valid);
        assert!(matches!(result.into_result(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_nan_retry_delay_is_fatal() {
        let mut config = Config::default();
        config.dialer.retry_delay = f64::NAN;
        assert!(!validate_config(&config).is_valid);
    }

    #[test]
    fn test_zero_timeout_is_reported_as_default() {
        let mut config = Config::default();
        config.dialer.timeout_seconds = 0;
        let result = validate_config(&config);
        assert!(result.is_valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("dialer.timeoutSeconds is 0; using default of 30s")));
    }

    #[test]
    fn test_malformed_proxy_url_is_fatal() {
        let mut config = Config::default();
        config.proxy.enabled = true;
        config.proxy.url = "http://[::1".to_string();
        let result = validate_config(&config);
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("proxy.url is unusable"));
    }

    #[test]
    fn test_disabled_proxy_url_is_ignored() {
        let mut config = Config::default();
        config.proxy.enabled = false;
        config.proxy.url = "not a url".to_string();
        assert!(validate_config(&config).is_valid);
    }

    #[test]
    fn test_enabled_proxy_requires_url() {
        let mut config = Config::default();
        config.proxy.enabled = true;
        let result = validate_config(&config);
        assert_eq!(result.errors, vec!["proxy.enabled is true but proxy.url is empty".to_string()]);
    }
}
