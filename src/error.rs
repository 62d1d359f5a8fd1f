use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DNS resolution failed for {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("Loop detected: {0} only resolves to local interface addresses")]
    LoopDetected(String),

    #[error("Dial {target} failed after {attempts} attempt(s): {source}")]
    Dial {
        target: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream proxy error: {0}")]
    Upstream(String),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProxyError {
    /// Errors raised while establishing the outbound connection.
    pub fn is_dial_error(&self) -> bool {
        matches!(
            self,
            ProxyError::Resolve { .. } | ProxyError::LoopDetected(_) | ProxyError::Dial { .. }
        )
    }

    /// Status the pipeline host writes back when a filter fails.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Uri(_) | ProxyError::Http(_) => StatusCode::BAD_REQUEST,
            ProxyError::Capability(_) | ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Dial { source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
