pub mod config;
pub mod config_validation;
pub mod connector;
pub mod dialer;
pub mod direct;
pub mod dns_cache;
pub mod error;
pub mod filter;
pub mod logging;
pub mod loopback;
pub mod relay;
pub mod server;
pub mod tls;
pub mod transport;
pub mod upstream;

pub use config::Config;
pub use direct::DirectFilter;
pub use error::ProxyError;
pub use filter::{Filter, FilterRegistry};
pub use server::ProxyServer;
