use anyhow::{Context, bail};
use bifrost_direct::config::{LogFormat, LogLevel};
use bifrost_direct::config_validation::validate_config;
use bifrost_direct::logging::{CustomLogger, init_fallback, parse_log_format, parse_log_level};
use bifrost_direct::{Config, DirectFilter, FilterRegistry, ProxyServer};
use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward proxy whose outbound leg dials origins directly or through an upstream proxy"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(long, value_name = "URL", help = "Upstream proxy URL (http, https or socks5)")]
    upstream: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level when no logging section is configured")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format (text or json) when no logging section is configured")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!("Configuration: {}", warning);
    }
    for suggestion in &report.suggestions {
        info!("Configuration hint: {}", suggestion);
    }
    report.into_result().context("invalid configuration")?;

    let mut registry = FilterRegistry::new();
    registry.register(Arc::new(DirectFilter::new(&config)?))?;
    let server = ProxyServer::from_registry(&config, &registry)?;

    let shutdown = CancellationToken::new();
    let mut server_handle = tokio::spawn(server.run(shutdown.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            shutdown.cancel();
            let _ = server_handle.await;
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
                Err(e) => bail!("Server task failed: {}", e),
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address {}", listen))?;
    }
    if let Some(url) = &args.upstream {
        config.proxy.enabled = true;
        config.proxy.url = url.clone();
    }
    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    if let Some(logging) = &config.logging {
        CustomLogger::init(logging.clone())?;
        return Ok(());
    }

    let level = match &args.log_level {
        Some(level) => parse_log_level(level)?,
        None => LogLevel::Info,
    };
    let format = match &args.log_format {
        Some(format) => parse_log_format(format)?,
        None => LogFormat::Text,
    };
    init_fallback(&level, &format);
    Ok(())
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = r#"{
  "listenAddr": "127.0.0.1:8080",
  "filter": "direct",
  "dialer": {
    "timeoutSeconds": 30,
    "keepAliveSeconds": 30,
    "dualStack": true,
    "retryTimes": 2,
    "retryDelay": 0.1,
    "dnsCacheExpirySeconds": 3600,
    "dnsCacheSize": 8192
  },
  "proxy": {
    "enabled": false,
    "url": "socks5://127.0.0.1:1080"
  },
  "tls": {
    "insecureSkipVerify": false,
    "sessionCacheSize": 1000
  },
  "transport": {
    "disableKeepAlives": false,
    "disableCompression": false,
    "tlsHandshakeTimeoutSeconds": 10,
    "maxIdleConnectionsPerHost": 8
  },
  "logging": {
    "level": "info",
    "format": "text",
    "targets": [{ "type": "stdout" }]
  }
}"#;

    std::fs::write(file_path, sample).with_context(|| format!("cannot write {}", file_path))?;
    Ok(())
}
