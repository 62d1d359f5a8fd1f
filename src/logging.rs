use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger writing text or JSON lines to any number of stdout/file targets,
/// each with its own level threshold.
pub struct CustomLogger {
    max_level: LevelFilter,
    format: LogFormat,
    sinks: Vec<(LevelFilter, Mutex<BufWriter<Box<dyn Write + Send>>>)>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, ProxyError> {
        let max_level = config.level.unwrap_or_default().to_level_filter();
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_default();

        let mut sinks = Vec::with_capacity(targets.len());
        for target in &targets {
            sinks.push((target_level(target, max_level), Mutex::new(BufWriter::new(open_target(target)?))));
        }

        Ok(Self {
            max_level,
            format,
            sinks,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), ProxyError> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level;
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("Logger already installed: {}", e)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn format_record(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format_text(record),
            LogFormat::Json => format_json(record),
        }
    }
}

fn target_level(target: &LogTarget, fallback: LevelFilter) -> LevelFilter {
    // a target can only narrow the global level
    target
        .level
        .as_ref()
        .map(|level| level.to_level_filter().min(fallback))
        .unwrap_or(fallback)
}

fn open_target(target: &LogTarget) -> Result<Box<dyn Write + Send>, ProxyError> {
    match target.output_type {
        LogOutputType::Stdout => Ok(Box::new(std::io::stdout())),
        LogOutputType::File => {
            let path = target
                .path
                .as_ref()
                .ok_or_else(|| ProxyError::Config("File log target requires a path".to_string()))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ProxyError::Config(format!("Cannot open log file {}: {}", path.display(), e)))?;
            Ok(Box::new(file))
        }
    }
}

fn format_text(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "file": record.file().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    })
    .to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sinks.iter().any(|(level, _)| metadata.level() <= *level)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.format_record(record);
        for (level, writer) in &self.sinks {
            if record.level() > *level {
                continue;
            }
            if let Ok(mut writer) = writer.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        for (_, writer) in &self.sinks {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// env_logger setup used when no `logging` section is configured.
/// `RUST_LOG` still wins over `level`.
pub fn init_fallback(level: &LogLevel, format: &LogFormat) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));
    if let LogFormat::Json = format {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }
    builder.init();
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!("Invalid log format: {}. Must be one of: text, json", s))),
    }
}
