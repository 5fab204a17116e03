//! Logging setup: console, operational file and security file sinks
//!
//! Security events are emitted with `target: SECURITY` so operators can alert
//! on that file alone. Everything else goes to the operational log.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::filter::{self, EnvFilter, FilterExt, LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::LoggingConfig;

/// Target for the security stream (admission rejections, signature hits, startup failures)
pub const SECURITY: &str = "security";

/// Shared handle to an append-only log file
#[derive(Clone)]
struct LogFile(Arc<Mutex<LineWriter<File>>>);

impl LogFile {
    fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create log directory {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot open log file {}", path))?;
        Ok(Self(Arc::new(Mutex::new(LineWriter::new(file)))))
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?
            .flush()
    }
}

/// Flushes the file sinks when dropped. Hold it until shutdown.
pub struct LogGuard {
    files: Vec<LogFile>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        for file in &mut self.files {
            let _ = file.flush();
        }
    }
}

/// Initialize logging once, before the reactor starts.
///
/// `RUST_LOG` overrides `logging.level`. Set `LOG_FORMAT=gcp` for structured
/// GCP Cloud Logging on the console.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let operational = LogFile::open(&config.operational_log)?;
    let security = LogFile::open(&config.security_log)?;

    let gcp = std::env::var("LOG_FORMAT").unwrap_or_default() == "gcp";
    let console = if gcp {
        tracing_stackdriver::layer()
            .with_filter(level_filter(config)?)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(level_filter(config)?)
            .boxed()
    };

    let operational_writer = operational.clone();
    let operational_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(move || operational_writer.clone())
        .with_filter(level_filter(config)?.and(filter::filter_fn(|meta| meta.target() != SECURITY)));

    // The security sink ignores the configured level: warnings always reach it
    let security_writer = security.clone();
    let security_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(move || security_writer.clone())
        .with_filter(Targets::new().with_target(SECURITY, LevelFilter::WARN));

    tracing_subscriber::registry()
        .with(console)
        .with(operational_layer)
        .with(security_layer)
        .try_init()
        .context("Logging already initialized")?;

    Ok(LogGuard {
        files: vec![operational, security],
    })
}

fn level_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log filter")
}

/// Console-only logging for failures that happen before the config is known
pub fn init_fallback() {
    let _ = tracing_subscriber::fmt().with_max_level(Level::INFO).try_init();
}
