//! Process-wide log sinks.
//!
//! With a log directory configured, every record at or above a threshold is
//! appended to that threshold's file (`debug.log`, `info.log`, `warning.log`,
//! `error.log`), so `error.log` is a short list of what went wrong and
//! `debug.log` is the full story. A console layer on stderr always runs; its
//! filter comes from `CMDJOB_LOG` when set, else from the configured level.
use crate::config::LoggingConfig;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

/// Environment variable overriding the console filter (`EnvFilter` syntax).
pub const LOG_ENV: &str = "CMDJOB_LOG";

const LEVEL_FILES: [(&str, LevelFilter); 4] = [
    ("debug.log", LevelFilter::DEBUG),
    ("info.log", LevelFilter::INFO),
    ("warning.log", LevelFilter::WARN),
    ("error.log", LevelFilter::ERROR),
];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug)]
pub enum LoggingError {
    /// `console_level` is not a level name.
    Level { value: String },
    /// The log directory or one of its files could not be opened.
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A global subscriber was already installed.
    Init {
        source: tracing_subscriber::util::TryInitError,
    },
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::Level { value } => write!(f, "unknown log level {value:?}"),
            LoggingError::File { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            LoggingError::Init { source } => write!(f, "failed to install logger: {source}"),
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::Level { .. } => None,
            LoggingError::File { source, .. } => Some(source),
            LoggingError::Init { source } => Some(source),
        }
    }
}

/// Install the global subscriber described by `config`. Call once, early.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    build_subscriber(config)?
        .try_init()
        .map_err(|source| LoggingError::Init { source })
}

/// The subscriber [`init_logging`] would install, for scoped use.
pub fn build_subscriber(
    config: &LoggingConfig,
) -> Result<impl tracing::Subscriber + Send + Sync, LoggingError> {
    let console_level =
        LevelFilter::from_str(&config.console_level).map_err(|_| LoggingError::Level {
            value: config.console_level.clone(),
        })?;
    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = vec![fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter)
        .boxed()];

    if let Some(dir) = &config.dir {
        fs::create_dir_all(dir).map_err(|e| LoggingError::File {
            path: dir.clone(),
            source: e,
        })?;
        for (name, level) in LEVEL_FILES {
            let path = dir.join(name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| LoggingError::File { path, source: e })?;
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(Mutex::new(file))
                    .with_filter(level)
                    .boxed(),
            );
        }
    }

    Ok(tracing_subscriber::registry().with(layers))
}
