use crate::watched::HeartbeatPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from cmdjob.toml.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct RunnerConfig {
    pub job: JobConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub timeout_secs: Option<u64>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub heartbeat: HeartbeatPolicy,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct WatchdogConfig {
    /// Cancel the command after this long without output. Unset disables
    /// the watchdog.
    pub stale_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for per-level log files. Console only when unset.
    pub dir: Option<PathBuf>,
    pub console_level: String,
}

impl JobConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl WatchdogConfig {
    pub fn stale_timeout(&self) -> Option<Duration> {
        self.stale_timeout_secs.map(Duration::from_secs)
    }
}

/// Errors that can occur while loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`RunnerConfig`].
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<RunnerConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(RunnerConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

// --- Default implementations ---

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            capture_stdout: true,
            capture_stderr: true,
            heartbeat: HeartbeatPolicy::Always,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            console_level: "info".to_string(),
        }
    }
}
