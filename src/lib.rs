//! Run shell commands under supervision: non-blocking pipe pumping, a soft
//! deadline with escalating termination, optional stdin payload and output
//! tees, and a structured [`CommandResult`].
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let result = cmdjob::run("echo hello", Some(Duration::from_secs(5))).unwrap();
//! assert_eq!(result.stdout, "hello\n");
//! ```
pub mod background;
pub mod config;
pub mod job;
pub mod lifecycle;
pub mod logging;
mod pipes;
pub mod result;
pub mod watchdog;
pub mod watched;

pub use config::{load_config, ConfigError, LoggingConfig, RunnerConfig};
pub use job::{run, CommandJob, CommandJobBuilder, JobError, JobState, KillHandle, StopReason};
pub use result::{CommandResult, ORCHESTRATION_FAILURE};
pub use watchdog::StallWatchdog;
pub use watched::{watched_open, HeartbeatPolicy, Liveness, WatchedWriter};
