//! Outcome of a single command run.
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Exit status recorded when the job never obtained a real process exit code
/// (spawn failure, or a second `run` on a job that has no status yet).
pub const ORCHESTRATION_FAILURE: i32 = -1;

/// Result of a command run.
///
/// Every run path (normal exit, deadline, cancellation, kill, spawn failure)
/// produces this same shape; the cause lives on the job, not here.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandResult {
    /// Process exit status. `None` until determined. Signal termination is
    /// reported as `128 + signo`; [`ORCHESTRATION_FAILURE`] marks a run that
    /// never produced a process status.
    pub exit_status: Option<i32>,
    /// Captured stdout, empty when capture was not requested.
    pub stdout: String,
    /// Captured stderr, empty when capture was not requested.
    pub stderr: String,
    /// Wall-clock time between start and finalize.
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl CommandResult {
    /// True when the process exited on its own with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Duration in fractional seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
