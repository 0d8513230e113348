//! Output-growth monitor for supervised commands.
//!
//! Watches the [`Liveness`] of a `WatchedWriter` that a job tees its output
//! into. If nothing has been written for `stale_timeout`, the producer is
//! considered stalled. The watchdog never touches the process itself; it
//! only answers the question, and a job can turn the answer into a
//! cooperative cancellation via [`StallWatchdog::into_cancel_predicate`].
use crate::watched::Liveness;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StallWatchdog {
    liveness: Liveness,
    stale_timeout: Duration,
}

impl StallWatchdog {
    pub fn new(liveness: Liveness, stale_timeout: Duration) -> Self {
        Self {
            liveness,
            stale_timeout,
        }
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    /// Time since the watched writer last saw a write attempt.
    pub fn idle_for(&self) -> Duration {
        self.liveness.idle_for()
    }

    /// True once the writer has been idle for at least `stale_timeout`.
    pub fn is_stalled(&self) -> bool {
        let idle = self.idle_for();
        let stalled = idle >= self.stale_timeout;
        if stalled {
            tracing::warn!(
                idle_secs = idle.as_secs(),
                stale_timeout_secs = self.stale_timeout.as_secs(),
                last_write = %self.liveness.last_write_time(),
                "no output growth, producer looks stalled"
            );
        }
        stalled
    }

    /// Predicate for `CommandJobBuilder::cancel_when`.
    pub fn into_cancel_predicate(self) -> impl FnMut() -> bool + Send + 'static {
        move || self.is_stalled()
    }
}
