//! Single command lifecycle: spawn a shell, pump its pipes until it exits,
//! the deadline passes, or the caller cancels, then finalize into a
//! [`CommandResult`].
//!
//! The command is a full shell line handed to `/bin/sh -c`. Quoting and
//! escaping are the caller's responsibility; never build the line from
//! untrusted input without doing so.
use crate::lifecycle::{self, exit_code};
use crate::pipes::{self, InputPipe, OutputPipe};
use crate::result::{CommandResult, ORCHESTRATION_FAILURE};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound of one readiness wait. Deadline and cancellation are checked
/// at least this often even when the command is silent.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shell used to interpret the command line unless overridden.
pub const DEFAULT_SHELL: &str = "/bin/sh";

type CancelPredicate = Box<dyn FnMut() -> bool + Send>;
type Sink = Box<dyn Write + Send>;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Running,
    /// The process exited on its own (or the spawn failed).
    Completed,
    /// The process was terminated by us.
    Killed,
    /// Pipes drained and closed, result populated.
    Finalized,
}

/// Why the job stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The process exited by itself.
    Exited,
    /// The timeout expired and the process was terminated.
    DeadlineExceeded,
    /// The cancellation predicate returned true and the process was terminated.
    Cancelled,
    /// `stop()` or a [`KillHandle`] terminated the process.
    Killed,
    /// The shell could not be spawned.
    SpawnFailed,
}

/// Errors from building or starting a job.
#[derive(Debug)]
pub enum JobError {
    /// The builder was given an unusable setting.
    InvalidConfig { reason: String },
    /// `start` was called on a job that already ran.
    AlreadyStarted,
    /// The shell process could not be created.
    Spawn { source: std::io::Error },
    /// The blocking task running the job did not complete.
    Join { source: tokio::task::JoinError },
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::InvalidConfig { reason } => write!(f, "invalid job configuration: {reason}"),
            JobError::AlreadyStarted => write!(f, "job already started"),
            JobError::Spawn { source } => write!(f, "failed to spawn command: {source}"),
            JobError::Join { source } => write!(f, "job task failed: {source}"),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::InvalidConfig { .. } | JobError::AlreadyStarted => None,
            JobError::Spawn { source } => Some(source),
            JobError::Join { source } => Some(source),
        }
    }
}

/// Process state shared between the job and its kill handles.
///
/// `pid` is cleared the moment the child is reaped, under the lock, so a
/// handle can never signal a recycled pid.
#[derive(Debug, Default)]
struct ProcessSlot {
    pid: Option<u32>,
    killed: bool,
}

fn lock(slot: &Mutex<ProcessSlot>) -> MutexGuard<'_, ProcessSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Terminates a job's process from another thread.
///
/// Obtained with [`CommandJob::kill_handle`]. The job's own pump loop notices
/// the exit on its next tick and finalizes as usual.
#[derive(Debug, Clone)]
pub struct KillHandle {
    slot: Arc<Mutex<ProcessSlot>>,
}

impl KillHandle {
    /// Escalate TERM then KILL against the running process and its group.
    ///
    /// Returns `false` without doing anything when there is no live process
    /// (not started yet, already exited, or already reaped). Repeated calls
    /// are harmless.
    pub fn kill(&self) -> bool {
        let mut slot = lock(&self.slot);
        let Some(pid) = slot.pid else {
            return false;
        };
        match lifecycle::is_alive(pid) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(pid, "process already exited, nothing to kill");
                return false;
            }
            Err(e) => tracing::warn!(pid, error = %e, "could not inspect process, killing anyway"),
        }
        slot.killed = true;
        match lifecycle::escalate(pid) {
            Ok(died) => tracing::info!(pid, died, "process terminated via kill handle"),
            Err(e) => tracing::error!(pid, error = %e, "kill handle failed to terminate process"),
        }
        true
    }
}

/// Builder for [`CommandJob`].
pub struct CommandJobBuilder {
    command: String,
    shell: PathBuf,
    timeout: Option<Duration>,
    stdin: Option<Vec<u8>>,
    stdout_tee: Option<Sink>,
    stderr_tee: Option<Sink>,
    capture_stdout: bool,
    capture_stderr: bool,
    cancel: Option<CancelPredicate>,
    span: Option<tracing::Span>,
}

impl CommandJobBuilder {
    fn new(command: String) -> Self {
        Self {
            command,
            shell: PathBuf::from(DEFAULT_SHELL),
            timeout: None,
            stdin: None,
            stdout_tee: None,
            stderr_tee: None,
            capture_stdout: true,
            capture_stderr: true,
            cancel: None,
            span: None,
        }
    }

    /// Soft deadline measured from start. Without one the job waits for exit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Feed `payload` to the command's stdin, then close it. Without a
    /// payload the command inherits our stdin.
    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Copy stdout into `sink` as it arrives.
    pub fn stdout_tee(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stdout_tee = Some(Box::new(sink));
        self
    }

    /// Copy stderr into `sink` as it arrives.
    pub fn stderr_tee(mut self, sink: impl Write + Send + 'static) -> Self {
        self.stderr_tee = Some(Box::new(sink));
        self
    }

    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Stop the command once `predicate` returns true. Checked once per
    /// poll tick.
    pub fn cancel_when(mut self, predicate: impl FnMut() -> bool + Send + 'static) -> Self {
        self.cancel = Some(Box::new(predicate));
        self
    }

    /// Shell that interprets the command line (default `/bin/sh`).
    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Span that all of this job's log records are emitted in.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Result<CommandJob, JobError> {
        if self.timeout == Some(Duration::ZERO) {
            return Err(JobError::InvalidConfig {
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        if self.command.contains('\0') {
            return Err(JobError::InvalidConfig {
                reason: "command contains a NUL byte".to_string(),
            });
        }

        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("command_job", command = %self.command));

        Ok(CommandJob {
            command: self.command,
            shell: self.shell,
            timeout: self.timeout,
            stdin_payload: self.stdin,
            cancel: self.cancel,
            span,
            state: JobState::NotStarted,
            stop_reason: None,
            start_time: None,
            stop_time: None,
            deadline: None,
            child: None,
            stdout: OutputPipe::new("stdout", None, self.capture_stdout, self.stdout_tee),
            stderr: OutputPipe::new("stderr", None, self.capture_stderr, self.stderr_tee),
            stdin: InputPipe::new(None, Vec::new()),
            slot: Arc::new(Mutex::new(ProcessSlot::default())),
            result: CommandResult::default(),
        })
    }
}

/// One execution of a shell command.
///
/// A job runs at most once. [`run`](Self::run) does everything; the
/// [`start`](Self::start) / [`wait`](Self::wait) / [`stop`](Self::stop) /
/// [`finalize`](Self::finalize) steps are exposed for callers that need to
/// interleave their own work.
pub struct CommandJob {
    command: String,
    shell: PathBuf,
    timeout: Option<Duration>,
    stdin_payload: Option<Vec<u8>>,
    cancel: Option<CancelPredicate>,
    span: tracing::Span,
    state: JobState,
    stop_reason: Option<StopReason>,
    start_time: Option<Instant>,
    stop_time: Option<Instant>,
    deadline: Option<Instant>,
    child: Option<Child>,
    stdout: OutputPipe<ChildStdout>,
    stderr: OutputPipe<ChildStderr>,
    stdin: InputPipe<ChildStdin>,
    slot: Arc<Mutex<ProcessSlot>>,
    result: CommandResult,
}

impl std::fmt::Debug for CommandJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandJob")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .field("stop_reason", &self.stop_reason)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl CommandJob {
    pub fn builder(command: impl Into<String>) -> CommandJobBuilder {
        CommandJobBuilder::new(command.into())
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn started(&self) -> bool {
        self.state != JobState::NotStarted
    }

    /// Whether the process was terminated by us rather than exiting.
    pub fn killed(&self) -> bool {
        lock(&self.slot).killed
    }

    /// Pid of the live child, `None` before start and after reaping.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.slot).pid
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<Instant> {
        self.stop_time
    }

    /// Absolute deadline; `None` means no timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current result, complete only once the job is finalized.
    pub fn result(&self) -> &CommandResult {
        &self.result
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Run the command to completion and return its result.
    ///
    /// On a job that has already started this does nothing and returns a
    /// copy of the current result; a missing exit status is reported as
    /// [`ORCHESTRATION_FAILURE`] in that copy.
    pub fn run(&mut self) -> CommandResult {
        if self.started() {
            tracing::debug!(parent: &self.span, state = ?self.state, "job already started, not running again");
            let mut current = self.result.clone();
            current.exit_status.get_or_insert(ORCHESTRATION_FAILURE);
            return current;
        }

        // A spawn failure is already recorded in the result.
        let _ = self.start();
        self.wait();
        self.finalize();
        self.result.clone()
    }

    /// [`run`](Self::run) on tokio's blocking pool.
    pub async fn run_async(mut self) -> Result<(CommandJob, CommandResult), JobError> {
        tokio::task::spawn_blocking(move || {
            let result = self.run();
            (self, result)
        })
        .await
        .map_err(|source| JobError::Join { source })
    }

    /// Spawn the shell with piped stdout/stderr (and stdin when a payload was
    /// given).
    ///
    /// A spawn failure sets the exit status to [`ORCHESTRATION_FAILURE`] and
    /// leaves the job ready to finalize.
    pub fn start(&mut self) -> Result<(), JobError> {
        if self.started() {
            return Err(JobError::AlreadyStarted);
        }
        let span = self.span.clone();
        let _guard = span.enter();

        let now = Instant::now();
        self.state = JobState::Running;
        self.start_time = Some(now);
        self.deadline = self.timeout.map(|timeout| now + timeout);

        let mut cmd = Command::new(&self.shell);
        // Own process group, so termination reaches everything the shell started.
        cmd.arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if self.stdin_payload.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(shell = %self.shell.display(), error = %e, "failed to spawn command");
                self.state = JobState::Completed;
                self.stop_reason = Some(StopReason::SpawnFailed);
                self.result.exit_status = Some(ORCHESTRATION_FAILURE);
                return Err(JobError::Spawn { source: e });
            }
        };

        let pid = child.id();
        lock(&self.slot).pid = Some(pid);
        self.stdout.attach(child.stdout.take());
        self.stderr.attach(child.stderr.take());
        if let Some(payload) = self.stdin_payload.take() {
            self.stdin = InputPipe::new(child.stdin.take(), payload);
        }
        self.child = Some(child);

        tracing::info!(pid, timeout_secs = ?self.timeout.map(|t| t.as_secs_f64()), "command started");
        Ok(())
    }

    /// Pump the pipes until the process exits, the deadline passes, or the
    /// cancellation predicate fires. In the last two cases the process is
    /// terminated before returning. Does nothing unless the job is running.
    pub fn wait(&mut self) {
        if self.state != JobState::Running {
            return;
        }
        let span = self.span.clone();
        let _guard = span.enter();

        let reason = loop {
            let tick = match self.deadline {
                Some(deadline) => POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())),
                None => POLL_INTERVAL,
            };

            let ready = pipes::wait_ready(&self.stdout, &self.stderr, &self.stdin, tick);
            if ready.stdout {
                self.stdout.read_once();
            }
            if ready.stderr {
                self.stderr.read_once();
            }
            if ready.stdin {
                self.stdin.write_once();
            }

            if let Some(code) = self.reap() {
                self.result.exit_status = Some(code);
                if self.killed() {
                    self.state = JobState::Killed;
                    self.stop_reason = Some(StopReason::Killed);
                } else {
                    self.state = JobState::Completed;
                    self.stop_reason = Some(StopReason::Exited);
                }
                return;
            }

            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break StopReason::DeadlineExceeded;
            }

            if let Some(cancel) = self.cancel.as_mut() {
                if cancel() {
                    break StopReason::Cancelled;
                }
            }
        };

        tracing::info!(?reason, "stopping command");
        self.stop_reason = Some(reason);
        self.force_kill();
    }

    /// Terminate the process (if still running) and finalize.
    ///
    /// Safe after [`wait`](Self::wait) has returned, and a no-op on a job
    /// that never started or is already finalized.
    pub fn stop(&mut self) -> CommandResult {
        match self.state {
            JobState::NotStarted | JobState::Finalized => {}
            _ => {
                let span = self.span.clone();
                let _guard = span.enter();
                if self.force_kill() {
                    self.stop_reason = Some(StopReason::Killed);
                }
                self.finalize();
            }
        }
        self.result.clone()
    }

    /// Drain what is left in the pipes, flush tees, close everything, and
    /// fill in the result. Runs once; later calls do nothing.
    pub fn finalize(&mut self) {
        if matches!(self.state, JobState::NotStarted | JobState::Finalized) {
            return;
        }
        let span = self.span.clone();
        let _guard = span.enter();

        self.stdout.drain();
        self.stderr.drain();
        self.stdout.close();
        self.stderr.close();
        self.stdin = InputPipe::new(None, Vec::new());
        // A child that outlived termination is abandoned here; its pid must
        // not stay reachable through kill handles.
        self.child = None;
        lock(&self.slot).pid = None;

        let stop = Instant::now();
        self.stop_time = Some(stop);
        self.result.duration = self
            .start_time
            .map(|start| stop.duration_since(start))
            .unwrap_or_default();
        self.result.stdout = self.stdout.captured();
        self.result.stderr = self.stderr.captured();
        self.state = JobState::Finalized;

        tracing::debug!(
            exit_status = ?self.result.exit_status,
            duration_secs = self.result.duration_secs(),
            stdout = %self.result.stdout,
            stderr = %self.result.stderr,
            "command finished"
        );
    }

    /// Non-blocking exit check. Clears the shared pid on reap.
    fn reap(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        let mut slot = lock(&self.slot);
        slot.pid?;
        match child.try_wait() {
            Ok(Some(status)) => {
                slot.pid = None;
                Some(exit_code(status))
            }
            Ok(None) => None,
            Err(e) => {
                // The child can no longer be waited on; treat it as gone.
                tracing::warn!(error = %e, "failed to poll command status");
                slot.pid = None;
                Some(ORCHESTRATION_FAILURE)
            }
        }
    }

    /// Escalating termination of a still-running child. Returns whether a
    /// termination was actually attempted.
    fn force_kill(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        let mut slot = lock(&self.slot);
        if slot.pid.is_none() {
            return false;
        }

        match lifecycle::terminate_forcefully(child) {
            Ok(Some(code)) => {
                self.result.exit_status = Some(code);
                slot.pid = None;
            }
            Ok(None) => {
                tracing::error!(pid = child.id(), "command did not die, exit status unknown");
            }
            Err(e) => {
                tracing::error!(pid = child.id(), error = %e, "failed to terminate command");
            }
        }
        slot.killed = true;
        self.state = JobState::Killed;
        true
    }
}

/// Build and run `command` with an optional timeout.
///
/// Shorthand for the common case. Stdin payloads, tees, capture flags and
/// cancellation go through [`CommandJob::builder`].
pub fn run(command: &str, timeout: Option<Duration>) -> Result<CommandResult, JobError> {
    let mut builder = CommandJob::builder(command);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{CONFIRM_ATTEMPTS, CONFIRM_INTERVAL};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Worst-case time between the deadline and a finalized result.
    fn escalation_bound() -> Duration {
        2 * (POLL_INTERVAL + CONFIRM_INTERVAL * CONFIRM_ATTEMPTS)
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_echo_hello() {
        let result = run("echo hello", Some(Duration::from_secs(5))).unwrap();
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert!(result.duration < Duration::from_secs(5));
    }

    #[test]
    fn test_exit_status_without_timeout() {
        let mut job = CommandJob::builder("exit 42").build().unwrap();
        assert_eq!(job.deadline(), None);
        let result = job.run();
        assert_eq!(result.exit_status, Some(42));
        assert_eq!(job.state(), JobState::Finalized);
        assert_eq!(job.stop_reason(), Some(StopReason::Exited));
        assert!(!job.killed());
        assert_eq!(job.pid(), None);
    }

    #[test]
    fn test_captures_stderr_separately() {
        let result = run("echo out; echo err >&2", None).unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn test_shell_features_are_available() {
        let result = run("printf 'b\\na\\n' | sort | tr -d '\\n'", None).unwrap();
        assert_eq!(result.stdout, "ab");
    }

    #[test]
    fn test_timeout_terminates_command() {
        let mut job = CommandJob::builder("sleep 10")
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let result = job.run();

        assert!(job.killed());
        assert_eq!(job.stop_reason(), Some(StopReason::DeadlineExceeded));
        assert!(result.duration >= Duration::from_secs(1));
        assert!(result.duration <= Duration::from_secs(1) + escalation_bound());
        let status = result.exit_status.unwrap();
        assert!(status > 128, "expected signal status, got {status}");
    }

    #[test]
    fn test_large_stdin_delivered_intact() {
        let payload: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let result = CommandJob::builder("cat")
            .stdin(payload.clone())
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
            .run();
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stdout, payload);
    }

    #[test]
    fn test_stdin_closed_after_delivery() {
        // wc only prints once it sees EOF on stdin.
        let result = CommandJob::builder("wc -c")
            .stdin(vec![b'z'; 2048])
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
            .run();
        assert_eq!(result.stdout.trim(), "2048");
    }

    #[test]
    fn test_empty_stdin_payload() {
        let result = CommandJob::builder("cat")
            .stdin("")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
            .run();
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn test_output_larger_than_pipe_buffer() {
        let result = run("head -c 200000 /dev/zero | tr '\\0' a", Some(Duration::from_secs(10)))
            .unwrap();
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stdout.len(), 200000);
    }

    #[test]
    fn test_run_twice_executes_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let mut job = CommandJob::builder(format!("echo run >> {}", marker.display()))
            .build()
            .unwrap();

        let first = job.run();
        let second = job.run();

        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "run\n");
    }

    #[test]
    fn test_run_on_running_job_is_noop() {
        let mut job = CommandJob::builder("sleep 30").build().unwrap();
        job.start().unwrap();
        let pid = job.pid();

        let current = job.run();
        assert_eq!(current.exit_status, Some(ORCHESTRATION_FAILURE));
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.pid(), pid);

        job.stop();
    }

    #[test]
    fn test_start_twice_is_error() {
        let mut job = CommandJob::builder("true").build().unwrap();
        job.start().unwrap();
        assert!(matches!(job.start(), Err(JobError::AlreadyStarted)));
        job.wait();
        job.finalize();
        assert_eq!(job.result().exit_status, Some(0));
    }

    #[test]
    fn test_cancellation_before_output() {
        let start = Instant::now();
        let mut job = CommandJob::builder("sleep 30")
            .cancel_when(|| true)
            .build()
            .unwrap();
        let result = job.run();

        assert_eq!(job.stop_reason(), Some(StopReason::Cancelled));
        assert!(job.killed());
        assert!(result.exit_status.is_some());
        // One tick plus a TERM that lands immediately.
        assert!(start.elapsed() < POLL_INTERVAL + CONFIRM_INTERVAL * 2);
    }

    #[test]
    fn test_cancellation_checked_every_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut job = CommandJob::builder("sleep 30")
            .cancel_when(move || counter.fetch_add(1, Ordering::SeqCst) >= 2)
            .build()
            .unwrap();
        job.run();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.stop_reason(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_spawn_failure_sets_sentinel() {
        let mut job = CommandJob::builder("echo unreachable")
            .shell("/nonexistent/shell")
            .build()
            .unwrap();
        let result = job.run();

        assert_eq!(result.exit_status, Some(ORCHESTRATION_FAILURE));
        assert_eq!(result.stdout, "");
        assert_eq!(job.stop_reason(), Some(StopReason::SpawnFailed));
        assert_eq!(job.state(), JobState::Finalized);
    }

    #[test]
    fn test_start_reports_spawn_error() {
        let mut job = CommandJob::builder("true")
            .shell("/nonexistent/shell")
            .build()
            .unwrap();
        let err = job.start().unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn test_tees_receive_output() {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let result = CommandJob::builder("echo to-out; echo to-err >&2")
            .stdout_tee(out.clone())
            .stderr_tee(err.clone())
            .build()
            .unwrap()
            .run();
        assert_eq!(result.stdout, "to-out\n");
        assert_eq!(out.contents(), "to-out\n");
        assert_eq!(err.contents(), "to-err\n");
    }

    #[test]
    fn test_capture_disabled_leaves_fields_empty() {
        let tee = SharedBuf::default();
        let result = CommandJob::builder("echo hidden; echo shown >&2")
            .capture_stdout(false)
            .stdout_tee(tee.clone())
            .build()
            .unwrap()
            .run();
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "shown\n");
        assert_eq!(tee.contents(), "hidden\n");
    }

    #[test]
    fn test_stdout_closed_early() {
        let result = run("exec >&-; sleep 1; echo done >&2", Some(Duration::from_secs(10))).unwrap();
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.stderr, "done\n");
    }

    #[test]
    fn test_kill_handle_from_other_thread() {
        let mut job = CommandJob::builder("sleep 30").build().unwrap();
        let handle = job.kill_handle();
        assert!(!handle.kill(), "nothing to kill before start");

        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            handle.kill()
        });
        let result = job.run();

        assert!(killer.join().unwrap());
        assert!(job.killed());
        assert_eq!(job.stop_reason(), Some(StopReason::Killed));
        assert!(result.exit_status.unwrap() > 128);
        assert!(result.duration < Duration::from_secs(10));
        assert!(!job.kill_handle().kill(), "reaped process is not signalled");
    }

    #[test]
    fn test_stop_running_job() {
        let mut job = CommandJob::builder("echo before; sleep 30").build().unwrap();
        job.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let result = job.stop();
        assert!(job.killed());
        assert_eq!(job.state(), JobState::Finalized);
        assert_eq!(job.stop_reason(), Some(StopReason::Killed));
        assert_eq!(result.stdout, "before\n");
        assert!(result.exit_status.unwrap() > 128);
    }

    #[test]
    fn test_stop_after_completion_is_noop() {
        let mut job = CommandJob::builder("exit 3").build().unwrap();
        let first = job.run();
        let second = job.stop();
        assert_eq!(first, second);
        assert!(!job.killed());
        assert_eq!(job.stop_reason(), Some(StopReason::Exited));
    }

    #[test]
    fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let mut job = CommandJob::builder(format!("(sleep 3; echo late > {}); true", marker.display()))
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let result = job.run();

        assert_eq!(job.stop_reason(), Some(StopReason::DeadlineExceeded));
        assert!(result.exit_status.unwrap() > 128);
        std::thread::sleep(Duration::from_secs(4));
        assert!(!marker.exists(), "grandchild kept running after timeout");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_handle_ignores_exited_process() {
        let mut job = CommandJob::builder("exit 5").build().unwrap();
        job.start().unwrap();
        // Exited but not yet reaped: the pid is still in the slot.
        std::thread::sleep(Duration::from_millis(300));
        assert!(job.pid().is_some());

        assert!(!job.kill_handle().kill());
        job.wait();
        job.finalize();

        assert!(!job.killed());
        assert_eq!(job.stop_reason(), Some(StopReason::Exited));
        assert_eq!(job.result().exit_status, Some(5));
    }

    #[test]
    fn test_finalize_releases_pid() {
        let mut job = CommandJob::builder("sleep 1").build().unwrap();
        job.start().unwrap();
        assert!(job.pid().is_some());

        // Finalizing without waiting abandons the child.
        job.finalize();
        assert_eq!(job.pid(), None);
        assert!(!job.kill_handle().kill());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = CommandJob::builder("true")
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidConfig { .. }));
    }

    #[test]
    fn test_nul_in_command_rejected() {
        let err = CommandJob::builder("echo a\0b").build().unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[tokio::test]
    async fn test_run_async() {
        let job = CommandJob::builder("echo async").build().unwrap();
        let (job, result) = job.run_async().await.unwrap();
        assert_eq!(result.stdout, "async\n");
        assert_eq!(job.state(), JobState::Finalized);
    }
}
