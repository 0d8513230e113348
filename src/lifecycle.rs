//! Liveness probes and escalating termination for OS processes.
//!
//! Everything here is stateless and works on a bare pid (or a `Child` when
//! the exit status has to be collected). The process itself is outside our
//! control, so each step reports an explicit outcome instead of swallowing
//! failures; callers decide what is best-effort.
use crate::result::ORCHESTRATION_FAILURE;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::time::Duration;

/// How many times `signal` checks for death before giving up.
pub const CONFIRM_ATTEMPTS: u32 = 5;

/// Pause between death checks.
pub const CONFIRM_INTERVAL: Duration = Duration::from_secs(1);

/// Signals tried in order by [`terminate_forcefully`] and [`escalate`]. The
/// last one cannot be caught or ignored.
const ESCALATION: [Signal; 2] = [Signal::SIGTERM, Signal::SIGKILL];

/// Errors from process inspection and signalling.
#[derive(Debug)]
pub enum LifecycleError {
    /// The pid cannot name a single process (0, or out of `pid_t` range).
    InvalidPid { pid: u32 },
    /// The process state could not be read, and the process still exists.
    Inspect { pid: u32, source: io::Error },
    /// The signal could not be delivered for a reason other than the
    /// process already being gone.
    Signal {
        pid: u32,
        signal: Signal,
        source: Errno,
    },
    /// Collecting the exit status failed.
    Wait { pid: u32, source: io::Error },
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::InvalidPid { pid } => write!(f, "invalid pid {pid}"),
            LifecycleError::Inspect { pid, source } => {
                write!(f, "failed to inspect process {pid}: {source}")
            }
            LifecycleError::Signal {
                pid,
                signal,
                source,
            } => write!(f, "failed to send {signal:?} to process {pid}: {source}"),
            LifecycleError::Wait { pid, source } => {
                write!(f, "failed to collect exit status of process {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::InvalidPid { .. } => None,
            LifecycleError::Inspect { source, .. } => Some(source),
            LifecycleError::Signal { source, .. } => Some(source),
            LifecycleError::Wait { source, .. } => Some(source),
        }
    }
}

fn to_pid(pid: u32) -> Result<Pid, LifecycleError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(LifecycleError::InvalidPid { pid }),
    }
}

/// Whether `pid` names a live process.
///
/// A zombie counts as dead: it has exited and can no longer be signalled or
/// moved anywhere, only reaped. A process whose `/proc` entry has vanished is
/// dead as well. Any other inspection failure is returned.
#[cfg(target_os = "linux")]
pub fn is_alive(pid: u32) -> Result<bool, LifecycleError> {
    to_pid(pid)?;
    let path = std::path::PathBuf::from(format!("/proc/{pid}/stat"));
    let stat = match std::fs::read_to_string(&path) {
        Ok(stat) => stat,
        Err(_) if !path.exists() => return Ok(false),
        Err(e) => return Err(LifecycleError::Inspect { pid, source: e }),
    };

    match process_state(&stat) {
        Some(state) => Ok(state != 'Z'),
        None => Err(LifecycleError::Inspect {
            pid,
            source: io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unparsable stat line: {stat:?}"),
            ),
        }),
    }
}

/// Without `/proc` a signal-0 probe is the best available answer; zombies
/// still look alive here.
#[cfg(not(target_os = "linux"))]
pub fn is_alive(pid: u32) -> Result<bool, LifecycleError> {
    match kill(to_pid(pid)?, None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(LifecycleError::Inspect {
            pid,
            source: io::Error::from(e),
        }),
    }
}

/// State letter from a `/proc/<pid>/stat` line.
///
/// The command name sits in parentheses and may itself contain spaces or
/// `)`, so the state is the first field after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn process_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().next()?.chars().next()
}

/// Send `sig` to `pid` and wait for it to die.
///
/// A process that is already gone is not an error. Death is checked up to
/// [`CONFIRM_ATTEMPTS`] times, [`CONFIRM_INTERVAL`] apart. Returns `true` if
/// death was observed, `false` if the process still appears alive.
pub fn signal(pid: u32, sig: Signal) -> Result<bool, LifecycleError> {
    deliver(pid, to_pid(pid)?, sig)?;
    confirm_death(pid, sig)
}

/// [`signal`] aimed at the process group led by `pid`, so the leader's
/// descendants get the signal too.
///
/// When `pid` leads no group the signal goes to the process alone. Death is
/// confirmed on the leader only.
pub fn signal_group(pid: u32, sig: Signal) -> Result<bool, LifecycleError> {
    let target = to_pid(pid)?;
    match killpg(target, sig) {
        Ok(()) => {}
        Err(Errno::ESRCH) => deliver(pid, target, sig)?,
        Err(errno) => {
            return Err(LifecycleError::Signal {
                pid,
                signal: sig,
                source: errno,
            })
        }
    }
    confirm_death(pid, sig)
}

fn deliver(pid: u32, target: Pid, sig: Signal) -> Result<(), LifecycleError> {
    match kill(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(LifecycleError::Signal {
            pid,
            signal: sig,
            source: errno,
        }),
    }
}

fn confirm_death(pid: u32, sig: Signal) -> Result<bool, LifecycleError> {
    for _ in 0..CONFIRM_ATTEMPTS {
        if !is_alive(pid)? {
            return Ok(true);
        }
        std::thread::sleep(CONFIRM_INTERVAL);
    }

    tracing::debug!(pid, signal = ?sig, "process still alive after signal");
    Ok(false)
}

/// Terminate a child with SIGTERM, then SIGKILL if it survives.
///
/// Each step goes through [`signal_group`], so a child started as its own
/// group leader takes its descendants down with it. Returns the exit status as soon as one can be collected. If the child had
/// already exited, no signal is sent. `Ok(None)` means the child outlived the
/// whole escalation, which only happens if SIGKILL itself is stuck (e.g.
/// uninterruptible I/O).
pub fn terminate_forcefully(child: &mut Child) -> Result<Option<i32>, LifecycleError> {
    let pid = child.id();
    if let Some(status) = try_wait(child)? {
        return Ok(Some(exit_code(status)));
    }

    for sig in ESCALATION {
        let died = signal_group(pid, sig)?;
        tracing::debug!(pid, signal = ?sig, died, "termination signal sent");
        if let Some(status) = try_wait(child)? {
            return Ok(Some(exit_code(status)));
        }
    }

    tracing::warn!(pid, "process survived escalating termination");
    Ok(None)
}

/// Pid-only escalation for callers that do not own the `Child`.
///
/// Same group-wide signal sequence as [`terminate_forcefully`], stopping as
/// soon as one step confirms death. Returns whether death was confirmed.
pub fn escalate(pid: u32) -> Result<bool, LifecycleError> {
    for sig in ESCALATION {
        if signal_group(pid, sig)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn try_wait(child: &mut Child) -> Result<Option<ExitStatus>, LifecycleError> {
    child.try_wait().map_err(|e| LifecycleError::Wait {
        pid: child.id(),
        source: e,
    })
}

/// Integer exit status: the exit code, or `128 + signo` for a signal death.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => 128 + signo,
        (None, None) => ORCHESTRATION_FAILURE,
    }
}
