//! Output sink that records when it was last written to.
//!
//! [`WatchedWriter`] wraps any `Write` and, on every write, refreshes a
//! liveness timestamp and hands the raw chunk to a callback. A watchdog can
//! read the timestamp through a cloned [`Liveness`] to notice a producer that
//! has gone quiet.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Whether a write whose forwarding failed still counts as a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatPolicy {
    /// Fire the callback for every write attempt.
    #[default]
    Always,
    /// Skip the callback when the inner sink rejected the data.
    OnSuccess,
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Stamp {
    fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }
}

/// Shared view of a writer's last activity.
#[derive(Debug, Clone)]
pub struct Liveness {
    stamp: Arc<Mutex<Stamp>>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            stamp: Arc::new(Mutex::new(Stamp::now())),
        }
    }

    fn touch(&self) {
        *self.stamp.lock().unwrap_or_else(PoisonError::into_inner) = Stamp::now();
    }

    fn get(&self) -> Stamp {
        *self.stamp.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time of the most recent write attempt (creation time before any).
    pub fn last_write_time(&self) -> DateTime<Utc> {
        self.get().wall
    }

    /// Monotonic time since the most recent write attempt.
    pub fn idle_for(&self) -> Duration {
        self.get().mono.elapsed()
    }
}

type WriteCallback = Box<dyn FnMut(&[u8]) + Send>;

/// `Write` decorator that timestamps every write and reports it to a
/// callback.
///
/// Data is forwarded as UTF-8: undecodable bytes become U+FFFD, and a
/// multi-byte character split across two writes is held back until it is
/// complete. Forwarding failures are logged and swallowed, so `write`
/// always reports the whole chunk as consumed. Any context the callback
/// needs is captured by the closure.
pub struct WatchedWriter<W: Write> {
    inner: W,
    target: String,
    liveness: Liveness,
    callback: WriteCallback,
    policy: HeartbeatPolicy,
    pending: Vec<u8>,
}

impl<W: Write> WatchedWriter<W> {
    /// Wrap `inner`. `target` names the destination in log records (usually
    /// a file name).
    pub fn new(
        inner: W,
        target: impl Into<String>,
        callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            target: target.into(),
            liveness: Liveness::new(),
            callback: Box::new(callback),
            policy: HeartbeatPolicy::default(),
            pending: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: HeartbeatPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// A handle that keeps observing this writer's activity.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn last_write_time(&self) -> DateTime<Utc> {
        self.liveness.last_write_time()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap the inner sink. A held-back partial character is discarded.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Decode `chunk` after whatever was held back, keeping an incomplete
    /// trailing sequence for next time.
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;
        text
    }
}

impl<W: Write> Write for WatchedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.liveness.touch();

        let text = self.decode(buf);
        let forwarded = match self.inner.write_all(text.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(target_file = %self.target, error = %e, "failed to write watched output");
                false
            }
        };

        if forwarded || self.policy == HeartbeatPolicy::Always {
            (self.callback)(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.inner.write_all(tail.as_bytes())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> std::fmt::Debug for WatchedWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedWriter")
            .field("target", &self.target)
            .field("policy", &self.policy)
            .field("last_write_time", &self.last_write_time())
            .finish_non_exhaustive()
    }
}

/// Create (or truncate) `path` and wrap a buffered writer for it.
pub fn watched_open(
    path: &Path,
    callback: impl FnMut(&[u8]) + Send + 'static,
) -> io::Result<WatchedWriter<BufWriter<File>>> {
    let file = File::create(path)?;
    Ok(WatchedWriter::new(
        BufWriter::new(file),
        path.display().to_string(),
        callback,
    ))
}
