//! Readiness-driven I/O on a child's pipes.
//!
//! Reads and writes only happen after `poll(2)` reported the descriptor
//! ready, so a single read of at most [`READ_CHUNK`] bytes or a write of at
//! most [`STDIN_CHUNK`] bytes never blocks.
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

/// Upper bound of a single pipe read.
pub const READ_CHUNK: usize = 1024;

/// Upper bound of a single stdin write. POSIX guarantees `PIPE_BUF >= 512`,
/// so a write this size to a writable pipe cannot block.
pub const STDIN_CHUNK: usize = 512;

const READABLE: PollFlags = PollFlags::POLLIN;
const WRITABLE: PollFlags = PollFlags::POLLOUT;

/// Which pipes `wait_ready` found ready.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub stdout: bool,
    pub stderr: bool,
    pub stdin: bool,
}

/// Outcome of a single read from an output pipe.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Some bytes were forwarded.
    Data(usize),
    /// Nothing to do this time (interrupted read).
    Idle,
    /// The write end is closed; the pipe has been dropped.
    Eof,
}

/// One of the child's output streams plus its destinations.
pub(crate) struct OutputPipe<R> {
    name: &'static str,
    pipe: Option<R>,
    capture: Option<Vec<u8>>,
    tee: Option<Box<dyn Write + Send>>,
}

impl<R: Read + AsFd> OutputPipe<R> {
    pub fn new(
        name: &'static str,
        pipe: Option<R>,
        capture: bool,
        tee: Option<Box<dyn Write + Send>>,
    ) -> Self {
        Self {
            name,
            pipe,
            capture: capture.then(Vec::new),
            tee,
        }
    }

    /// Hand over the pipe once the child exists.
    pub fn attach(&mut self, pipe: Option<R>) {
        self.pipe = pipe;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.pipe.as_ref().map(AsFd::as_fd)
    }

    /// Perform one read and forward whatever arrived.
    ///
    /// A read error is logged and closes the stream; the job carries on.
    pub fn read_once(&mut self) -> ReadOutcome {
        let Some(pipe) = self.pipe.as_mut() else {
            return ReadOutcome::Eof;
        };

        let mut buf = [0u8; READ_CHUNK];
        match pipe.read(&mut buf) {
            Ok(0) => {
                self.pipe = None;
                ReadOutcome::Eof
            }
            Ok(n) => {
                self.forward(&buf[..n]);
                ReadOutcome::Data(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Idle,
            Err(e) => {
                tracing::warn!(stream = self.name, error = %e, "pipe read failed, closing stream");
                self.pipe = None;
                ReadOutcome::Eof
            }
        }
    }

    /// Read everything that is immediately available.
    ///
    /// Stops at the first read that would block, at EOF, or on error.
    pub fn drain(&mut self) {
        loop {
            let ready = match self.fd() {
                Some(fd) => {
                    let mut fds = [PollFd::new(fd, READABLE)];
                    poll_fds(&mut fds, Duration::ZERO)
                        .map(|()| is_readable(&fds[0]))
                        .unwrap_or_else(|e| {
                            tracing::warn!(stream = self.name, error = %e, "poll failed during drain");
                            false
                        })
                }
                None => false,
            };
            if !ready || self.read_once() == ReadOutcome::Eof {
                break;
            }
        }
    }

    fn forward(&mut self, data: &[u8]) {
        if let Some(capture) = self.capture.as_mut() {
            capture.extend_from_slice(data);
        }
        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.write_all(data) {
                tracing::warn!(stream = self.name, error = %e, "tee write failed");
            }
        }
    }

    /// Flush the tee (if any) and close the pipe.
    pub fn close(&mut self) {
        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.flush() {
                tracing::warn!(stream = self.name, error = %e, "tee flush failed");
            }
        }
        self.pipe = None;
    }

    /// Captured bytes as text; empty when capture was not requested.
    pub fn captured(&self) -> String {
        self.capture
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }
}

/// The child's stdin and the payload still to be delivered.
pub(crate) struct InputPipe<W> {
    pipe: Option<W>,
    payload: Vec<u8>,
    cursor: usize,
}

impl<W: Write + AsFd> InputPipe<W> {
    /// An empty payload closes the pipe right away.
    pub fn new(pipe: Option<W>, payload: Vec<u8>) -> Self {
        let mut input = Self {
            pipe,
            payload,
            cursor: 0,
        };
        if input.remaining() == 0 {
            input.pipe = None;
        }
        input
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.pipe.as_ref().map(AsFd::as_fd)
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    /// Write the next chunk of the payload, closing stdin once it is all out.
    ///
    /// A failed write (typically `EPIPE` because the child stopped reading)
    /// is logged and closes stdin; the undelivered rest is dropped.
    pub fn write_once(&mut self) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };

        let end = (self.cursor + STDIN_CHUNK).min(self.payload.len());
        match pipe.write(&self.payload[self.cursor..end]) {
            Ok(n) => self.cursor += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    undelivered = self.remaining(),
                    "stdin write failed, closing stdin"
                );
                self.pipe = None;
                return;
            }
        }

        if self.remaining() == 0 {
            tracing::trace!(bytes = self.payload.len(), "stdin payload delivered");
            self.pipe = None;
        }
    }
}

/// Wait up to `timeout` for any open pipe to become ready.
///
/// With no open pipes this just sleeps for `timeout`, which keeps the caller's
/// tick going. A poll failure is reported as "nothing ready".
pub(crate) fn wait_ready<O, E, I>(
    stdout: &OutputPipe<O>,
    stderr: &OutputPipe<E>,
    stdin: &InputPipe<I>,
    timeout: Duration,
) -> Readiness
where
    O: Read + AsFd,
    E: Read + AsFd,
    I: Write + AsFd,
{
    let mut fds = Vec::with_capacity(3);
    let mut slots: [Option<usize>; 3] = [None; 3];
    for (slot, fd, events) in [
        (0, stdout.fd(), READABLE),
        (1, stderr.fd(), READABLE),
        (2, stdin.fd(), WRITABLE),
    ] {
        if let Some(fd) = fd {
            slots[slot] = Some(fds.len());
            fds.push(PollFd::new(fd, events));
        }
    }

    if let Err(e) = poll_fds(&mut fds, timeout) {
        tracing::warn!(error = %e, "poll on child pipes failed");
        return Readiness::default();
    }

    let ready = |slot: usize, check: fn(&PollFd<'_>) -> bool| {
        slots[slot].is_some_and(|i| check(&fds[i]))
    };
    Readiness {
        stdout: ready(0, is_readable),
        stderr: ready(1, is_readable),
        stdin: ready(2, is_writable),
    }
}

fn poll_fds(fds: &mut [PollFd<'_>], timeout: Duration) -> io::Result<()> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    match poll(fds, PollTimeout::from(millis)) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// HUP and ERR count as ready: the following read returns EOF or the error.
fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(READABLE | PollFlags::POLLHUP | PollFlags::POLLERR))
}

fn is_writable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(WRITABLE | PollFlags::POLLHUP | PollFlags::POLLERR))
}
