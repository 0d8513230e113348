//! Fire-and-forget work with fault containment.
//!
//! A task's error or panic is caught at its outermost boundary and logged;
//! nothing is ever handed back to the spawner. The caller's logging context
//! (dispatcher and current span) travels with the task so failures land in
//! the same sink.
//!
//! Panics inside a task are recorded by a process-wide panic hook, installed
//! on first use, which captures the location and a backtrace for the log
//! record instead of printing them to stderr. Panics elsewhere go to the
//! previously installed hook as before.
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::Instrument;

thread_local! {
    /// Set while this thread runs task code under `contain`.
    static CONTAINED: Cell<bool> = const { Cell::new(false) };
    /// Where the last contained panic on this thread happened.
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

#[derive(Debug)]
struct PanicSite {
    location: String,
    backtrace: String,
}

/// A caught panic, ready to be logged.
#[derive(Debug)]
struct Fault {
    message: String,
    site: Option<PanicSite>,
}

/// Error type a background task may return.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Run `work` on a new named OS thread.
///
/// The returned handle may be dropped; joining it only waits for completion
/// and never yields the task's error. Fails only if the thread itself cannot
/// be created.
pub fn spawn_thread<F>(name: &str, work: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<(), TaskError> + Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    let span = tracing::Span::current();
    let task = name.to_string();

    std::thread::Builder::new()
        .name(task.clone())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                let _guard = span.enter();
                match contain(work) {
                    Ok(outcome) => report(&task, outcome),
                    Err(fault) => report_panic(&task, &fault),
                }
            })
        })
}

/// Run `work` as a tokio task. Every poll is contained, so a panic or an
/// `Err` ends the task with a log record. Must be called from within a tokio
/// runtime.
pub fn spawn_async<F>(name: &str, work: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    let supervised = Supervised {
        task: name.to_string(),
        work: Box::pin(work),
    };
    tokio::spawn(
        supervised
            .instrument(tracing::Span::current())
            .with_current_subscriber(),
    )
}

/// Future wrapper that reports its inner future's outcome or panic.
struct Supervised<F> {
    task: String,
    work: Pin<Box<F>>,
}

impl<F> Future for Supervised<F>
where
    F: Future<Output = Result<(), TaskError>>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match contain(|| this.work.as_mut().poll(cx)) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(outcome)) => {
                report(&this.task, outcome);
                Poll::Ready(())
            }
            Err(fault) => {
                report_panic(&this.task, &fault);
                Poll::Ready(())
            }
        }
    }
}

/// Run `f`, catching a panic together with where it happened.
fn contain<R>(f: impl FnOnce() -> R) -> Result<R, Fault> {
    install_panic_hook();
    let outer = CONTAINED.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    CONTAINED.with(|flag| flag.set(outer));

    outcome.map_err(|payload| Fault {
        message: panic_message(payload.as_ref()),
        site: LAST_PANIC.with(|last| last.borrow_mut().take()),
    })
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !CONTAINED.with(Cell::get) {
                previous(info);
                return;
            }
            let site = PanicSite {
                location: info
                    .location()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown".to_string()),
                backtrace: Backtrace::force_capture().to_string(),
            };
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(site));
        }));
    });
}

fn report(task: &str, outcome: Result<(), TaskError>) {
    match outcome {
        Ok(()) => tracing::debug!(task, "background task finished"),
        Err(e) => tracing::error!(task, error = %e, chain = %error_chain(e.as_ref()), "background task failed"),
    }
}

fn report_panic(task: &str, fault: &Fault) {
    match &fault.site {
        Some(site) => tracing::error!(
            task,
            panic = %fault.message,
            location = %site.location,
            backtrace = %site.backtrace,
            "background task panicked"
        ),
        None => tracing::error!(task, panic = %fault.message, "background task panicked"),
    }
}

/// `outer: cause: root cause`
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogBuf(Arc<Mutex<Vec<u8>>>);

    impl LogBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn subscriber(logs: &LogBuf) -> impl tracing::Subscriber + Send + Sync {
        let logs = logs.clone();
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || logs.clone())
            .finish()
    }

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sync failed")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_thread_runs_work() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = spawn_thread("worker", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_panic_is_contained_and_logged() {
        let logs = LogBuf::default();
        tracing::subscriber::with_default(subscriber(&logs), || {
            let handle = spawn_thread("exploder", || {
                let empty: Vec<u8> = Vec::new();
                let third = empty[3];
                tracing::debug!(third, "unreachable");
                Ok(())
            })
            .unwrap();
            // The panic never reaches the joiner.
            assert!(handle.join().is_ok());
        });
        let out = logs.contents();
        assert!(out.contains("background task panicked"), "logs: {out}");
        assert!(out.contains("exploder"));
        assert!(out.contains("index out of bounds"));
        assert!(out.contains("location=src/background.rs:"), "logs: {out}");
        assert!(out.contains("backtrace="));
    }

    #[test]
    fn test_contain_records_site_only_for_its_own_panic() {
        let fault = contain(|| panic!("inner")).unwrap_err();
        assert_eq!(fault.message, "inner");
        let site = fault.site.unwrap();
        assert!(site.location.starts_with("src/background.rs:"));

        // Nothing left behind for the next caller.
        assert_eq!(contain(|| 7).unwrap(), 7);
        assert!(LAST_PANIC.with(|last| last.borrow().is_none()));
        assert!(!CONTAINED.with(Cell::get));
    }

    #[test]
    fn test_thread_error_logged_with_chain() {
        let logs = LogBuf::default();
        tracing::subscriber::with_default(subscriber(&logs), || {
            let handle = spawn_thread("syncer", || {
                Err(Box::new(Outer(io::Error::new(io::ErrorKind::Other, "disk gone"))) as TaskError)
            })
            .unwrap();
            handle.join().unwrap();
        });
        let out = logs.contents();
        assert!(out.contains("background task failed"), "logs: {out}");
        assert!(out.contains("sync failed: disk gone"));
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    fn explode() -> Result<(), TaskError> {
        panic!("async boom")
    }

    #[tokio::test]
    async fn test_async_panic_is_contained_and_logged() {
        let logs = LogBuf::default();
        let _default = tracing::subscriber::set_default(subscriber(&logs));

        let supervisor = spawn_async("async-exploder", async { explode() });
        assert!(supervisor.await.is_ok());

        let out = logs.contents();
        assert!(out.contains("background task panicked"), "logs: {out}");
        assert!(out.contains("async boom"));
        assert!(out.contains("location=src/background.rs:"), "logs: {out}");
    }

    #[tokio::test]
    async fn test_async_error_is_logged() {
        let logs = LogBuf::default();
        let _default = tracing::subscriber::set_default(subscriber(&logs));

        spawn_async("async-failer", async {
            Err::<(), TaskError>(Box::new(Outer(io::Error::new(io::ErrorKind::Other, "disk gone"))))
        })
        .await
        .unwrap();

        let out = logs.contents();
        assert!(out.contains("background task failed"), "logs: {out}");
        assert!(out.contains("sync failed: disk gone"));
    }

    #[tokio::test]
    async fn test_async_success() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        spawn_async("async-worker", async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<(), TaskError>(())
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
