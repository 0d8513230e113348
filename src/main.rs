use chrono::Local;
use clap::Parser;
use cmdjob::background;
use cmdjob::{
    load_config, watched_open, CommandJob, CommandResult, Liveness, RunnerConfig, StallWatchdog,
    WatchedWriter,
};
use std::path::PathBuf;
use std::process::ExitCode;

/// Run a shell command under supervision: deadline with escalating
/// termination, optional stdin payload, watched output tee, and a
/// structured result.
#[derive(Parser, Debug)]
#[command(name = "cmdjob", version, about)]
pub struct Cli {
    /// Shell command line, passed to /bin/sh -c
    #[arg(value_name = "COMMAND")]
    command: String,

    /// Soft deadline in seconds (overrides config)
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Feed this file to the command's stdin
    #[arg(long, value_name = "PATH")]
    stdin_file: Option<PathBuf>,

    /// Also write stdout to this file as it arrives
    #[arg(long, value_name = "PATH")]
    tee_stdout: Option<PathBuf>,

    /// Cancel the command after this many seconds without stdout (overrides config)
    #[arg(long, value_name = "SECS")]
    stall_timeout: Option<u64>,

    /// Do not keep stdout in the result
    #[arg(long)]
    no_capture_stdout: bool,

    /// Do not keep stderr in the result
    #[arg(long)]
    no_capture_stderr: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Config file path
    #[arg(short, long, default_value = "cmdjob.toml")]
    config: PathBuf,

    /// Directory for per-level log files (overrides config)
    #[arg(long, value_name = "PATH")]
    log_dir: Option<PathBuf>,

    /// Debug output on the console
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Fold command-line overrides into the file configuration.
    fn apply_overrides(&self, config: &mut RunnerConfig) {
        if let Some(secs) = self.timeout {
            config.job.timeout_secs = Some(secs);
        }
        if let Some(secs) = self.stall_timeout {
            config.watchdog.stale_timeout_secs = Some(secs);
        }
        if self.no_capture_stdout {
            config.job.capture_stdout = false;
        }
        if self.no_capture_stderr {
            config.job.capture_stderr = false;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.dir = Some(dir.clone());
        }
        if self.verbose {
            config.logging.console_level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cmdjob: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);

    if let Err(e) = cmdjob::logging::init_logging(&config.logging) {
        eprintln!("cmdjob: {e}");
        return ExitCode::FAILURE;
    }
    tracing::debug!(?cli, "parsed CLI arguments");

    let (job, liveness) = match build_job(&cli, &config) {
        Ok(built) => built,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up command");
            return ExitCode::FAILURE;
        }
    };

    let killer = job.kill_handle();
    let _interrupt = background::spawn_async("interrupt", async move {
        tokio::signal::ctrl_c().await?;
        tracing::warn!("interrupted, terminating command");
        killer.kill();
        Ok::<(), background::TaskError>(())
    });

    let (job, result) = match job.run_async().await {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(error = %e, "command did not complete");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        exit_status = ?result.exit_status,
        stop_reason = ?job.stop_reason(),
        duration_secs = result.duration_secs(),
        "command finished"
    );
    if let (Some(path), Some(liveness)) = (&cli.tee_stdout, &liveness) {
        let local = liveness.last_write_time().with_timezone(&Local);
        tracing::info!(
            tee = %path.display(),
            last_write = %local.format("%Y-%m-%d %H:%M:%S %Z"),
            "stdout tee last written"
        );
    }

    if let Err(e) = print_result(&result, cli.json) {
        tracing::error!(error = %e, "failed to render result");
        return ExitCode::FAILURE;
    }
    ExitCode::from(exit_byte(&result))
}

/// Assemble the job from CLI and config. Also returns the liveness of the
/// stdout tee when one was attached.
fn build_job(
    cli: &Cli,
    config: &RunnerConfig,
) -> Result<(CommandJob, Option<Liveness>), Box<dyn std::error::Error>> {
    let mut builder = CommandJob::builder(cli.command.as_str())
        .capture_stdout(config.job.capture_stdout)
        .capture_stderr(config.job.capture_stderr);

    if let Some(timeout) = config.job.timeout() {
        builder = builder.timeout(timeout);
    }
    if let Some(path) = &cli.stdin_file {
        let payload = std::fs::read(path)
            .map_err(|e| format!("failed to read stdin file {}: {}", path.display(), e))?;
        builder = builder.stdin(payload);
    }

    let stale_timeout = config.watchdog.stale_timeout();
    let mut liveness = None;
    if let Some(path) = &cli.tee_stdout {
        let tee = watched_open(path, |chunk: &[u8]| {
            tracing::trace!(bytes = chunk.len(), "stdout chunk");
        })
        .map_err(|e| format!("failed to open tee file {}: {}", path.display(), e))?
        .with_policy(config.job.heartbeat);
        liveness = Some(tee.liveness());
        builder = builder.stdout_tee(tee);
    } else if stale_timeout.is_some() {
        // Nothing to tee into, but the watchdog still needs a heartbeat.
        let probe = WatchedWriter::new(std::io::sink(), "stdout", |_: &[u8]| {})
            .with_policy(config.job.heartbeat);
        liveness = Some(probe.liveness());
        builder = builder.stdout_tee(probe);
    }

    if let (Some(stale_timeout), Some(liveness)) = (stale_timeout, &liveness) {
        let watchdog = StallWatchdog::new(liveness.clone(), stale_timeout);
        builder = builder.cancel_when(watchdog.into_cancel_predicate());
    }

    Ok((builder.build()?, liveness.filter(|_| cli.tee_stdout.is_some())))
}

fn print_result(result: &CommandResult, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
    }
    Ok(())
}

/// Process exit code for `result`: the command's own status clamped to a
/// byte, 1 when no usable status exists.
fn exit_byte(result: &CommandResult) -> u8 {
    match result.exit_status {
        Some(code) if code >= 0 => u8::try_from(code).unwrap_or(u8::MAX),
        _ => 1,
    }
}
