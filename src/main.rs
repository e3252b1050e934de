//! divvy - foreground parallel task runner.
//!
//! The engine lives in the library (`divvy::Master`); embedding
//! callers implement [`divvy::Task`] and pass it in. This binary
//! wraps the engine around a built-in demonstration task so the
//! runner can be exercised, load-tested, and signal-tested from a
//! shell: `--count` items flow through `-n` workers, with optional
//! per-item sleep and failure injection.

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{debug, info};

use divvy::{Emit, Master, MasterConfig, Task, Tuple, Value, WorkerHandle, logging};

/// divvy - fan work items out to a pool of forked worker processes.
#[derive(Parser, Debug)]
#[command(name = "divvy", version, about, long_about = None)]
struct Cli {
    /// Number of worker processes.
    #[arg(short = 'n', long = "workers", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,

    /// Verbose stderr logging (-v debug, -vv trace); also enables
    /// full worker error chains.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Dispatch socket path override.
    #[arg(long, env = "DIVVY_SOCKET")]
    socket: Option<PathBuf>,

    /// Items the demonstration generator yields (0 = unbounded).
    #[arg(long, default_value_t = 100)]
    count: u64,

    /// Per-item sleep in the processor, in milliseconds.
    #[arg(long, default_value_t = 0)]
    sleep_ms: u64,

    /// Fail every Nth item (index % N == 0) to exercise failure
    /// accounting.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    fail_every: Option<u64>,

    /// Exit from the after-fork hook so every worker flaps.
    #[arg(long, hide = true)]
    flap: bool,

    /// Seconds to wait for workers to drain before SIGKILL.
    #[arg(long, default_value_t = 30)]
    drain_timeout: u64,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "DIVVY_LOG_FORMAT")]
    log_format: Option<String>,

    /// Log to file (in addition to stderr).
    #[arg(long, env = "DIVVY_LOG_FILE")]
    log_file: Option<PathBuf>,
}

/// Built-in demonstration task: numbered text items, logged by the
/// workers that receive them.
struct DemoTask {
    count: u64,
    sleep: Duration,
    fail_every: Option<u64>,
    flap: bool,
}

impl Task for DemoTask {
    fn generate(&self, emit: Emit<'_>) -> anyhow::Result<()> {
        let mut index: u64 = 0;
        while self.count == 0 || index < self.count {
            emit(vec![
                Value::Int(index as i64),
                Value::Text(format!("item-{index}")),
            ])?;
            index += 1;
        }
        Ok(())
    }

    fn process(&mut self, tuple: Tuple) -> anyhow::Result<()> {
        let (Some(Value::Int(index)), Some(Value::Text(label))) = (tuple.first(), tuple.get(1))
        else {
            anyhow::bail!("unexpected tuple shape: {tuple:?}");
        };
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        if let Some(every) = self.fail_every
            && *index as u64 % every == 0
        {
            anyhow::bail!("induced failure on {label}");
        }
        info!(index = *index, "processed {label}");
        Ok(())
    }

    fn after_fork(&self, worker: &WorkerHandle) {
        if self.flap {
            std::process::exit(1);
        }
        debug!(worker = worker.number(), "worker online");
    }
}

fn main() {
    let cli = Cli::parse();

    let mut log_config = logging::LogConfig::from_verbosity(cli.verbose);
    if let Some(ref format) = cli.log_format {
        match format.parse() {
            Ok(format) => log_config.format = format,
            Err(e) => eprintln!("Warning: {e}"),
        }
    }
    if let Some(ref path) = cli.log_file {
        log_config.file_path = Some(path.clone());
    }
    logging::init(log_config.with_env_overrides());

    let task = DemoTask {
        count: cli.count,
        sleep: Duration::from_millis(cli.sleep_ms),
        fail_every: cli.fail_every,
        flap: cli.flap,
    };
    let config = MasterConfig {
        worker_count: cli.workers as usize,
        socket_path: cli.socket,
        drain_timeout: Duration::from_secs(cli.drain_timeout),
        verbose: cli.verbose > 0,
    };

    let mut master = Master::new(task, config);
    if let Err(e) = master.run() {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
            source = cause.source();
        }
        std::process::exit(e.exit_code());
    }
}
