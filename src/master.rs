//! The master dispatch engine.
//!
//! One master process drives the user's generator and fans the
//! emitted tuples out to a fixed pool of forked workers over the
//! dispatch socket. For every item: fill any empty worker slots,
//! wait (bounded) for a worker to connect, then serialize → accept →
//! write → close. Signals arrive as atomic flags and are observed at
//! the bounded wait points; child deaths raise a reap flag that
//! triggers reaping and slot reboots. All exits (generator
//! exhaustion, generator error, graceful or forceful shutdown, boot
//! failure) pass through the same teardown, so the listener is
//! closed, the socket file unlinked, children reaped (with SIGKILL
//! when not graceful), and signal dispositions restored.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpid};
use tracing::{debug, info, trace, warn};

use crate::error::{DivvyError, Result};
use crate::listener::Listener;
use crate::paths;
use crate::protocol::{self, Tuple};
use crate::signals;
use crate::task::Task;
use crate::worker::WorkerHandle;
use crate::worker_main;

/// Poll interval while waiting for an accepting worker.
const DISPATCH_POLL: Duration = Duration::from_millis(10);
/// Sleep between reap attempts during teardown.
const REAP_TICK: Duration = Duration::from_millis(10);
/// A repeated INT/QUIT inside this window is an accidental
/// double-tap and is ignored; outside it, the user means it, and the
/// run escalates to forceful shutdown.
const DOUBLE_TAP_WINDOW: Duration = Duration::from_secs(10);

/// Configuration for a dispatch run.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Number of worker processes. Fixed for the whole run.
    pub worker_count: usize,
    /// Socket path override. Defaults to a per-master path under the
    /// system temp directory.
    pub socket_path: Option<PathBuf>,
    /// Upper bound on the graceful drain before stragglers get
    /// SIGKILL.
    pub drain_timeout: Duration,
    /// Chatty worker diagnostics (full error chains on crashes).
    pub verbose: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            socket_path: None,
            drain_timeout: Duration::from_secs(30),
            verbose: false,
        }
    }
}

/// A task plus the runtime that dispatches it.
pub struct Master<T: Task> {
    task: T,
    engine: Engine,
}

impl<T: Task> Master<T> {
    pub fn new(task: T, config: MasterConfig) -> Self {
        Self {
            task,
            engine: Engine::new(config),
        }
    }

    /// Drive the generator to exhaustion, dispatching every emitted
    /// tuple to a worker.
    ///
    /// Returns `Ok(())` when the generator finishes or a graceful
    /// shutdown drains the run. Boot failure, forceful shutdown, I/O
    /// trouble, and generator errors come back as [`DivvyError`];
    /// teardown has already run in every case.
    pub fn run(&mut self) -> Result<()> {
        self.engine.run(&self.task)
    }

    /// Items successfully written to a worker connection.
    pub fn tasks_distributed(&self) -> u64 {
        self.engine.tasks_distributed
    }

    /// Workers reaped with a non-zero disposition.
    pub fn failures(&self) -> u64 {
        self.engine.failures
    }

    /// Successful forks over the master's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.engine.spawn_count
    }

    /// Path of the dispatch socket.
    pub fn socket_path(&self) -> &Path {
        &self.engine.socket_path
    }

    /// The worker slots, ordered by number.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.engine.workers
    }

    pub fn into_task(self) -> T {
        self.task
    }
}

/// Master-side runtime state, deliberately separate from the task so
/// the dispatch loop can borrow both at once.
struct Engine {
    socket_path: PathBuf,
    workers: Vec<WorkerHandle>,
    server: Option<Listener>,
    /// `None` until graceful shutdown is requested; then the instant
    /// of the first request.
    shutdown: Option<Instant>,
    graceful: bool,
    /// Graceful requests already folded into `shutdown`.
    graceful_seen: usize,
    master_pid: Pid,
    drain_timeout: Duration,
    tasks_distributed: u64,
    failures: u64,
    spawn_count: u64,
}

impl Engine {
    fn new(config: MasterConfig) -> Self {
        let socket_path = config
            .socket_path
            .unwrap_or_else(paths::default_socket_path);
        let workers = (1..=config.worker_count)
            .map(|number| WorkerHandle::new(number, socket_path.clone(), config.verbose))
            .collect();
        Self {
            socket_path,
            workers,
            server: None,
            shutdown: None,
            graceful: true,
            graceful_seen: 0,
            master_pid: getpid(),
            drain_timeout: config.drain_timeout,
            tasks_distributed: 0,
            failures: 0,
            spawn_count: 0,
        }
    }

    fn run(&mut self, task: &dyn Task) -> Result<()> {
        if self.server.is_some() {
            return Err(DivvyError::State("dispatch is already running"));
        }
        if getpid() != self.master_pid {
            return Err(DivvyError::State("run must be invoked from the master process"));
        }
        if self.workers.is_empty() {
            return Err(DivvyError::State("worker count must be at least 1"));
        }

        self.shutdown = None;
        self.graceful = true;
        let guard = signals::install()?;
        self.graceful_seen = 0;

        info!(
            workers = self.workers.len(),
            socket = %self.socket_path.display(),
            "starting dispatch"
        );

        let outcome = match Listener::start(&self.socket_path, self.workers.len()) {
            Ok(listener) => {
                self.server = Some(listener);
                self.dispatch(task)
            }
            // Bind failed: surfaced before any worker was spawned.
            Err(e) => Err(e),
        };

        if matches!(&outcome, Err(DivvyError::ForcedShutdown)) {
            self.graceful = false;
        }
        self.teardown();
        guard.restore();

        match outcome {
            Ok(()) | Err(DivvyError::Stopped) => {
                info!(
                    tasks_distributed = self.tasks_distributed,
                    failures = self.failures,
                    spawn_count = self.spawn_count,
                    "dispatch complete"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    tasks_distributed = self.tasks_distributed,
                    failures = self.failures,
                    error = %e,
                    "dispatch aborted"
                );
                Err(e)
            }
        }
    }

    /// Run the generator, dispatching each emitted tuple. Our own
    /// control-flow errors travel through the user's `?` and are
    /// unwrapped here; whatever else comes back is a generator error.
    fn dispatch(&mut self, task: &dyn Task) -> Result<()> {
        let result = task.generate(&mut |tuple: Tuple| -> anyhow::Result<()> {
            self.step(task, tuple)?;
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(match e.downcast::<DivvyError>() {
                Ok(ours) => ours,
                Err(theirs) => DivvyError::Generator(theirs),
            }),
        }
    }

    /// Handle one emitted tuple end to end.
    fn step(&mut self, task: &dyn Task, tuple: Tuple) -> Result<()> {
        self.boot_missing(task)?;
        self.wait_for_worker(task)?;
        self.dispatch_item(&tuple)?;
        self.checkpoint()
    }

    /// Fork a child for every slot that is not currently running.
    fn boot_missing(&mut self, task: &dyn Task) -> Result<()> {
        let listener_fd = self.server.as_ref().and_then(Listener::raw_fd);
        for worker in &mut self.workers {
            if worker.is_running() {
                continue;
            }
            worker.reset();
            task.before_fork(worker);
            let pid =
                worker.spawn(|child| worker_main::child_entry(child, task, listener_fd))?;
            self.spawn_count += 1;
            debug!(worker = worker.number(), pid = pid.as_raw(), "booted worker");
        }
        Ok(())
    }

    /// Bounded wait until a worker has a connection queued. Exits
    /// early for shutdown; a reap flag triggers reaping, the boot
    /// failure check, and a slot refill.
    fn wait_for_worker(&mut self, task: &dyn Task) -> Result<()> {
        loop {
            self.observe_signals()?;
            if self.shutdown.is_some() {
                return Err(DivvyError::Stopped);
            }
            if signals::take_reap_flag() {
                self.reap_exited();
                if self.tasks_distributed == 0 && !self.any_running() {
                    // Flapping: children die before consuming any
                    // item, so rebooting would loop forever.
                    return Err(DivvyError::BootFailure {
                        workers: self.workers.len(),
                    });
                }
                self.boot_missing(task)?;
            }
            if self.server()?.pending(DISPATCH_POLL)? {
                return Ok(());
            }
        }
    }

    /// Serialize, accept the pending connection, write, close.
    fn dispatch_item(&mut self, tuple: &Tuple) -> Result<()> {
        let frame = protocol::encode(tuple)?;
        let mut conn = self.server()?.accept_one()?;
        // On a failed write the accepted handle still closes when
        // `conn` drops.
        conn.write_all(&frame)?;
        drop(conn);
        self.tasks_distributed += 1;
        trace!(tasks_distributed = self.tasks_distributed, "dispatched item");
        Ok(())
    }

    /// Post-item checkpoint: stop on shutdown, opportunistic reap.
    fn checkpoint(&mut self) -> Result<()> {
        self.observe_signals()?;
        if self.shutdown.is_some() {
            return Err(DivvyError::Stopped);
        }
        if signals::take_reap_flag() {
            self.reap_exited();
        }
        Ok(())
    }

    /// Fold delivered signals into loop state. Forceful shutdown and
    /// late INT/QUIT repeats come back as errors that unwind into
    /// teardown.
    fn observe_signals(&mut self) -> Result<()> {
        if signals::forceful_requested() {
            self.graceful = false;
            return Err(DivvyError::ForcedShutdown);
        }
        let requests = signals::graceful_requests();
        if requests > self.graceful_seen {
            self.graceful_seen = requests;
            match self.shutdown {
                None => {
                    self.shutdown = Some(Instant::now());
                    info!("graceful shutdown requested");
                }
                Some(first) if first.elapsed() > DOUBLE_TAP_WINDOW => {
                    self.graceful = false;
                    return Err(DivvyError::ForcedShutdown);
                }
                Some(_) => {}
            }
        }
        if signals::take_dump_flag() {
            self.dump_state();
        }
        Ok(())
    }

    /// Reap every exited child, booking non-zero dispositions as
    /// failures exactly once each.
    fn reap_exited(&mut self) {
        for worker in &mut self.workers {
            if !worker.is_running() {
                continue;
            }
            match worker.reap() {
                Ok(Some(status)) => {
                    if worker.failed() {
                        self.failures += 1;
                        warn!(
                            worker = worker.number(),
                            status = ?status,
                            "worker exited abnormally"
                        );
                    } else {
                        debug!(worker = worker.number(), status = ?status, "worker exited");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(worker = worker.number(), error = %e, "reap failed"),
            }
        }
    }

    /// Close the listener (workers drain on end-of-stream), then
    /// reap until the pool is empty, escalating to SIGKILL when the
    /// run is not graceful or the drain bound expires.
    fn teardown(&mut self) {
        if let Some(listener) = self.server.take() {
            listener.stop();
        }

        let deadline = Instant::now() + self.drain_timeout;
        let mut escalated = !self.graceful;
        while self.any_running() {
            self.reap_exited();
            if !self.any_running() {
                break;
            }
            if !escalated && Instant::now() >= deadline {
                warn!(timeout = ?self.drain_timeout, "graceful drain timed out, killing stragglers");
                escalated = true;
            }
            if escalated {
                for worker in &self.workers {
                    if worker.is_running() {
                        let _ = worker.kill(Signal::SIGKILL);
                    }
                }
            }
            std::thread::sleep(REAP_TICK);
        }
    }

    fn any_running(&self) -> bool {
        self.workers.iter().any(WorkerHandle::is_running)
    }

    fn server(&self) -> Result<&Listener> {
        self.server
            .as_ref()
            .ok_or(DivvyError::State("listener is not running"))
    }

    /// State dump on the INFO/USR1 signal, straight to stderr so it
    /// works regardless of log filtering.
    fn dump_state(&self) {
        eprintln!(
            "divvy master pid={} tasks_distributed={} failures={} spawn_count={} shutdown={:?}",
            self.master_pid,
            self.tasks_distributed,
            self.failures,
            self.spawn_count,
            self.shutdown.map(|t| t.elapsed()),
        );
        for worker in &self.workers {
            eprintln!(
                "  worker {}: pid={:?} status={:?}",
                worker.number(),
                worker.pid().map(Pid::as_raw),
                worker.status(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTask;

    impl Task for NoopTask {
        fn generate(&self, _emit: crate::task::Emit<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn process(&mut self, _tuple: Tuple) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.worker_count, 1);
        assert!(config.socket_path.is_none());
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(!config.verbose);
    }

    #[test]
    fn test_workers_are_numbered_from_one() {
        let master = Master::new(
            NoopTask,
            MasterConfig {
                worker_count: 3,
                ..Default::default()
            },
        );
        let numbers: Vec<usize> = master.workers().iter().map(|w| w.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(master.workers().iter().all(|w| !w.is_running()));
    }

    #[test]
    fn test_socket_path_override() {
        let master = Master::new(
            NoopTask,
            MasterConfig {
                socket_path: Some("/tmp/divvy-test-override.sock".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            master.socket_path(),
            Path::new("/tmp/divvy-test-override.sock")
        );
        assert_eq!(master.workers()[0].socket_path(), master.socket_path());
    }

    #[test]
    fn test_zero_workers_is_refused() {
        let mut master = Master::new(
            NoopTask,
            MasterConfig {
                worker_count: 0,
                ..Default::default()
            },
        );
        assert!(matches!(master.run(), Err(DivvyError::State(_))));
    }
}
