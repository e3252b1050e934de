//! End-to-end dispatch scenarios against `Master::run`.
//!
//! Every test here forks real workers and installs real signal
//! dispositions, which are process-global, so the tests serialize on
//! a lock instead of racing each other inside the shared harness.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use divvy::{DivvyError, Emit, Master, MasterConfig, Task, Tuple, Value};

static RUN_LOCK: Mutex<()> = Mutex::new(());

fn run_lock() -> MutexGuard<'static, ()> {
    RUN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn config(workers: usize) -> MasterConfig {
    MasterConfig {
        worker_count: workers,
        drain_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Emits one fixed tuple; the processor verifies the wire round-trip
/// by exiting non-zero on any mismatch.
struct SingleItem {
    expected: Tuple,
}

impl Task for SingleItem {
    fn generate(&self, emit: Emit<'_>) -> anyhow::Result<()> {
        emit(self.expected.clone())
    }

    fn process(&mut self, tuple: Tuple) -> anyhow::Result<()> {
        if tuple != self.expected {
            anyhow::bail!("tuple arrived mangled: {tuple:?}");
        }
        Ok(())
    }
}

#[test]
fn test_single_worker_single_item() {
    let _lock = run_lock();
    let expected = vec![Value::from("just one thing")];
    let mut master = Master::new(
        SingleItem {
            expected: expected.clone(),
        },
        config(1),
    );

    master.run().expect("run should succeed");

    assert_eq!(master.tasks_distributed(), 1);
    assert_eq!(master.failures(), 0, "processor saw a different tuple");
    assert!(master.spawn_count() >= 1);
    assert!(master.workers().iter().all(|w| !w.is_running()));
    assert!(!master.socket_path().exists());
}

/// Ten numbered items; processing an even one fails the worker.
struct EvensFail;

impl Task for EvensFail {
    fn generate(&self, emit: Emit<'_>) -> anyhow::Result<()> {
        for index in 0..10i64 {
            emit(vec![Value::Int(index)])?;
        }
        Ok(())
    }

    fn process(&mut self, tuple: Tuple) -> anyhow::Result<()> {
        let Some(Value::Int(index)) = tuple.first() else {
            anyhow::bail!("unexpected tuple shape: {tuple:?}");
        };
        if index % 2 == 0 {
            anyhow::bail!("refusing even item {index}");
        }
        Ok(())
    }
}

#[test]
fn test_failures_are_counted_and_slots_rebooted() {
    let _lock = run_lock();
    let mut master = Master::new(EvensFail, config(5));

    master.run().expect("worker crashes must not fail the run");

    assert_eq!(master.tasks_distributed(), 10);
    assert_eq!(master.failures(), 5);
    // Five crashes exhaust the pool before the last item, so at
    // least one slot must have been rebooted.
    assert!(master.spawn_count() >= 6);
    assert!(!master.socket_path().exists());
}

/// Children die in `after_fork`, before ever consuming an item.
struct Flapper;

impl Task for Flapper {
    fn generate(&self, emit: Emit<'_>) -> anyhow::Result<()> {
        for index in 0..3i64 {
            emit(vec![Value::Int(index)])?;
        }
        Ok(())
    }

    fn process(&mut self, _tuple: Tuple) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_fork(&self, _worker: &divvy::WorkerHandle) {
        std::process::exit(1);
    }
}

#[test]
fn test_flapping_workers_are_a_boot_failure() {
    let _lock = run_lock();
    let mut master = Master::new(Flapper, config(1));

    let err = master.run().expect_err("flapping workers must fail the run");
    assert!(matches!(err, DivvyError::BootFailure { workers: 1 }));
    assert_eq!(master.tasks_distributed(), 0);
    assert!(master.failures() >= 1);
    assert!(!master.socket_path().exists());
}

/// Unbounded generator that requests graceful shutdown after a fixed
/// number of items, the way an embedding caller would.
struct StopsItself {
    after: i64,
}

impl Task for StopsItself {
    fn generate(&self, emit: Emit<'_>) -> anyhow::Result<()> {
        let mut index: i64 = 0;
        loop {
            if index == self.after {
                divvy::request_shutdown();
            }
            emit(vec![Value::Int(index)])?;
            index += 1;
        }
    }

    fn process(&mut self, _tuple: Tuple) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_graceful_shutdown_stops_dispatch_and_drains() {
    let _lock = run_lock();
    let mut master = Master::new(StopsItself { after: 5 }, config(2));

    master.run().expect("graceful shutdown is a normal return");

    // The item emitted after the request is never dispatched.
    assert_eq!(master.tasks_distributed(), 5);
    assert!(master.workers().iter().all(|w| !w.is_running()));
    assert!(!master.socket_path().exists());
}
