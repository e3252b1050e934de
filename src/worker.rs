//! Master-side handle for one worker slot.

use std::path::{Path, PathBuf};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};

use crate::error::{DivvyError, Result};

/// One of the master's N worker slots.
///
/// The slot `number` is stable for the master's lifetime; the pid
/// changes every time the slot is rebooted with a fresh child. A
/// handle is `running` while it has a pid and no exit status.
#[derive(Debug)]
pub struct WorkerHandle {
    number: usize,
    socket_path: PathBuf,
    verbose: bool,
    pid: Option<Pid>,
    status: Option<WaitStatus>,
}

impl WorkerHandle {
    pub(crate) fn new(number: usize, socket_path: PathBuf, verbose: bool) -> Self {
        Self {
            number,
            socket_path,
            verbose,
            pid: None,
            status: None,
        }
    }

    /// Stable 1-based slot id.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Path of the dispatch socket this worker connects to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the run wants chatty worker diagnostics.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Pid of the current child, if one was spawned.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Exit disposition of the current child, once reaped.
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Spawned and not yet reaped.
    pub fn is_running(&self) -> bool {
        self.pid.is_some() && self.status.is_none()
    }

    /// Whether the reaped disposition counts as a failure.
    pub fn failed(&self) -> bool {
        match self.status {
            Some(WaitStatus::Exited(_, code)) => code != 0,
            Some(WaitStatus::Signaled(..)) => true,
            _ => false,
        }
    }

    /// Forget the previous child so the slot can be rebooted. The
    /// `before_fork` hook sees the handle in this pid-less state.
    pub(crate) fn reset(&mut self) {
        self.pid = None;
        self.status = None;
    }

    /// Fork a child for this slot.
    ///
    /// In the child, the handle records the child's own pid and
    /// `child_main` runs; if it returns, the child exits 0. In the
    /// parent, the child's pid is recorded and returned.
    pub(crate) fn spawn<F>(&mut self, child_main: F) -> Result<Pid>
    where
        F: FnOnce(&WorkerHandle),
    {
        if self.is_running() {
            return Err(DivvyError::State("worker slot is already running"));
        }
        self.status = None;

        // SAFETY: the child runs `child_main` and exits without
        // returning into the caller's frames; it performs no
        // async-signal-unsafe work before the worker loop takes over.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                self.pid = Some(child);
                Ok(child)
            }
            ForkResult::Child => {
                self.pid = Some(getpid());
                child_main(self);
                std::process::exit(0);
            }
        }
    }

    /// Non-blocking wait. Returns the disposition once the child has
    /// exited, `None` while it is still running (or was never
    /// spawned). Idempotent after the first successful reap.
    pub(crate) fn reap(&mut self) -> Result<Option<WaitStatus>> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.status = Some(status);
                Ok(Some(status))
            }
        }
    }

    /// Deliver a signal to the child. `Ok(false)` means the process
    /// is already gone.
    pub(crate) fn kill(&self, sig: Signal) -> Result<bool> {
        let Some(pid) = self.pid else {
            return Err(DivvyError::State("worker was never spawned"));
        };
        if self.status.is_some() {
            // Already reaped; the pid may belong to someone else now.
            return Ok(false);
        }
        match signal::kill(pid, sig) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reap_blocking(handle: &mut WorkerHandle) -> WaitStatus {
        for _ in 0..500 {
            if let Some(status) = handle.reap().unwrap() {
                return status;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("worker {} never exited", handle.number());
    }

    #[test]
    fn test_spawn_and_reap_nonzero_exit() {
        let mut handle = WorkerHandle::new(1, "/tmp/unused.sock".into(), false);
        assert!(!handle.is_running());

        handle
            .spawn(|_| {
                // _exit keeps the forked test child away from the
                // harness's atexit machinery.
                unsafe { nix::libc::_exit(7) }
            })
            .unwrap();
        assert!(handle.is_running());
        assert!(handle.pid().is_some());

        let status = reap_blocking(&mut handle);
        assert!(matches!(status, WaitStatus::Exited(_, 7)));
        assert!(!handle.is_running());
        assert!(handle.failed());

        // Idempotent once the status is recorded.
        assert_eq!(handle.reap().unwrap(), Some(status));
    }

    #[test]
    fn test_clean_exit_is_not_a_failure() {
        let mut handle = WorkerHandle::new(2, "/tmp/unused.sock".into(), false);
        handle
            .spawn(|_| unsafe { nix::libc::_exit(0) })
            .unwrap();
        reap_blocking(&mut handle);
        assert!(!handle.failed());
    }

    #[test]
    fn test_kill_requires_a_spawned_child() {
        let handle = WorkerHandle::new(3, "/tmp/unused.sock".into(), false);
        assert!(matches!(
            handle.kill(Signal::SIGTERM),
            Err(DivvyError::State(_))
        ));
    }

    #[test]
    fn test_kill_reports_missing_process() {
        let mut handle = WorkerHandle::new(4, "/tmp/unused.sock".into(), false);
        handle
            .spawn(|_| unsafe { nix::libc::_exit(0) })
            .unwrap();
        reap_blocking(&mut handle);
        // Reaped: the pid no longer names a live process.
        assert!(!handle.kill(Signal::SIGTERM).unwrap());
    }

    #[test]
    fn test_reset_clears_pid_for_before_fork() {
        let mut handle = WorkerHandle::new(5, "/tmp/unused.sock".into(), true);
        handle
            .spawn(|_| unsafe { nix::libc::_exit(0) })
            .unwrap();
        reap_blocking(&mut handle);

        handle.reset();
        assert!(handle.pid().is_none());
        assert!(handle.status().is_none());
        assert_eq!(handle.number(), 5);
        assert!(handle.verbose());
    }
}
