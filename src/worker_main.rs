//! Worker process entry point and main loop.
//!
//! Runs inside each forked child. The worker pulls items by
//! connecting to the master's socket: one fresh connection per item,
//! one length-framed tuple per connection, the master's close
//! delimiting the item. A connect that fails, or an end-of-stream
//! before a frame, means the listener is gone and the worker exits
//! cleanly.

use std::os::fd::{AsFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd;
use tracing::{debug, error};

use crate::error::DivvyError;
use crate::protocol;
use crate::signals;
use crate::task::Task;
use crate::worker::WorkerHandle;

/// Idle poll interval while parked waiting for an item, so the
/// worker notices its local shutdown flag between items.
const IDLE_POLL_MS: u16 = 100;

/// Everything that happens in the child between fork and exit.
///
/// The prelude mirrors what the master set up: signal dispositions
/// are reset (INT/QUIT/TERM now only flag a local shutdown), the
/// inherited listener descriptor and stdin are closed, and the
/// `after_fork` hook runs. Returning hands control back to
/// `WorkerHandle::spawn`, which exits 0.
pub(crate) fn child_entry(worker: &WorkerHandle, task: &dyn Task, listener_fd: Option<RawFd>) {
    signals::reset_for_child();
    if let Some(fd) = listener_fd {
        let _ = unistd::close(fd);
    }
    let _ = unistd::close(nix::libc::STDIN_FILENO);

    // SAFETY: fork gave this process an exclusive copy of the
    // address space, and this function never returns into the parent
    // stack frames that hold the shared borrows of `task`, so the
    // reference is unique in this process.
    #[allow(invalid_reference_casting)]
    let task: &mut dyn Task = unsafe { &mut *(std::ptr::from_ref(task) as *mut dyn Task) };

    task.after_fork(worker);

    let code = run_loop(task, worker);
    if code != 0 {
        std::process::exit(code);
    }
}

enum Wait {
    Ready,
    Shutdown,
    Gone,
}

fn run_loop(task: &mut dyn Task, worker: &WorkerHandle) -> i32 {
    loop {
        let mut conn = match UnixStream::connect(worker.socket_path()) {
            Ok(conn) => conn,
            // Refused or unlinked: the master stopped listening.
            Err(_) => return 0,
        };

        match wait_readable(&conn) {
            Wait::Ready => {}
            Wait::Shutdown | Wait::Gone => return 0,
        }

        let tuple = match protocol::read_frame(&mut conn) {
            Ok(Some(tuple)) => tuple,
            // End of stream: the listener closed while we were queued.
            Ok(None) => return 0,
            Err(DivvyError::Io(_)) => return 0,
            Err(e) => {
                error!(worker = worker.number(), error = %e, "failed to decode work item");
                return 1;
            }
        };
        drop(conn);

        match catch_unwind(AssertUnwindSafe(|| task.process(tuple))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                report_failure(worker, &e);
                return 1;
            }
            Err(payload) => {
                error!(
                    worker = worker.number(),
                    "task processor panicked: {}",
                    panic_message(&payload)
                );
                return 1;
            }
        }

        if signals::worker_shutdown_requested() {
            debug!(worker = worker.number(), "shutdown observed, worker exiting");
            return 0;
        }
    }
}

/// Park on the connection until an item arrives, checking the local
/// shutdown flag at every poll interval.
fn wait_readable(conn: &UnixStream) -> Wait {
    loop {
        if signals::worker_shutdown_requested() {
            return Wait::Shutdown;
        }
        let mut fds = [PollFd::new(conn.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(IDLE_POLL_MS)) {
            Ok(0) => continue,
            // Readable or hung up; read_frame tells them apart.
            Ok(_) => return Wait::Ready,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return Wait::Gone,
        }
    }
}

/// One diagnostic line per crashed item; the full chain and any
/// captured backtrace only under verbose or `DIVVY_TRACE`.
fn report_failure(worker: &WorkerHandle, error: &anyhow::Error) {
    if worker.verbose() || std::env::var_os("DIVVY_TRACE").is_some() {
        error!(worker = worker.number(), "task processor failed: {error:?}");
    } else {
        error!(worker = worker.number(), "task processor failed: {error:#}");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
