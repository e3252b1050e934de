//! Process-level signal controller.
//!
//! Handlers never do real work: each one sets an atomic flag, and the
//! dispatch loop observes the flags at its bounded poll points. That
//! is also how TERM's "raise immediately" disposition is expressed:
//! the handler sets a forceful flag and the next poll converts it
//! into an error that unwinds dispatch into teardown.
//!
//! Dispositions are saved when installed and restored by the guard,
//! so a finished run leaves the process as it found it. The child
//! side resets everything to defaults except INT/QUIT/TERM, which
//! flip a worker-local flag so the worker can finish its current
//! item before exiting.

use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::Result;

/// INT/QUIT deliveries observed in the master (also bumped by
/// [`request_shutdown`]).
static GRACEFUL_REQUESTS: AtomicUsize = AtomicUsize::new(0);
/// TERM observed in the master.
static FORCEFUL_REQUESTED: AtomicBool = AtomicBool::new(false);
/// CHLD observed; consumed by the reap step.
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
/// State-dump signal observed.
static DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);
/// INT/QUIT/TERM observed inside a worker process.
static WORKER_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_graceful(_: libc::c_int) {
    GRACEFUL_REQUESTS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn on_forceful(_: libc::c_int) {
    FORCEFUL_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_child_exited(_: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

extern "C" fn on_dump(_: libc::c_int) {
    DUMP_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_worker_shutdown(_: libc::c_int) {
    WORKER_SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Request a graceful shutdown of the running master, exactly as a
/// first INT/QUIT would: dispatch stops at the next checkpoint, the
/// listener closes, and workers drain.
pub fn request_shutdown() {
    GRACEFUL_REQUESTS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn graceful_requests() -> usize {
    GRACEFUL_REQUESTS.load(Ordering::SeqCst)
}

pub(crate) fn forceful_requested() -> bool {
    FORCEFUL_REQUESTED.load(Ordering::SeqCst)
}

/// Consume the reap flag set by CHLD.
pub(crate) fn take_reap_flag() -> bool {
    CHILD_EXITED.swap(false, Ordering::SeqCst)
}

pub(crate) fn take_dump_flag() -> bool {
    DUMP_REQUESTED.swap(false, Ordering::SeqCst)
}

pub(crate) fn worker_shutdown_requested() -> bool {
    WORKER_SHUTDOWN.load(Ordering::SeqCst)
}

/// The state-dump signal for this platform. SIGINFO where it exists;
/// SIGUSR1 on Linux.
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
const DUMP_SIGNAL: Option<Signal> = Some(Signal::SIGINFO);
#[cfg(target_os = "linux")]
const DUMP_SIGNAL: Option<Signal> = Some(Signal::SIGUSR1);
#[cfg(not(any(target_os = "macos", target_os = "freebsd", target_os = "linux")))]
const DUMP_SIGNAL: Option<Signal> = None;

/// Saved dispositions, restored on [`SignalGuard::restore`] or drop.
pub(crate) struct SignalGuard {
    saved: Vec<(Signal, SigAction)>,
    restored: bool,
}

impl SignalGuard {
    pub(crate) fn restore(mut self) {
        self.restore_now();
    }

    fn restore_now(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        for (signal, action) in &self.saved {
            // SAFETY: re-installing the disposition that was in
            // effect before `install` replaced it.
            let _ = unsafe { sigaction(*signal, action) };
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.restore_now();
    }
}

fn flag_action(handler: extern "C" fn(libc::c_int)) -> SigAction {
    // No SA_RESTART: a delivery must interrupt the bounded poll so
    // the loop re-checks its flags promptly.
    SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    )
}

/// Install the master dispositions and clear any stale flags.
pub(crate) fn install() -> Result<SignalGuard> {
    GRACEFUL_REQUESTS.store(0, Ordering::SeqCst);
    FORCEFUL_REQUESTED.store(false, Ordering::SeqCst);
    CHILD_EXITED.store(false, Ordering::SeqCst);
    DUMP_REQUESTED.store(false, Ordering::SeqCst);

    let mut entries = vec![
        (Signal::SIGINT, flag_action(on_graceful)),
        (Signal::SIGQUIT, flag_action(on_graceful)),
        (Signal::SIGTERM, flag_action(on_forceful)),
        (Signal::SIGCHLD, flag_action(on_child_exited)),
    ];
    if let Some(signal) = DUMP_SIGNAL {
        entries.push((signal, flag_action(on_dump)));
    }

    let mut guard = SignalGuard {
        saved: Vec::with_capacity(entries.len()),
        restored: false,
    };
    for (signal, action) in entries {
        // SAFETY: the handlers above only touch atomics, which is
        // async-signal-safe. A partial install is rolled back by the
        // guard's drop.
        let previous = unsafe { sigaction(signal, &action) }?;
        guard.saved.push((signal, previous));
    }
    Ok(guard)
}

/// Reset dispositions inside a freshly-forked worker.
///
/// Everything the master trapped goes back to the default, except
/// INT/QUIT/TERM which set the worker-local shutdown flag so the
/// current item can finish before the process exits.
pub(crate) fn reset_for_child() {
    WORKER_SHUTDOWN.store(false, Ordering::SeqCst);
    CHILD_EXITED.store(false, Ordering::SeqCst);
    GRACEFUL_REQUESTS.store(0, Ordering::SeqCst);
    FORCEFUL_REQUESTED.store(false, Ordering::SeqCst);
    DUMP_REQUESTED.store(false, Ordering::SeqCst);

    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let mut defaults = vec![Signal::SIGCHLD];
    if let Some(signal) = DUMP_SIGNAL {
        defaults.push(signal);
    }
    for signal in defaults {
        // SAFETY: restoring the default disposition in the child.
        let _ = unsafe { sigaction(signal, &default) };
    }

    let shutdown = flag_action(on_worker_shutdown);
    for signal in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        // SAFETY: flag-only handler, as above.
        let _ = unsafe { sigaction(signal, &shutdown) };
    }
}
