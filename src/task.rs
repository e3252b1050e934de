//! The user-facing task contract.

use crate::protocol::Tuple;
use crate::worker::WorkerHandle;

/// Callback handed to [`Task::generate`]; one call per work item.
///
/// The master dispatches the item before the call returns, so the
/// generator's pace is bounded by worker availability. Errors must be
/// propagated with `?`; the master uses them to unwind dispatch on
/// shutdown, and swallowing them keeps the run alive past its end.
pub type Emit<'a> = &'a mut dyn FnMut(Tuple) -> anyhow::Result<()>;

/// A unit of parallel work: a lazy generator of argument tuples, a
/// per-item processor, and optional fork lifecycle hooks.
///
/// The generator runs in the master; the processor runs in a worker
/// process holding its own copy of the task, snapshotted at fork
/// time. Tuples cross the process boundary through the wire codec,
/// so they must stay within the [`crate::Value`] domain, and the
/// arity the generator emits is the arity the processor must accept.
///
/// A failed item is lost: the worker that crashed on it is replaced,
/// but the item is not re-dispatched. Processors should be idempotent
/// at the level the surrounding system cares about.
pub trait Task {
    /// Lazily produce argument tuples, one `emit` call per item.
    /// Returning ends dispatch.
    fn generate(&self, emit: Emit<'_>) -> anyhow::Result<()>;

    /// Handle one item, inside a worker process.
    fn process(&mut self, tuple: Tuple) -> anyhow::Result<()>;

    /// Called in the master just before each fork. The handle's slot
    /// number is known; its pid is not set yet.
    fn before_fork(&self, _worker: &WorkerHandle) {}

    /// Called in the child just after fork. The handle's pid is the
    /// child's own pid.
    fn after_fork(&self, _worker: &WorkerHandle) {}
}
