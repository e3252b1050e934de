//! divvy - a foreground parallel task runner.
//!
//! A master process drives a user-supplied generator and fans the
//! emitted argument tuples out to a fixed pool of forked worker
//! processes over a UNIX-domain stream socket. Dead workers are
//! reaped and replaced; signals drain or abort the run.
//!
//! ```text
//!                  ┌───────────────────┐
//!                  │  Master process   │
//!                  │ generator + loop  │
//!                  └─────────┬─────────┘
//!                            │ listen(backlog = N)
//!                  ┌─────────▼─────────┐
//!                  │   dispatch.sock   │
//!                  └──┬──────┬──────┬──┘
//!             connect │      │      │ connect
//!               ┌─────▼──┐ ┌─▼────┐ ┌▼───────┐
//!               │Worker 1│ │ ...  │ │Worker N│
//!               │ (fork) │ │      │ │ (fork) │
//!               └────────┘ └──────┘ └────────┘
//! ```
//!
//! Each worker pulls one item per connection: the master accepts,
//! writes one length-framed tuple, and closes; the worker processes
//! it and connects again. Item order follows the generator, but any
//! ready worker may win the accept race. A failed item is lost by
//! design: the worker is replaced, the item is not retried.
//!
//! # Example
//!
//! ```no_run
//! use divvy::{Master, MasterConfig, Task, Tuple, Value};
//!
//! struct Greeter;
//!
//! impl Task for Greeter {
//!     fn generate(&self, emit: divvy::Emit<'_>) -> anyhow::Result<()> {
//!         for name in ["alice", "bob"] {
//!             emit(vec![Value::from(name)])?;
//!         }
//!         Ok(())
//!     }
//!
//!     fn process(&mut self, tuple: Tuple) -> anyhow::Result<()> {
//!         println!("hello {:?}", tuple[0]);
//!         Ok(())
//!     }
//! }
//!
//! let mut master = Master::new(Greeter, MasterConfig { worker_count: 4, ..Default::default() });
//! master.run()?;
//! assert_eq!(master.tasks_distributed(), 2);
//! # Ok::<(), divvy::DivvyError>(())
//! ```

pub mod error;
mod listener;
pub mod logging;
mod master;
mod paths;
pub mod protocol;
mod signals;
mod task;
mod worker;
mod worker_main;

pub use error::{DivvyError, Result};
pub use master::{Master, MasterConfig};
pub use paths::default_socket_path;
pub use protocol::{Tuple, Value};
pub use signals::request_shutdown;
pub use task::{Emit, Task};
pub use worker::WorkerHandle;
