//! Error types for divvy.

use thiserror::Error;

/// Main error type for divvy.
#[derive(Error, Debug)]
pub enum DivvyError {
    /// Every worker exited before a single item was handed out, so
    /// rebooting the pool would loop forever.
    #[error("boot failure: all {workers} workers exited before any task was distributed")]
    BootFailure { workers: usize },

    /// TERM, or a repeated INT/QUIT outside the double-tap window.
    #[error("forced shutdown requested")]
    ForcedShutdown,

    /// Internal sentinel: graceful shutdown observed at a dispatch
    /// checkpoint. `Master::run` converts this into a normal return.
    #[error("dispatch stopped for graceful shutdown")]
    Stopped,

    #[error("invalid runner state: {0}")]
    State(&'static str),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("refusing wire frame of {0} bytes")]
    FrameTooLarge(usize),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// Uncaught error from the user's generator.
    #[error(transparent)]
    Generator(anyhow::Error),
}

impl DivvyError {
    /// Process exit code for the `divvy` binary.
    ///
    /// 0 is reserved for generator exhaustion and graceful shutdown;
    /// boot failure and forced shutdown get distinct codes so scripts
    /// can tell "workers are flapping" from "somebody killed us".
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BootFailure { .. } => 2,
            Self::ForcedShutdown => 3,
            _ => 1,
        }
    }
}

/// Result type alias for divvy operations.
pub type Result<T> = std::result::Result<T, DivvyError>;
