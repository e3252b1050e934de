//! Socket path helpers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter distinguishing several masters inside one process.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// Default socket path for a new master.
///
/// Lives under the system temp directory and is unique per master
/// pid and per instance, so stale files from a crashed run never
/// collide with a live one.
pub fn default_socket_path() -> PathBuf {
    let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("divvy-{}-{}.sock", std::process::id(), instance))
}
