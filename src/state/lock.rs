//! Environment locks.
//!
//! A lock is recorded in the persisted environment state while an operation
//! runs. The in-process [`LockToken`] proves ownership to the state tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::OperationKind;

/// Information about a held environment lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Operation holding the lock.
    pub correlation_id: String,
    /// Kind of the operation holding the lock.
    pub operation: OperationKind,
    /// Process identity of the holder.
    pub holder: String,
    /// Host the holder runs on.
    pub hostname: String,
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Proof of lock ownership handed to the operation holding it.
#[derive(Debug, PartialEq, Eq)]
pub struct LockToken {
    environment: String,
    lock_id: String,
    correlation_id: String,
}

impl LockInfo {
    /// Creates lock info for the current process.
    #[must_use]
    pub fn new(correlation_id: &str, operation: OperationKind) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            operation,
            holder: generate_holder_id(),
            hostname: current_hostname(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Probes whether the process that took this lock is still running.
    ///
    /// A pid only identifies a process on the host that recorded it, and
    /// this process never holds a lock it does not track in memory.
    #[must_use]
    pub fn holder_status(&self) -> HolderStatus {
        if self.hostname != current_hostname() {
            HolderStatus::Remote
        } else if self.pid != std::process::id() && process_alive(self.pid) {
            HolderStatus::Running
        } else {
            HolderStatus::Exited
        }
    }
}

/// Liveness of a persisted lock's holder, as seen from this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderStatus {
    /// Another process on this host with the recorded pid is running.
    Running,
    /// The recorded process on this host is gone.
    Exited,
    /// Taken on another host; liveness cannot be checked.
    Remote,
}

impl LockToken {
    pub(crate) fn new(environment: &str, info: &LockInfo) -> Self {
        Self {
            environment: environment.to_string(),
            lock_id: info.lock_id.clone(),
            correlation_id: info.correlation_id.clone(),
        }
    }

    /// Locked environment.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Lock identifier.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Operation holding the lock.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = current_hostname();
    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

fn current_hostname() -> String {
    hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence; EPERM means it exists under another user.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
const fn process_alive(_pid: u32) -> bool {
    false
}
