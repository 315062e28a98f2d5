//! Per-environment lock table and lifecycle state.
//!
//! The tracker is the only writer of [`EnvironmentState`] records. Every
//! mutation goes through a [`LockToken`] obtained from
//! [`StateTracker::acquire_lock`], and every transition is persisted before
//! the call returns.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError, TerraplaneError};
use crate::orchestrator::OperationKind;
use crate::plan::ApplyOutputs;

use super::lock::{HolderStatus, LockInfo, LockToken};
use super::store::StateStore;
use super::types::{EnvironmentState, LastOutcome, OutcomeResult, Phase};

/// A persisted lock with no holder in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleLockReport {
    /// Locked environment.
    pub environment: String,
    /// The abandoned lock.
    pub lock: LockInfo,
    /// Phase the interrupted operation reached.
    pub phase: Phase,
    /// `Exited` for a crashed local holder, `Remote` for a lock taken on
    /// another host.
    pub holder: HolderStatus,
}

/// Entry of the in-process lock table.
#[derive(Debug)]
enum Slot {
    /// Claimed while the persisted record is read or written.
    Pending,
    /// Held by an operation of this process.
    Held(EnvironmentState),
}

impl Slot {
    fn lock_held(&self, environment: &str) -> TerraplaneError {
        let (holder, since) = match self {
            Self::Held(EnvironmentState { lock: Some(lock), .. }) => {
                (lock.correlation_id.clone(), lock.acquired_at.to_rfc3339())
            }
            Self::Held(_) | Self::Pending => (String::from("another operation of this process"), String::new()),
        };
        StateError::LockHeld {
            environment: environment.to_string(),
            holder,
            since,
        }
        .into()
    }
}

/// Tracks environment locks and lifecycle state.
pub struct StateTracker {
    store: Arc<dyn StateStore>,
    /// Environments locked by this process, with their in-memory state.
    active: Mutex<HashMap<String, Slot>>,
}

impl StateTracker {
    /// Creates a tracker persisting through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the underlying store backend.
    #[must_use]
    pub fn backend_type(&self) -> &'static str {
        self.store.backend_type()
    }

    /// Acquires the exclusive lock on an environment.
    ///
    /// Never waits: a held lock is reported immediately. The lock table is
    /// not held while the store is read or written, so acquisitions on
    /// other environments proceed in parallel.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` if an operation in this or another live local
    /// process holds the lock, `RemoteLock` if it was taken on another
    /// host, `StaleLock` if the local holder is gone, or a backend error.
    pub async fn acquire_lock(
        &self,
        environment: &str,
        correlation_id: &str,
        operation: OperationKind,
    ) -> Result<LockToken> {
        self.claim(environment).await?;

        match self.lock_persisted(environment, correlation_id, operation).await {
            Ok((token, state)) => {
                debug!(environment, correlation_id, lock_id = token.lock_id(), "Acquired environment lock");
                self.active
                    .lock()
                    .await
                    .insert(environment.to_string(), Slot::Held(state));
                Ok(token)
            }
            Err(e) => {
                self.active.lock().await.remove(environment);
                Err(e)
            }
        }
    }

    /// Moves the locked environment to `phase` and persists it.
    ///
    /// # Errors
    ///
    /// Returns `NotLocked` if the token does not match the held lock.
    pub async fn transition(&self, token: &LockToken, phase: Phase, note: Option<String>) -> Result<()> {
        let mut active = self.active.lock().await;
        let state = Self::held_state(&mut active, token)?;

        debug!(
            environment = token.environment(),
            correlation_id = token.correlation_id(),
            "Phase {} -> {phase}",
            state.phase
        );
        state.transition(phase, token.correlation_id(), note);
        let snapshot = state.clone();
        drop(active);

        self.persist(&snapshot).await
    }

    /// Records captured outputs for the locked environment.
    ///
    /// # Errors
    ///
    /// Returns `NotLocked` if the token does not match the held lock.
    pub async fn record_outputs(&self, token: &LockToken, outputs: ApplyOutputs) -> Result<()> {
        let mut active = self.active.lock().await;
        let state = Self::held_state(&mut active, token)?;
        state.outputs = outputs;
        let snapshot = state.clone();
        drop(active);

        self.persist(&snapshot).await
    }

    /// Returns the in-memory state of the locked environment.
    ///
    /// # Errors
    ///
    /// Returns `NotLocked` if the token does not match the held lock.
    pub async fn current(&self, token: &LockToken) -> Result<EnvironmentState> {
        let mut active = self.active.lock().await;
        Self::held_state(&mut active, token).map(|s| s.clone())
    }

    /// Releases the lock, moving to the resting `phase` and recording the
    /// outcome when one is given.
    ///
    /// The lock is dropped from the in-process table even if persisting
    /// fails; the persisted lock then surfaces as stale.
    ///
    /// # Errors
    ///
    /// Returns `NotLocked` if the token does not match the held lock, or a
    /// backend error.
    pub async fn release(
        &self,
        token: LockToken,
        phase: Phase,
        outcome: Option<LastOutcome>,
    ) -> Result<EnvironmentState> {
        let mut state = {
            let mut active = self.active.lock().await;
            Self::held_state(&mut active, &token)?;
            match active.remove(token.environment()) {
                Some(Slot::Held(state)) => state,
                _ => return Err(not_locked(token.environment())),
            }
        };

        if state.phase != phase {
            state.transition(phase, token.correlation_id(), None);
        }
        if let Some(outcome) = outcome {
            state.last_outcome = Some(outcome);
        }
        state.lock = None;
        state.updated_at = chrono::Utc::now();

        self.persist(&state).await?;
        debug!(
            environment = token.environment(),
            correlation_id = token.correlation_id(),
            "Released environment lock in phase {phase}"
        );
        Ok(state)
    }

    /// Writes a state record to the store.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub async fn persist(&self, state: &EnvironmentState) -> Result<()> {
        self.store.save(state).await
    }

    /// Returns the latest known state of an environment.
    ///
    /// Environments locked by this process report their in-memory state;
    /// others are read from the store, defaulting to a fresh idle record.
    ///
    /// # Errors
    ///
    /// Returns a backend error or `Corrupted` for unreadable records.
    pub async fn load_last(&self, environment: &str) -> Result<EnvironmentState> {
        if let Some(Slot::Held(state)) = self.active.lock().await.get(environment) {
            return Ok(state.clone());
        }
        self.load_persisted(environment).await
    }

    /// Clears a persisted lock on operator request, leaving the environment
    /// `Failed`.
    ///
    /// The holder's liveness is only reported, never enforced: a recorded
    /// pid may have been reused by an unrelated process after a reboot, and
    /// a remote holder cannot be checked at all.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` if an operation of this process holds the lock and
    /// `NotLocked` if there is nothing to release.
    pub async fn force_release(&self, environment: &str, reason: &str) -> Result<EnvironmentState> {
        self.claim(environment).await?;
        let result = self.clear_persisted(environment, reason).await;
        self.active.lock().await.remove(environment);
        result
    }

    /// Finds persisted locks among `environments` that no operation of this
    /// process holds.
    ///
    /// Locks whose local holder is still running are left out.
    ///
    /// # Errors
    ///
    /// Returns a backend error if a record cannot be read.
    pub async fn detect_stale_locks(&self, environments: &[String]) -> Result<Vec<StaleLockReport>> {
        let active: Vec<String> = self.active.lock().await.keys().cloned().collect();
        let mut reports = Vec::new();

        for environment in environments.iter().filter(|e| !active.contains(*e)) {
            let state = self.load_persisted(environment).await?;
            let Some(lock) = state.lock else {
                continue;
            };
            let holder = lock.holder_status();
            if holder == HolderStatus::Running {
                continue;
            }

            info!(
                environment = %environment,
                correlation_id = %lock.correlation_id,
                host = %lock.hostname,
                "Found unreleased lock ({holder:?} holder)"
            );
            reports.push(StaleLockReport {
                environment: environment.clone(),
                lock,
                phase: state.phase,
                holder,
            });
        }

        Ok(reports)
    }

    /// Persisted records for environments missing from `known`, sorted.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be listed.
    pub async fn untracked_records(&self, known: &[String]) -> Result<Vec<String>> {
        let mut untracked: Vec<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|name| !known.contains(name))
            .collect();
        untracked.sort();
        Ok(untracked)
    }

    /// Reserves `environment` in the lock table or reports who holds it.
    async fn claim(&self, environment: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(slot) = active.get(environment) {
            return Err(slot.lock_held(environment));
        }
        active.insert(environment.to_string(), Slot::Pending);
        Ok(())
    }

    async fn lock_persisted(
        &self,
        environment: &str,
        correlation_id: &str,
        operation: OperationKind,
    ) -> Result<(LockToken, EnvironmentState)> {
        let mut state = self.load_persisted(environment).await?;

        if let Some(existing) = &state.lock {
            let since = existing.acquired_at.to_rfc3339();
            return Err(match existing.holder_status() {
                HolderStatus::Running => StateError::LockHeld {
                    environment: environment.to_string(),
                    holder: existing.holder.clone(),
                    since,
                },
                HolderStatus::Remote => StateError::RemoteLock {
                    environment: environment.to_string(),
                    holder: existing.correlation_id.clone(),
                    hostname: existing.hostname.clone(),
                    since,
                },
                HolderStatus::Exited => StateError::StaleLock {
                    environment: environment.to_string(),
                    holder: existing.correlation_id.clone(),
                    since,
                },
            }
            .into());
        }

        let lock = LockInfo::new(correlation_id, operation);
        let token = LockToken::new(environment, &lock);
        state.lock = Some(lock);
        state.updated_at = chrono::Utc::now();
        self.persist(&state).await?;

        Ok((token, state))
    }

    async fn clear_persisted(&self, environment: &str, reason: &str) -> Result<EnvironmentState> {
        let mut state = self.load_persisted(environment).await?;
        let Some(lock) = state.lock.take() else {
            return Err(not_locked(environment));
        };

        match lock.holder_status() {
            HolderStatus::Running => warn!(
                environment,
                pid = lock.pid,
                "Process {} is running; overriding lock on operator request (the pid may have been reused)",
                lock.pid
            ),
            HolderStatus::Remote => warn!(
                environment,
                host = %lock.hostname,
                "Lock was taken on host {}; overriding without a liveness check",
                lock.hostname
            ),
            HolderStatus::Exited => {}
        }

        let summary = format!(
            "{} operation {} was interrupted in phase {}: {reason}",
            lock.operation, lock.correlation_id, state.phase
        );
        warn!(environment, correlation_id = %lock.correlation_id, "Force-releasing lock: {summary}");

        state.transition(Phase::Failed, &lock.correlation_id, Some(String::from(reason)));
        state.last_outcome = Some(
            LastOutcome::new(lock.operation, lock.correlation_id, OutcomeResult::Failure)
                .with_error(None, summary),
        );

        self.persist(&state).await?;
        Ok(state)
    }

    async fn load_persisted(&self, environment: &str) -> Result<EnvironmentState> {
        Ok(self
            .store
            .load(environment)
            .await?
            .unwrap_or_else(|| EnvironmentState::new(environment)))
    }

    fn held_state<'a>(
        active: &'a mut HashMap<String, Slot>,
        token: &LockToken,
    ) -> Result<&'a mut EnvironmentState> {
        match active.get_mut(token.environment()) {
            Some(Slot::Held(state)) if state.lock.as_ref().is_some_and(|l| l.lock_id == token.lock_id()) => {
                Ok(state)
            }
            _ => Err(not_locked(token.environment())),
        }
    }
}

impl std::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTracker")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

fn not_locked(environment: &str) -> TerraplaneError {
    StateError::NotLocked {
        environment: environment.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Store whose loads of one environment block until released.
    struct GatedStore {
        inner: LocalStateStore,
        gated: &'static str,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl StateStore for GatedStore {
        async fn load(&self, environment: &str) -> Result<Option<EnvironmentState>> {
            if environment == self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.load(environment).await
        }

        async fn save(&self, state: &EnvironmentState) -> Result<()> {
            self.inner.save(state).await
        }

        async fn list(&self) -> Result<Vec<String>> {
            self.inner.list().await
        }

        fn backend_type(&self) -> &'static str {
            "gated"
        }
    }

    fn tracker() -> (StateTracker, Arc<LocalStateStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        (StateTracker::new(store.clone()), store, dir)
    }

    /// Persists a lock from a process that has already exited.
    #[cfg(unix)]
    async fn plant_stale_lock(store: &LocalStateStore, environment: &str) -> LockInfo {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();

        let mut lock = LockInfo::new("crashed-op", OperationKind::Apply);
        lock.pid = child.id();

        let mut state = EnvironmentState::new(environment);
        state.transition(Phase::Applying, "crashed-op", None);
        state.lock = Some(lock.clone());
        store.save(&state).await.unwrap();
        lock
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let (tracker, _store, _dir) = tracker();

        let token = tracker.acquire_lock("dev", "op-1", OperationKind::Plan).await.unwrap();
        let err = tracker.acquire_lock("dev", "op-2", OperationKind::Plan).await.unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::LockHeld { ref holder, .. }) if holder == "op-1"));

        // Other environments are independent.
        let other = tracker.acquire_lock("prod", "op-3", OperationKind::Plan).await.unwrap();

        tracker.release(token, Phase::Idle, None).await.unwrap();
        tracker.release(other, Phase::Idle, None).await.unwrap();
        assert!(tracker.acquire_lock("dev", "op-4", OperationKind::Plan).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_admits_one() {
        let (tracker, _store, _dir) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    tracker
                        .acquire_lock("dev", &format!("op-{i}"), OperationKind::Apply)
                        .await
                })
            })
            .collect();

        let mut acquired = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => acquired += 1,
                Err(e) => assert!(matches!(e, TerraplaneError::State(StateError::LockHeld { .. }))),
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn test_transitions_are_persisted() {
        let (tracker, store, _dir) = tracker();

        let token = tracker.acquire_lock("dev", "op-1", OperationKind::Apply).await.unwrap();
        tracker.transition(&token, Phase::Initializing, None).await.unwrap();

        let persisted = store.load("dev").await.unwrap().unwrap();
        assert_eq!(persisted.phase, Phase::Initializing);
        assert_eq!(persisted.lock.as_ref().map(|l| l.correlation_id.as_str()), Some("op-1"));

        let outcome = LastOutcome::new(OperationKind::Apply, "op-1", OutcomeResult::Success);
        let released = tracker.release(token, Phase::Idle, Some(outcome)).await.unwrap();

        let persisted = store.load("dev").await.unwrap().unwrap();
        assert_eq!(persisted, released);
        assert!(persisted.lock.is_none());
        assert_eq!(persisted.phase, Phase::Idle);
        assert_eq!(persisted.transitions.len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_token_is_rejected() {
        let (tracker, _store, _dir) = tracker();
        let (other, _other_store, _other_dir) = self::tracker();

        let _token = tracker.acquire_lock("dev", "op-1", OperationKind::Plan).await.unwrap();
        let foreign = other.acquire_lock("dev", "op-2", OperationKind::Plan).await.unwrap();

        let err = tracker.transition(&foreign, Phase::Planning, None).await.unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::NotLocked { .. })));
    }

    #[tokio::test]
    async fn test_load_last_defaults_to_idle() {
        let (tracker, _store, _dir) = tracker();

        let state = tracker.load_last("staging").await.unwrap();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.last_outcome.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_lock_requires_force_release() {
        let (tracker, store, _dir) = tracker();
        plant_stale_lock(&store, "dev").await;

        let err = tracker.acquire_lock("dev", "op-1", OperationKind::Plan).await.unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::StaleLock { ref holder, .. }) if holder == "crashed-op"));

        let reports = tracker.detect_stale_locks(&[String::from("dev"), String::from("prod")]).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].phase, Phase::Applying);

        let state = tracker.force_release("dev", "operator request").await.unwrap();
        assert_eq!(state.phase, Phase::Failed);
        assert!(state.lock.is_none());
        let outcome = state.last_outcome.unwrap();
        assert_eq!(outcome.result, OutcomeResult::Failure);
        assert!(outcome.error_summary.unwrap().contains("interrupted"));

        assert!(tracker.detect_stale_locks(&[String::from("dev")]).await.unwrap().is_empty());
        assert!(tracker.acquire_lock("dev", "op-2", OperationKind::Apply).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_foreign_process_lock_is_held() {
        let (tracker, store, _dir) = tracker();
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();

        let mut lock = LockInfo::new("other-op", OperationKind::Apply);
        lock.pid = child.id();
        let mut state = EnvironmentState::new("dev");
        state.lock = Some(lock);
        store.save(&state).await.unwrap();

        let err = tracker.acquire_lock("dev", "op-1", OperationKind::Apply).await.unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::LockHeld { .. })));
        assert!(tracker.detect_stale_locks(&[String::from("dev")]).await.unwrap().is_empty());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_force_release_overrides_reused_pid() {
        let (tracker, store, _dir) = tracker();
        // An unrelated process now owns the crashed holder's pid.
        let mut unrelated = std::process::Command::new("sleep").arg("5").spawn().unwrap();

        let mut lock = LockInfo::new("crashed-op", OperationKind::Apply);
        lock.pid = unrelated.id();
        let mut state = EnvironmentState::new("dev");
        state.transition(Phase::Applying, "crashed-op", None);
        state.lock = Some(lock);
        store.save(&state).await.unwrap();

        let state = tracker.force_release("dev", "host rebooted").await.unwrap();
        assert_eq!(state.phase, Phase::Failed);
        assert!(state.lock.is_none());
        assert!(tracker.acquire_lock("dev", "op-2", OperationKind::Apply).await.is_ok());

        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[tokio::test]
    async fn test_lock_from_other_host_is_reported_as_remote() {
        let (tracker, store, _dir) = tracker();

        let mut lock = LockInfo::new("ci-apply", OperationKind::Apply);
        lock.hostname = String::from("build-runner-7.example.internal");
        let mut state = EnvironmentState::new("prod");
        state.transition(Phase::Applying, "ci-apply", None);
        state.lock = Some(lock);
        store.save(&state).await.unwrap();

        let err = tracker.acquire_lock("prod", "op-1", OperationKind::Plan).await.unwrap_err();
        assert!(matches!(
            err,
            TerraplaneError::State(StateError::RemoteLock { ref hostname, .. }) if hostname == "build-runner-7.example.internal"
        ));
        assert!(err.to_string().contains("cannot be verified"));

        let reports = tracker.detect_stale_locks(&[String::from("prod")]).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].holder, HolderStatus::Remote);

        let state = tracker.force_release("prod", "runner decommissioned").await.unwrap();
        assert_eq!(state.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_other_environments() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GatedStore {
            inner: LocalStateStore::with_base_dir(dir.path()),
            gated: "prod",
            entered: Notify::new(),
            release: Notify::new(),
        });
        let tracker = Arc::new(StateTracker::new(store.clone()));

        let slow = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.acquire_lock("prod", "op-1", OperationKind::Apply).await })
        };
        store.entered.notified().await;

        let fast = tokio::time::timeout(
            Duration::from_secs(5),
            tracker.acquire_lock("dev", "op-2", OperationKind::Apply),
        )
        .await
        .expect("dev acquisition waited on the prod store round-trip")
        .unwrap();

        // The pending claim on prod is already exclusive.
        let err = tracker.acquire_lock("prod", "op-3", OperationKind::Apply).await.unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::LockHeld { .. })));

        store.release.notify_one();
        let token = slow.await.unwrap().unwrap();
        assert_eq!(token.correlation_id(), "op-1");

        tracker.release(token, Phase::Idle, None).await.unwrap();
        tracker.release(fast, Phase::Idle, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_untracked_records() {
        let (tracker, store, _dir) = tracker();
        for name in ["qa", "dev", "legacy"] {
            store.save(&EnvironmentState::new(name)).await.unwrap();
        }

        let untracked = tracker.untracked_records(&[String::from("dev"), String::from("prod")]).await.unwrap();
        assert_eq!(untracked, vec![String::from("legacy"), String::from("qa")]);
    }

    #[tokio::test]
    async fn test_force_release_without_lock() {
        let (tracker, _store, _dir) = tracker();

        let err = tracker.force_release("dev", "test").await.unwrap_err();
        assert!(matches!(err, TerraplaneError::State(StateError::NotLocked { .. })));
    }
}
