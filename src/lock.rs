//! Per-session generation lock with staleness override.
//!
//! A plain mutex would wedge a session forever when a streaming request is
//! abandoned without releasing it. `SessionLock` lets any acquirer reclaim a
//! lock held longer than the staleness threshold, and lets cancellation
//! release it from outside the generating task. Every release path is
//! idempotent.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default age after which a held lock may be stolen.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    /// Set iff `held`.
    acquired_at: Option<Instant>,
    /// Bumped on every acquisition; guards from older epochs are inert.
    epoch: u64,
    /// Cancellation handle of the generation running under the lock.
    stream: Option<CancellationToken>,
    steals: u64,
}

impl LockState {
    fn clear(&mut self) {
        self.held = false;
        self.acquired_at = None;
        if let Some(stream) = self.stream.take() {
            stream.cancel();
        }
    }
}

#[derive(Debug)]
pub struct SessionLock {
    state: Mutex<LockState>,
    stale_after: Duration,
}

impl SessionLock {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            stale_after,
        }
    }

    /// Non-blocking acquire. A holder older than the staleness threshold is
    /// force-released first (its stream is cancelled) and the lock is taken.
    pub fn try_acquire(self: &Arc<Self>) -> Option<LockGuard> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.held {
            let held_for = state
                .acquired_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            if held_for <= self.stale_after {
                return None;
            }
            state.clear();
            state.steals += 1;
            warn!(
                held_for_secs = held_for.as_secs(),
                epoch = state.epoch,
                steals = state.steals,
                "Stealing stale session lock"
            );
        }
        state.held = true;
        state.acquired_at = Some(now);
        state.epoch += 1;
        Some(LockGuard {
            lock: Arc::clone(self),
            epoch: state.epoch,
        })
    }

    /// Clear the lock regardless of holder and cancel any attached stream.
    /// Returns whether anything was held.
    pub fn force_release(&self) -> bool {
        let mut state = self.state.lock();
        if !state.held {
            debug!("Force release on idle lock ignored");
            return false;
        }
        state.clear();
        warn!(epoch = state.epoch, "Session lock force-released");
        true
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub fn acquired_at(&self) -> Option<Instant> {
        self.state.lock().acquired_at
    }

    /// Number of staleness steals since creation.
    pub fn steal_count(&self) -> u64 {
        self.state.lock().steals
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn release_epoch(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if !state.held || state.epoch != epoch {
            return false;
        }
        state.held = false;
        state.acquired_at = None;
        state.stream = None;
        true
    }
}

impl Default for SessionLock {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

/// Proof of one acquisition. Dropping it releases the lock if this
/// acquisition still owns it.
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<SessionLock>,
    epoch: u64,
}

impl LockGuard {
    /// Whether this acquisition still owns the lock (not stolen or
    /// force-released).
    pub fn is_current(&self) -> bool {
        let state = self.lock.state.lock();
        state.held && state.epoch == self.epoch
    }

    /// Register the generation's cancellation handle so `force_release` and
    /// stale steals can interrupt it. A superseded guard cancels `token`
    /// immediately.
    pub fn attach_stream(&self, token: CancellationToken) {
        let mut state = self.lock.state.lock();
        if state.held && state.epoch == self.epoch {
            state.stream = Some(token);
        } else {
            token.cancel();
        }
    }

    /// Run `f` atomically with respect to steals and forced releases, but
    /// only if this acquisition still owns the lock.
    pub fn commit<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.lock.state.lock();
        if state.held && state.epoch == self.epoch {
            Some(f())
        } else {
            None
        }
    }

    /// Idempotent; a no-op once released, stolen, or force-released.
    pub fn release(&self) {
        if !self.lock.release_epoch(self.epoch) {
            debug!(epoch = self.epoch, "Lock already released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release_epoch(self.epoch);
    }
}
