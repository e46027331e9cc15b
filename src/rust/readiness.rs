use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{info, warn};

/// Public view of the load lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    NotLoaded,
    Loading,
    Ready,
    Failed(String),
}

impl ReadinessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not_loaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of asking whether a request may run.
#[derive(Debug)]
pub enum Admission<T> {
    /// The resource is loaded; use it.
    Admitted(Arc<T>),
    /// Nothing has been loaded yet.
    NotLoaded,
    /// A load is in flight. Retry later.
    Loading,
    /// The last load failed and will not be retried on its own.
    Failed(String),
}

enum Slot<T> {
    NotLoaded,
    Loading,
    Ready(Arc<T>),
    Failed(String),
}

/// Guards a lazily loaded resource through
/// `NotLoaded -> Loading -> Ready | Failed`.
///
/// Every transition happens under one write lock, so of any number of
/// concurrent `try_begin_*` callers exactly one wins and performs the load.
/// The lock is never held across I/O.
pub struct Readiness<T> {
    slot: RwLock<Slot<T>>,
}

impl<T> Default for Readiness<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Readiness<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness").field("state", &self.state()).finish()
    }
}

impl<T> Readiness<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot::NotLoaded),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slot<T>> {
        self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slot<T>> {
        self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ReadinessState {
        match &*self.read() {
            Slot::NotLoaded => ReadinessState::NotLoaded,
            Slot::Loading => ReadinessState::Loading,
            Slot::Ready(_) => ReadinessState::Ready,
            Slot::Failed(reason) => ReadinessState::Failed(reason.clone()),
        }
    }

    /// `NotLoaded -> Loading`. Returns `true` if the caller now owns the load.
    pub fn try_begin_load(&self) -> bool {
        self.begin(false)
    }

    /// Like [`try_begin_load`](Self::try_begin_load) but also leaves `Failed`.
    /// Used for explicit retries only.
    pub fn try_begin_reload(&self) -> bool {
        self.begin(true)
    }

    fn begin(&self, from_failed: bool) -> bool {
        let mut slot = self.write();
        match &*slot {
            Slot::NotLoaded => {}
            Slot::Failed(_) if from_failed => {}
            _ => return false,
        }
        *slot = Slot::Loading;
        info!("Readiness: loading");
        true
    }

    /// `Loading -> Ready`.
    pub fn complete(&self, value: Arc<T>) {
        let mut slot = self.write();
        if !matches!(&*slot, Slot::Loading) {
            warn!("Ignoring load completion outside of the loading state");
            return;
        }
        *slot = Slot::Ready(value);
        info!("Readiness: ready");
    }

    /// `Loading -> Failed(reason)`.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut slot = self.write();
        if !matches!(&*slot, Slot::Loading) {
            warn!("Ignoring load failure outside of the loading state: {}", reason);
            return;
        }
        warn!("Readiness: failed ({})", reason);
        *slot = Slot::Failed(reason);
    }

    pub fn admit(&self) -> Admission<T> {
        match &*self.read() {
            Slot::Ready(value) => Admission::Admitted(Arc::clone(value)),
            Slot::NotLoaded => Admission::NotLoaded,
            Slot::Loading => Admission::Loading,
            Slot::Failed(reason) => Admission::Failed(reason.clone()),
        }
    }
}
