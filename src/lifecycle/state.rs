use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Ordered lifecycle states
///
/// The derived order is used for comparisons (`min` of two lifecycles).
/// `Destroyed` sorts last but is handled separately wherever a minimum is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Created,
    Started,
    Resumed,
    Destroyed,
}

impl LifecycleState {
    pub fn is_destroyed(self) -> bool {
        self == LifecycleState::Destroyed
    }

    /// Created, Started or Resumed
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            LifecycleState::Created | LifecycleState::Started | LifecycleState::Resumed
        )
    }

    fn is_pre_created(self) -> bool {
        matches!(
            self,
            LifecycleState::Uninitialized | LifecycleState::Initialized
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "UNINITIALIZED",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::Created => "CREATED",
            LifecycleState::Started => "STARTED",
            LifecycleState::Resumed => "RESUMED",
            LifecycleState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(LifecycleState) + Send + Sync>;

struct LifecycleInner {
    state: LifecycleState,
    next_observer: u64,
    observers: Vec<(ObserverId, Observer)>,
    state_tx: watch::Sender<LifecycleState>,
}

/// Shared handle to an observable lifecycle
///
/// Clones refer to the same lifecycle. Observers run synchronously on the
/// thread that changes the state, after the internal lock has been released,
/// so an observer may freely read or modify other lifecycles (or remove
/// itself). Async code can follow the same transitions through [`subscribe`].
///
/// [`subscribe`]: Lifecycle::subscribe
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Mutex<LifecycleInner>>,
}

impl Lifecycle {
    /// New lifecycle in `Initialized`
    pub fn new() -> Self {
        Self::with_state(LifecycleState::Initialized)
    }

    /// New lifecycle that has not been attached to an owner yet
    pub fn uninitialized() -> Self {
        Self::with_state(LifecycleState::Uninitialized)
    }

    pub(crate) fn with_state(state: LifecycleState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(Mutex::new(LifecycleInner {
                state,
                next_observer: 0,
                observers: Vec::new(),
                state_tx,
            })),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Moves the lifecycle to `target`
    ///
    /// Returns `true` if the state changed and observers were notified.
    /// Rejected transitions are no-ops:
    /// - anything out of `Destroyed`
    /// - `Destroyed` before `Created` was ever reached
    /// - back below `Created` once it was reached
    pub fn set_state(&self, target: LifecycleState) -> bool {
        self.transition(target, false)
    }

    /// Destroys the lifecycle if it has reached `Created`
    ///
    /// A lifecycle still in `Uninitialized`/`Initialized` stays where it is:
    /// observers waiting for `Created` would otherwise never run their setup
    /// and could not release what they hold.
    pub fn destroy(&self) -> bool {
        self.set_state(LifecycleState::Destroyed)
    }

    /// Destroys regardless of the current state
    ///
    /// Only for derived lifecycles whose parents already ended.
    pub(crate) fn force_destroy(&self) -> bool {
        self.transition(LifecycleState::Destroyed, true)
    }

    fn transition(&self, target: LifecycleState, force: bool) -> bool {
        let (observers, terminal) = {
            let mut inner = self.inner.lock();
            let current = inner.state;

            if current == target {
                return false;
            }
            if current.is_destroyed() {
                debug!("Ignoring transition {} -> {}: lifecycle is terminal", current, target);
                return false;
            }
            if target.is_destroyed() && current.is_pre_created() && !force {
                debug!("Ignoring destroy of lifecycle still in {}", current);
                return false;
            }
            if target.is_pre_created() && (!current.is_pre_created() || target < current) {
                warn!("Rejected backwards transition {} -> {}", current, target);
                return false;
            }

            inner.state = target;
            inner.state_tx.send_replace(target);

            let terminal = target.is_destroyed();
            let observers: Vec<Observer> = if terminal {
                // nothing can fire after DESTROYED, so drop the list with it
                inner.observers.drain(..).map(|(_, o)| o).collect()
            } else {
                inner.observers.iter().map(|(_, o)| o.clone()).collect()
            };
            (observers, terminal)
        };

        debug!(
            "Lifecycle moved to {} ({} observers{})",
            target,
            observers.len(),
            if terminal { ", detached" } else { "" }
        );
        for observer in observers {
            observer(target);
        }
        true
    }

    /// Registers an observer for future state changes
    ///
    /// The current state is not replayed; callers check [`state`](Self::state)
    /// themselves. A destroyed lifecycle never changes again, so the observer
    /// is dropped right away and the returned id refers to nothing.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(LifecycleState) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_observer += 1;
        let id = ObserverId(inner.next_observer);
        if inner.state.is_destroyed() {
            debug!("Not keeping observer {:?}: lifecycle is destroyed", id);
            return id;
        }
        inner.observers.push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(observer_id, _)| *observer_id != id);
        inner.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Watch receiver that always holds the latest state
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.lock().state_tx.subscribe()
    }

    pub fn downgrade(&self) -> WeakLifecycle {
        WeakLifecycle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Lifecycle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Lifecycle")
            .field("state", &inner.state)
            .field("observers", &inner.observers.len())
            .finish()
    }
}

/// Non-owning reference to a [`Lifecycle`]
#[derive(Clone)]
pub struct WeakLifecycle {
    inner: Weak<Mutex<LifecycleInner>>,
}

impl WeakLifecycle {
    pub fn upgrade(&self) -> Option<Lifecycle> {
        self.inner.upgrade().map(|inner| Lifecycle { inner })
    }
}
