//! Lifecycle bounded by the shorter-lived of two parents
//!
//! ```text
//! parent one ──┐
//!              ├──► min(one, two) ──► derived Lifecycle
//! parent two ──┘        │
//!                       └── either DESTROYED ──► DESTROYED + detach
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::state::{Lifecycle, LifecycleState, ObserverId, WeakLifecycle};

/// Derived lifecycle tracking `min(one, two)`
///
/// The derived lifecycle keeps following its parents after this value is
/// dropped; only a parent reaching `Destroyed` ends the subscription.
pub struct LifecycleIntersection {
    lifecycle: Lifecycle,
}

struct IntersectionLink {
    one: WeakLifecycle,
    two: WeakLifecycle,
    derived: Lifecycle,
    observers: Mutex<Option<(ObserverId, ObserverId)>>,
}

impl LifecycleIntersection {
    pub fn new(one: &Lifecycle, two: &Lifecycle) -> Self {
        let (state_one, state_two) = (one.state(), two.state());

        if state_one.is_destroyed() || state_two.is_destroyed() {
            debug!("Intersection created over a destroyed parent");
            return Self {
                lifecycle: Lifecycle::with_state(LifecycleState::Destroyed),
            };
        }

        let derived = Lifecycle::with_state(state_one.min(state_two));
        let link = Arc::new(IntersectionLink {
            one: one.downgrade(),
            two: two.downgrade(),
            derived: derived.clone(),
            observers: Mutex::new(None),
        });

        let observer_one = {
            let link = link.clone();
            one.observe(move |_| link.recompute())
        };
        let observer_two = {
            let link = link.clone();
            two.observe(move |_| link.recompute())
        };
        *link.observers.lock() = Some((observer_one, observer_two));
        // a parent may have ended between the state read and registration
        link.recompute();

        debug!("Intersection created in {}", derived.state());
        Self { lifecycle: derived }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn into_lifecycle(self) -> Lifecycle {
        self.lifecycle
    }
}

impl IntersectionLink {
    fn recompute(&self) {
        // a parent nobody holds anymore can never change again; treat it as ended
        let states = match (self.one.upgrade(), self.two.upgrade()) {
            (Some(one), Some(two)) => Some((one.state(), two.state())),
            _ => None,
        };

        match states {
            Some((one, two)) if !one.is_destroyed() && !two.is_destroyed() => {
                let target = one.min(two);
                if target != self.derived.state() {
                    self.derived.set_state(target);
                }
            }
            _ => {
                self.derived.force_destroy();
                self.detach();
            }
        }
    }

    fn detach(&self) {
        let Some((observer_one, observer_two)) = self.observers.lock().take() else {
            return;
        };
        if let Some(one) = self.one.upgrade() {
            one.remove_observer(observer_one);
        }
        if let Some(two) = self.two.upgrade() {
            two.remove_observer(observer_two);
        }
        debug!("Intersection detached from both parents");
    }
}
