//! Lifecycle-scoped callback list
//!
//! Entries are kept in registration order. An entry bound to a lifecycle is
//! dropped the moment that lifecycle reaches `Destroyed`; an unbound entry
//! lives until [`ListenerRegistry::release`].

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::lifecycle::{Lifecycle, ObserverId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Handed to a callback while it runs; disposing removes the callback
#[derive(Debug, Default)]
pub struct Disposable {
    disposed: bool,
}

impl Disposable {
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

struct Entry<T: ?Sized> {
    id: CallbackId,
    callback: Arc<T>,
    binding: Option<(Lifecycle, ObserverId)>,
}

struct RegistryInner<T: ?Sized> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

pub struct ListenerRegistry<T: ?Sized> {
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: ?Sized + Send + Sync + 'static> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Appends `callback`, optionally bounded by `lifecycle`
    ///
    /// Returns `None` and drops the callback when the lifecycle is already
    /// destroyed.
    pub fn add_callback(&self, lifecycle: Option<&Lifecycle>, callback: Arc<T>) -> Option<CallbackId> {
        if lifecycle.is_some_and(|lifecycle| lifecycle.state().is_destroyed()) {
            debug!("Discarding callback bound to a destroyed lifecycle");
            return None;
        }

        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            CallbackId(inner.next_id)
        };

        let binding = lifecycle.map(|lifecycle| {
            let registry: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
            let observer = lifecycle.observe(move |state| {
                if !state.is_destroyed() {
                    return;
                }
                if let Some(registry) = registry.upgrade() {
                    registry.lock().entries.retain(|entry| entry.id != id);
                    debug!("Callback {:?} removed with its lifecycle", id);
                }
            });
            (lifecycle.clone(), observer)
        });

        self.inner.lock().entries.push(Entry {
            id,
            callback,
            binding,
        });
        Some(id)
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner
                .entries
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| inner.entries.remove(index))
        };

        match removed {
            Some(entry) => {
                if let Some((lifecycle, observer)) = entry.binding {
                    lifecycle.remove_observer(observer);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        self.inner.lock().entries.iter().any(|entry| entry.id == id)
    }

    /// Live callbacks in registration order
    pub fn callbacks(&self) -> Vec<Arc<T>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.callback.clone())
            .collect()
    }

    /// Invokes every live callback in registration order
    ///
    /// Works on a snapshot, so callbacks may add or remove entries. An entry
    /// removed by an earlier callback in the same pass is skipped.
    pub fn dispatch<F>(&self, mut invoke: F)
    where
        F: FnMut(&T, &mut Disposable),
    {
        let snapshot: Vec<(CallbackId, Arc<T>)> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|entry| (entry.id, entry.callback.clone()))
            .collect();

        for (id, callback) in snapshot {
            if !self.contains(id) {
                continue;
            }
            let mut disposable = Disposable::default();
            invoke(&*callback, &mut disposable);
            if disposable.is_disposed() {
                debug!("Callback {:?} disposed itself", id);
                self.remove(id);
            }
        }
    }

    /// Drops every entry and detaches from all lifecycles
    pub fn release(&self) {
        let entries: Vec<Entry<T>> = self.inner.lock().entries.drain(..).collect();
        let count = entries.len();
        for entry in entries {
            if let Some((lifecycle, observer)) = entry.binding {
                lifecycle.remove_observer(observer);
            }
        }
        debug!("Registry released {} callbacks", count);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
