//! Immutable, subscribable state with structural change sets.
//!
//! Every transition replaces the state wholesale and is described by a
//! forward/inverse [`PatchSet`]. Subscribers are notified synchronously in
//! registration order. An update issued from inside a subscriber is queued
//! and delivered after the current round, so every subscriber observes
//! transitions in commit order.

use super::patch::{self, PatchOp, PatchSet};
use super::projection::{Projection, Subscription};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::warn;

/// One committed state change.
pub struct Transition<T> {
    pub version: u64,
    pub prev: Arc<T>,
    pub next: Arc<T>,
    pub patches: Arc<PatchSet>,
    pub snapshot: Arc<Value>,
}

impl<T> Clone for Transition<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            prev: self.prev.clone(),
            next: self.next.clone(),
            patches: self.patches.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

/// Element of a raw state stream: a full snapshot, plus the patches that
/// produced it for every element after the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<PatchSet>,
}

type Listener<T> = dyn Fn(&Transition<T>) + Send + Sync;

struct SubscriberEntry<T> {
    id: u64,
    since: u64,
    active: Arc<AtomicBool>,
    listener: Arc<Listener<T>>,
}

struct Inner<T> {
    state: Arc<T>,
    snapshot: Arc<Value>,
    version: u64,
    next_subscriber_id: u64,
    subscribers: Vec<SubscriberEntry<T>>,
    pending: VecDeque<Transition<T>>,
    delivering: bool,
}

struct Shared<T> {
    initial: Arc<T>,
    inner: Mutex<Inner<T>>,
}

pub struct StateContainer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StateContainer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn serialize_state<T: Serialize>(state: &T) -> Value {
    serde_json::to_value(state).unwrap_or_else(|err| {
        warn!(error = %err, "State is not representable as JSON; patches will be empty");
        Value::Null
    })
}

impl<T> StateContainer<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let snapshot = Arc::new(serialize_state(&initial));
        let initial = Arc::new(initial);
        Self {
            shared: Arc::new(Shared {
                initial: initial.clone(),
                inner: Mutex::new(Inner {
                    state: initial,
                    snapshot,
                    version: 0,
                    next_subscriber_id: 0,
                    subscribers: Vec::new(),
                    pending: VecDeque::new(),
                    delivering: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> Arc<T> {
        self.lock().state.clone()
    }

    pub fn initial_state(&self) -> Arc<T> {
        self.shared.initial.clone()
    }

    /// Serialized form of the current state.
    pub fn snapshot(&self) -> Arc<Value> {
        self.lock().snapshot.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Applies `mutator` to a draft copy and commits the result.
    ///
    /// The mutator runs while the container is locked and must not call back
    /// into the container.
    pub fn update<F>(&self, mutator: F) -> Arc<T>
    where
        F: FnOnce(&mut T),
    {
        let committed = self.commit(|current, _| {
            let mut draft = current.clone();
            mutator(&mut draft);
            Ok(draft)
        });
        match committed {
            Ok(next) => next,
            Err(_) => self.state(),
        }
    }

    /// Replaces the whole state.
    pub fn replace(&self, state: T) -> Arc<T> {
        self.update(move |draft| *draft = state)
    }

    fn commit<F>(&self, produce: F) -> Result<Arc<T>>
    where
        F: FnOnce(&T, &Value) -> Result<T>,
    {
        let next = {
            let mut inner = self.lock();
            let draft = produce(&inner.state, &inner.snapshot)?;
            let snapshot = Arc::new(serialize_state(&draft));
            let patches = Arc::new(PatchSet::between(&inner.snapshot, &snapshot));
            let next = Arc::new(draft);
            let prev = std::mem::replace(&mut inner.state, next.clone());
            inner.snapshot = snapshot.clone();
            inner.version += 1;
            let version = inner.version;
            inner.pending.push_back(Transition {
                version,
                prev,
                next: next.clone(),
                patches,
                snapshot,
            });
            if inner.delivering {
                return Ok(next);
            }
            inner.delivering = true;
            next
        };
        self.deliver_pending();
        Ok(next)
    }

    fn deliver_pending(&self) {
        loop {
            let (transition, listeners) = {
                let mut inner = self.lock();
                let Some(transition) = inner.pending.pop_front() else {
                    inner.delivering = false;
                    return;
                };
                let listeners: Vec<_> = inner
                    .subscribers
                    .iter()
                    .filter(|entry| entry.since < transition.version)
                    .map(|entry| (entry.active.clone(), entry.listener.clone()))
                    .collect();
                (transition, listeners)
            };
            for (active, listener) in listeners {
                if active.load(Ordering::SeqCst) {
                    listener(&transition);
                }
            }
        }
    }

    /// Registers `listener` for every transition committed after this call.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Transition<T>) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        self.register(&mut inner, Arc::new(listener))
    }

    fn register(&self, inner: &mut Inner<T>, listener: Arc<Listener<T>>) -> Subscription {
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        inner.subscribers.push(SubscriberEntry {
            id,
            since: inner.version,
            active: active.clone(),
            listener,
        });

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        Subscription::new(
            active,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let mut inner = shared
                        .inner
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    inner.subscribers.retain(|entry| entry.id != id);
                }
            }),
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Emits `transform(state)` now and `transform(next)` on every transition.
    pub fn project<U, F>(&self, transform: F) -> Projection<U>
    where
        U: Send + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let _ = tx.send(transform(&inner.state));
        let subscription = self.register(
            &mut inner,
            Arc::new(move |transition: &Transition<T>| {
                let _ = tx.send(transform(&transition.next));
            }),
        );
        drop(inner);
        Projection::new(rx, subscription)
    }

    /// Raw variant of [`StateContainer::project`]: serialized state plus the
    /// patches of each transition. The first element carries no patches.
    pub fn watch_raw(&self) -> Projection<StateUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let _ = tx.send(StateUpdate {
            state: (*inner.snapshot).clone(),
            patches: None,
        });
        let subscription = self.register(
            &mut inner,
            Arc::new(move |transition: &Transition<T>| {
                let _ = tx.send(StateUpdate {
                    state: (*transition.snapshot).clone(),
                    patches: Some((*transition.patches).clone()),
                });
            }),
        );
        drop(inner);
        Projection::new(rx, subscription)
    }
}

impl<T> StateContainer<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Replays externally produced forward patches through the update path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the patches do not fit the current
    /// state or produce a value that is not a valid `T`. The state is left
    /// untouched in that case.
    pub fn apply(&self, forward: &[PatchOp]) -> Result<Arc<T>> {
        self.commit(|_, snapshot| {
            let mut value = snapshot.clone();
            patch::apply(&mut value, forward)?;
            serde_json::from_value(value)
                .map_err(|err| Error::illegal_state(format!("patched state is invalid: {err}")))
        })
    }
}
