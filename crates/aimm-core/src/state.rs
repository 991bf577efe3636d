//! Hierarchical reactive state.
//!
//! [`ReactiveState`] is an observable JSON node with named substates. Any
//! update on a substate synchronously rewrites the parent's value under the
//! substate's key before the parent's subscribers are notified, so an
//! observer re-reading a node always sees a snapshot that includes every
//! child mutation up to that point.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Subscriber callback. Takes no arguments; observers re-read the node state.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

// ─── CallbackRegistry ───────────────────────────────────────────────────────

#[derive(Default)]
struct CallbackSlots {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// A set of no-argument subscriber callbacks with drop-based cancellation.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    slots: Arc<Mutex<CallbackSlots>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. Dropping the returned handle cancels the
    /// subscription.
    pub fn register(&self, cb: impl Fn() + Send + Sync + 'static) -> CallbackHandle {
        let mut slots = self.slots.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.callbacks.push((id, Arc::new(cb)));
        CallbackHandle {
            slots: Arc::downgrade(&self.slots),
            id,
        }
    }

    /// Invokes every registered callback.
    ///
    /// Callbacks are snapshotted first and invoked outside the internal
    /// lock, so they may re-read state or register further callbacks.
    pub fn notify(&self) {
        let callbacks: Vec<Callback> = {
            let slots = self.slots.lock();
            slots.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in callbacks {
            cb();
        }
    }
}

/// Subscription handle returned by [`CallbackRegistry::register`]. Dropping
/// it removes the callback.
pub struct CallbackHandle {
    slots: Weak<Mutex<CallbackSlots>>,
    id: u64,
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.lock().callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

// ─── ReactiveState ──────────────────────────────────────────────────────────

struct ReactiveNode {
    value: Mutex<Value>,
    callbacks: CallbackRegistry,
    substates: Mutex<HashMap<String, ReactiveState>>,
    /// Parent node and the key this node is mounted under. Weak: the state
    /// tree has no cycles and dropping the root invalidates the chain.
    parent: Option<(Weak<ReactiveNode>, String)>,
}

/// A node of the reactive state tree.
///
/// Cloning is cheap and shares the underlying node.
#[derive(Clone)]
pub struct ReactiveState {
    inner: Arc<ReactiveNode>,
}

impl ReactiveState {
    /// Creates a detached root node carrying `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(ReactiveNode {
                value: Mutex::new(initial),
                callbacks: CallbackRegistry::new(),
                substates: Mutex::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// Returns a snapshot of the node's current value.
    pub fn state(&self) -> Value {
        self.inner.value.lock().clone()
    }

    /// Replaces the node's value, notifies this node's subscribers and then
    /// rewrites and notifies every ancestor.
    pub fn update(&self, new_value: Value) {
        *self.inner.value.lock() = new_value.clone();
        self.inner.callbacks.notify();
        self.propagate(new_value);
    }

    /// Mutates the node's value in place under the node lock, then notifies
    /// like [`update`](Self::update). Concurrent substate propagation cannot
    /// interleave with the mutation.
    pub fn update_with(&self, f: impl FnOnce(&mut Value)) {
        let new_value = {
            let mut value = self.inner.value.lock();
            f(&mut value);
            value.clone()
        };
        self.inner.callbacks.notify();
        self.propagate(new_value);
    }

    /// Subscribes to changes of this node. Dropping the handle cancels the
    /// subscription.
    pub fn subscribe(&self, cb: impl Fn() + Send + Sync + 'static) -> CallbackHandle {
        self.inner.callbacks.register(cb)
    }

    /// Returns the substate mounted under `key`, creating it if needed.
    ///
    /// The child's initial value is the parent's current value under `key`,
    /// or an empty object.
    pub fn register_substate(&self, key: &str) -> ReactiveState {
        let mut substates = self.inner.substates.lock();
        if let Some(existing) = substates.get(key) {
            return existing.clone();
        }
        let initial = self
            .inner
            .value
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let child = ReactiveState {
            inner: Arc::new(ReactiveNode {
                value: Mutex::new(initial),
                callbacks: CallbackRegistry::new(),
                substates: Mutex::new(HashMap::new()),
                parent: Some((Arc::downgrade(&self.inner), key.to_string())),
            }),
        };
        substates.insert(key.to_string(), child.clone());
        child
    }

    /// Rewrites ancestors bottom-up after this node changed to `new_value`.
    fn propagate(&self, new_value: Value) {
        let mut current = self.inner.parent.clone();
        let mut child_value = new_value;
        while let Some((parent_weak, key)) = current {
            let Some(parent) = parent_weak.upgrade() else {
                break;
            };
            let parent_value = {
                let mut value = parent.value.lock();
                if !value.is_object() {
                    *value = Value::Object(Map::new());
                }
                value[&key] = child_value;
                value.clone()
            };
            parent.callbacks.notify();
            child_value = parent_value;
            current = parent.parent.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_update_notifies_subscriber() {
        let state = ReactiveState::new(json!({}));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        let _sub = state.subscribe(move || {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        state.update(json!({"progress": "executing"}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.state(), json!({"progress": "executing"}));
    }

    #[test]
    fn test_substate_rewrites_parent_before_notify() {
        let parent = ReactiveState::new(json!({"meta": 1}));
        let child = parent.register_substate("action");

        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let seen_cb = Arc::clone(&seen);
        let parent_reader = parent.clone();
        let _sub = parent.subscribe(move || {
            seen_cb.lock().push(parent_reader.state());
        });

        child.update(json!({"step": 2}));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], json!({"meta": 1, "action": {"step": 2}}));
    }

    #[test]
    fn test_nested_substates_propagate_to_root() {
        let root = ReactiveState::new(json!({}));
        let mid = root.register_substate("data_access");
        let leaf = mid.register_substate("0");

        leaf.update(json!("reading"));
        assert_eq!(root.state(), json!({"data_access": {"0": "reading"}}));
    }

    #[test]
    fn test_dropping_handle_cancels_subscription() {
        let state = ReactiveState::new(json!(null));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        let sub = state.subscribe(move || {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        });
        state.update(json!(1));
        drop(sub);
        state.update(json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_substate_is_idempotent() {
        let parent = ReactiveState::new(json!({}));
        let a = parent.register_substate("x");
        let b = parent.register_substate("x");
        a.update(json!(1));
        assert_eq!(b.state(), json!(1));
    }
}
