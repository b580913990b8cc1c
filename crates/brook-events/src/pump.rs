//! Named broadcast channels ("pumps") with reentrancy-safe delivery

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::registry::PumpsInner;

/// Listener callback signature.
///
/// Receives each posted value; returning `true` marks the value as fully
/// handled, which stops delivery to any later listener on the same pump.
pub type ListenerFn = dyn Fn(&Value) -> bool;

/// Errors raised by pump bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PumpError {
    /// A listener with this id is already registered on the pump
    #[error("listener \"{listener}\" already registered on pump \"{pump}\"")]
    DuplicateListener {
        /// Name of the pump
        pump: String,
        /// Offending listener id
        listener: String,
    },

    /// A pump with this exact name already exists in the registry
    #[error("pump \"{0}\" already exists")]
    DuplicatePump(String),
}

/// One registered listener
struct ListenerEntry {
    /// Caller-supplied id, unique per pump
    id: String,

    /// Cleared when the listener is stopped; a cleared entry is skipped by
    /// any delivery pass still in flight and removed once the pass ends
    active: Cell<bool>,

    /// The callback itself
    callback: Rc<ListenerFn>,
}

/// Listener-list mutation requested while a delivery pass was in flight
enum PendingOp {
    Add(ListenerEntry),
    Remove(String),
}

/// Shared state behind one or more [`Pump`] handles
pub(crate) struct PumpInner {
    /// Unique pump name within its registry
    name: String,

    /// Ephemeral pumps remove themselves from the registry after the first
    /// delivery a listener consumed
    ephemeral: bool,

    /// Registry backreference used by ephemeral self-removal
    registry: Weak<PumpsInner>,

    /// Listeners in registration order
    listeners: RefCell<Vec<ListenerEntry>>,

    /// Mutations deferred until the outermost delivery pass ends
    pending: RefCell<Vec<PendingOp>>,

    /// Nesting depth of in-flight delivery passes on this pump
    depth: Cell<u32>,

    /// Set when any delivery since the outermost pass began was consumed
    consumed: Cell<bool>,
}

/// A named broadcast channel.
///
/// Posting a value delivers it synchronously to every listener in
/// registration order, on the posting call stack. A listener may itself post
/// to this or another pump, register listeners, or stop them: structural
/// changes to the listener list are deferred to the end of the outermost
/// delivery pass, so a listener added during delivery does not receive the
/// in-flight value, and one stopped during delivery is silenced immediately.
///
/// `Pump` is a cheap handle; clones share the same underlying channel.
/// Equality is identity of that shared state.
#[derive(Clone)]
pub struct Pump {
    inner: Rc<PumpInner>,
}

impl Pump {
    /// Create a pump attached to a registry. Registration itself is done by
    /// the registry.
    pub(crate) fn new(name: String, ephemeral: bool, registry: Weak<PumpsInner>) -> Self {
        Self {
            inner: Rc::new(PumpInner {
                name,
                ephemeral,
                registry,
                listeners: RefCell::new(Vec::new()),
                pending: RefCell::new(Vec::new()),
                depth: Cell::new(0),
                consumed: Cell::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<PumpInner>) -> Self {
        Self { inner }
    }

    /// Downgrade to a handle that does not keep the pump alive
    pub fn downgrade(&self) -> WeakPump {
        WeakPump {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Get the pump name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this pump removes itself from its registry after the first
    /// consumed delivery
    pub fn is_ephemeral(&self) -> bool {
        self.inner.ephemeral
    }

    /// Register a listener under a caller-chosen id.
    ///
    /// Listeners run in registration order. Registering during a delivery
    /// pass is allowed; the new listener only sees values posted after the
    /// current pass completes.
    pub fn listen<F>(&self, id: impl Into<String>, callback: F) -> Result<(), PumpError>
    where
        F: Fn(&Value) -> bool + 'static,
    {
        let id = id.into();
        if self.effective_ids().contains(&id) {
            return Err(PumpError::DuplicateListener {
                pump: self.inner.name.clone(),
                listener: id,
            });
        }

        let entry = ListenerEntry {
            id,
            active: Cell::new(true),
            callback: Rc::new(callback),
        };

        if self.inner.depth.get() == 0 {
            self.inner.listeners.borrow_mut().push(entry);
        } else {
            self.inner.pending.borrow_mut().push(PendingOp::Add(entry));
        }
        Ok(())
    }

    /// Register a listener whose lifetime is bound to the returned guard:
    /// dropping the guard stops the listener.
    pub fn listen_guarded<F>(
        &self,
        id: impl Into<String>,
        callback: F,
    ) -> Result<ListenerGuard, PumpError>
    where
        F: Fn(&Value) -> bool + 'static,
    {
        let id = id.into();
        self.listen(id.clone(), callback)?;
        Ok(ListenerGuard {
            pump: self.downgrade(),
            id,
        })
    }

    /// Remove a listener by id.
    ///
    /// Safe to call during delivery: the listener is silenced immediately
    /// (it will not run later in the in-flight pass) and removed from the
    /// list once the outermost pass ends. Returns whether the id was
    /// registered.
    pub fn stop_listening(&self, id: &str) -> bool {
        let existed = self.effective_ids().iter().any(|known| known == id);
        if !existed {
            return false;
        }

        if let Some(entry) = self
            .inner
            .listeners
            .borrow()
            .iter()
            .find(|entry| entry.id == id)
        {
            entry.active.set(false);
        }

        if self.inner.depth.get() == 0 {
            self.inner.listeners.borrow_mut().retain(|entry| entry.id != id);
        } else {
            self.inner
                .pending
                .borrow_mut()
                .push(PendingOp::Remove(id.to_string()));
        }
        true
    }

    /// Deliver a value to all listeners in registration order.
    ///
    /// Runs synchronously on the caller's stack. Delivery stops at the first
    /// listener that returns `true`; the return value reports whether any
    /// listener did. Reentrant posting from inside a listener is supported.
    pub fn post(&self, value: &Value) -> bool {
        self.inner.depth.set(self.inner.depth.get() + 1);

        let mut handled = false;
        let mut index = 0;
        loop {
            // Clone the callback out so no borrow is held while it runs;
            // the listener may re-enter this pump.
            let step = {
                let listeners = self.inner.listeners.borrow();
                match listeners.get(index) {
                    None => None,
                    Some(entry) if !entry.active.get() => Some(None),
                    Some(entry) => Some(Some(entry.callback.clone())),
                }
            };
            match step {
                None => break,
                Some(None) => {}
                Some(Some(callback)) => {
                    if callback(value) {
                        handled = true;
                    }
                }
            }
            if handled {
                break;
            }
            index += 1;
        }

        if handled {
            self.inner.consumed.set(true);
        }

        let depth = self.inner.depth.get() - 1;
        self.inner.depth.set(depth);
        if depth == 0 {
            self.apply_pending();
            if self.inner.consumed.replace(false) && self.inner.ephemeral {
                if let Some(registry) = self.inner.registry.upgrade() {
                    registry.remove_name(&self.inner.name);
                }
            }
        }
        handled
    }

    /// Number of currently registered listeners, counting deferred
    /// registrations and discounting deferred removals
    pub fn listener_count(&self) -> usize {
        self.effective_ids().len()
    }

    /// Listener ids as they will stand once any in-flight delivery pass ends
    fn effective_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .filter(|entry| entry.active.get())
            .map(|entry| entry.id.clone())
            .collect();
        for op in self.inner.pending.borrow().iter() {
            match op {
                PendingOp::Add(entry) => ids.push(entry.id.clone()),
                PendingOp::Remove(id) => ids.retain(|known| known != id),
            }
        }
        ids
    }

    /// Apply deferred listener-list mutations in the order they were queued
    fn apply_pending(&self) {
        let ops = std::mem::take(&mut *self.inner.pending.borrow_mut());
        if ops.is_empty() {
            return;
        }
        let mut listeners = self.inner.listeners.borrow_mut();
        for op in ops {
            match op {
                PendingOp::Add(entry) => listeners.push(entry),
                PendingOp::Remove(id) => listeners.retain(|entry| entry.id != id),
            }
        }
    }
}

impl PartialEq for Pump {
    /// Two handles are equal when they share the same underlying channel
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pump {}

impl fmt::Debug for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pump")
            .field("name", &self.inner.name)
            .field("ephemeral", &self.inner.ephemeral)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Weak counterpart of [`Pump`]: holds the channel without keeping it
/// alive. Upgrading fails once the last strong handle is gone.
#[derive(Clone)]
pub struct WeakPump {
    inner: Weak<PumpInner>,
}

impl WeakPump {
    /// Recover a strong handle while the pump is still alive
    pub fn upgrade(&self) -> Option<Pump> {
        self.inner.upgrade().map(Pump::from_inner)
    }
}

/// Binds a listener registration to a scope: dropping the guard stops the
/// listener. Outlives the pump harmlessly.
pub struct ListenerGuard {
    pump: WeakPump,
    id: String,
}

impl ListenerGuard {
    /// Id of the guarded listener
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.upgrade() {
            pump.stop_listening(&self.id);
        }
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}
