//! Registry of named event pumps

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

use crate::pump::{Pump, PumpError};

/// Shared registry state, reachable from pumps for ephemeral self-removal
pub(crate) struct PumpsInner {
    /// Map of pump name to pump handle
    pumps: RefCell<FxHashMap<String, Pump>>,
}

impl PumpsInner {
    /// Drop a pump by name; used by ephemeral pumps once their delivery has
    /// been consumed
    pub(crate) fn remove_name(&self, name: &str) -> bool {
        let removed = self.pumps.borrow_mut().remove(name).is_some();
        if removed {
            debug!(pump = %name, "removed event pump");
        }
        removed
    }
}

/// Registry of named pumps.
///
/// All pumps of one runtime live here; names are unique within a registry.
/// `Pumps` is a cheap handle; clones share the same registry.
#[derive(Clone)]
pub struct Pumps {
    inner: Rc<PumpsInner>,
}

impl Pumps {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            inner: Rc::new(PumpsInner {
                pumps: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    /// Return the pump with this exact name, creating it if absent.
    ///
    /// Idempotent by name: two calls with the same name return handles to
    /// the same underlying channel.
    pub fn obtain(&self, name: &str) -> Pump {
        if let Some(pump) = self.get(name) {
            return pump;
        }
        self.insert(name.to_string(), false)
    }

    /// Create a pump with this exact name, failing if the name is taken
    pub fn create(&self, name: &str) -> Result<Pump, PumpError> {
        if self.contains(name) {
            return Err(PumpError::DuplicatePump(name.to_string()));
        }
        Ok(self.insert(name.to_string(), false))
    }

    /// Create a pump with a unique name derived from the hint.
    ///
    /// The hint is used as-is when free, otherwise a numeric suffix is
    /// appended. An empty hint defaults to `"pump"`.
    pub fn make(&self, hint: &str) -> Pump {
        let name = self.invent_name(hint);
        self.insert(name, false)
    }

    /// Like [`Pumps::make`], but the pump removes itself from this registry
    /// after the first delivery one of its listeners consumes
    pub fn make_ephemeral(&self, hint: &str) -> Pump {
        let name = self.invent_name(hint);
        self.insert(name, true)
    }

    /// Look up a pump by name without creating it
    pub fn get(&self, name: &str) -> Option<Pump> {
        self.inner.pumps.borrow().get(name).cloned()
    }

    /// Remove a pump from the registry.
    ///
    /// Outstanding handles to the pump keep working; the name becomes free
    /// for reuse. Returns whether the name was registered.
    pub fn remove(&self, name: &str) -> bool {
        self.inner.remove_name(name)
    }

    /// Whether a pump with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.inner.pumps.borrow().contains_key(name)
    }

    /// Number of registered pumps
    pub fn len(&self) -> usize {
        self.inner.pumps.borrow().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.inner.pumps.borrow().is_empty()
    }

    /// Names of all registered pumps, in no particular order
    pub fn names(&self) -> Vec<String> {
        self.inner.pumps.borrow().keys().cloned().collect()
    }

    /// Drop every pump (for teardown)
    pub fn clear(&self) {
        self.inner.pumps.borrow_mut().clear();
    }

    fn insert(&self, name: String, ephemeral: bool) -> Pump {
        let pump = Pump::new(name.clone(), ephemeral, Rc::downgrade(&self.inner));
        debug!(pump = %name, ephemeral, "created event pump");
        self.inner.pumps.borrow_mut().insert(name, pump.clone());
        pump
    }

    /// First free name for the hint: the hint itself, then `hint1`, `hint2`...
    fn invent_name(&self, hint: &str) -> String {
        let base = if hint.is_empty() { "pump" } else { hint };
        if !self.contains(base) {
            return base.to_string();
        }
        let mut suffix = 1u64;
        loop {
            let candidate = format!("{base}{suffix}");
            if !self.contains(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

impl Default for Pumps {
    fn default() -> Self {
        Self::new()
    }
}
