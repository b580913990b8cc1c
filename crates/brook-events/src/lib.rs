//! Brook event bus
//!
//! Named broadcast channels ("pumps") with synchronous, reentrancy-safe
//! delivery:
//! - **Pump**: an ordered list of listeners; posting delivers the value to
//!   each in registration order, short-circuiting when one consumes it
//!   (`pump` module)
//! - **Pumps**: the per-runtime registry resolving names to channels, with
//!   idempotent `obtain` and generated unique names (`registry` module)
//!
//! Values are [`serde_json::Value`]; a listener is any `Fn(&Value) -> bool`
//! where returning `true` stops further propagation. Delivery happens on the
//! posting call stack, so a listener may itself post, register, or remove
//! listeners; structural mutation of a listener list is deferred past the
//! delivery pass in flight.
//!
//! The bus assumes single-threaded reentrancy. Handles are `Rc`-backed and
//! must not cross threads.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod pump;
mod registry;

pub use pump::{ListenerFn, ListenerGuard, Pump, PumpError, WeakPump};
pub use registry::Pumps;

/// Structured event payload type carried by every pump
pub use serde_json::Value;
