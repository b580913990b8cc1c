//! Brook coroutine runtime
//!
//! Cooperative coroutines that rendezvous with named event pumps:
//!
//! - **Runtime** owns the pump registry and the coroutine table; `launch`
//!   runs a body on the caller's stack up to its first suspension
//!   (`runtime` module)
//! - **Suspend-point adapters** park a coroutine on one pump, or race a
//!   reply pump against an error pump with first-responder-wins semantics
//!   (`suspend` module)
//! - **Promise** bridges arbitrary one-shot callbacks into a suspension
//!   (`promise` module)
//! - **Coprocedure pools** serve queued jobs with fixed sets of worker
//!   coroutines (`pool` module)
//!
//! Delivery and resumption are one step: posting a value runs the waiting
//! coroutine in place, and the post returns only once that coroutine has
//! parked again or settled. The whole runtime is single-threaded and
//! `Rc`-backed; a `Runtime` and everything launched on it stay on one
//! thread.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod coro;
pub mod error;
pub mod pool;
pub mod promise;
pub mod runtime;
pub mod suspend;

// ============================================================================
// Re-exports: scheduler core
// ============================================================================

pub use coro::{Coro, CoroHandle, CoroId, CoroState};
pub use error::EventError;
pub use runtime::Runtime;

// ============================================================================
// Re-exports: suspend-point adapters and promise bridge
// ============================================================================

pub use promise::{Promise, PromiseError};
pub use suspend::{error_exception, error_log, PumpOrName, ReplyPump, ReplyPumps, Which};

// ============================================================================
// Re-exports: coprocedure pools
// ============================================================================

pub use pool::{
    CoroPool, CoroPools, JobId, PoolError, PoolSettings, APP_STATUS_PUMP, DEFAULT_POOL_SIZE,
    DEFAULT_QUEUE_SIZE,
};

// ============================================================================
// Re-exports: event bus
// ============================================================================

pub use brook_events::{ListenerFn, ListenerGuard, Pump, PumpError, Pumps, Value, WeakPump};
