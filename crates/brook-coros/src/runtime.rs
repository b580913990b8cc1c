//! Runtime: pump registry plus cooperative coroutine scheduler
//!
//! One [`Runtime`] owns everything that used to be process-global: the pump
//! registry and the coroutine table. Tests construct one runtime per case.
//!
//! Scheduling is cooperative and single-threaded. `launch` runs a body on
//! the caller's stack until the body first suspends; from then on the
//! coroutine is resumed in place by whichever `post` or promise settlement
//! its current suspend request registered for. Delivery and resumption are
//! one step: a post does not return until the coroutine it woke reaches its
//! next suspension or settles.

use brook_events::{Pump, Pumps};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use tracing::{debug, error};

use crate::coro::{Coro, CoroHandle, CoroId, CoroRecord, CoroState};
use crate::error::EventError;

/// Callback invoked when a body's error reaches the top of a coroutine
type FailureHandler = Rc<dyn Fn(&str, &EventError)>;

/// Shared runtime state behind [`Runtime`], [`Coro`], and [`Resumer`] handles
pub(crate) struct RtInner {
    /// All pumps of this runtime
    pumps: Pumps,

    /// Live (non-terminal) coroutines
    coros: RefCell<FxHashMap<CoroId, Rc<CoroRecord>>>,

    /// Stack of coroutines currently on the call stack, innermost last
    running: RefCell<Vec<CoroId>>,

    /// Receives unhandled body failures
    failure_handler: RefCell<FailureHandler>,
}

impl RtInner {
    pub(crate) fn pumps(&self) -> &Pumps {
        &self.pumps
    }

    /// Resume a suspended coroutine in place, on the current call stack.
    ///
    /// Stale resumes (terminal or unknown coroutine) are ignored; resuming a
    /// coroutine that is already running flags it for one more poll, which
    /// covers a wakeup arriving while the coroutine is mid-poll between
    /// registering a listener and suspending.
    pub(crate) fn resume(rt: &Rc<RtInner>, id: CoroId) {
        let record = rt.coros.borrow().get(&id).cloned();
        let Some(record) = record else {
            debug!(%id, "ignoring resume for settled coroutine");
            return;
        };
        match record.state() {
            CoroState::Suspended => Self::run(rt, &record),
            CoroState::Running => record.flag_wake(),
            state => debug!(%id, ?state, "ignoring resume"),
        }
    }

    /// Poll a coroutine until it parks or settles
    fn run(rt: &Rc<RtInner>, record: &Rc<CoroRecord>) {
        record.set_state(CoroState::Running);
        rt.running.borrow_mut().push(record.id());

        let mut future = record
            .take_future()
            .expect("coroutine resumed without a stored continuation");
        let waker = Waker::from(record.wake_flag());
        let mut cx = Context::from_waker(&waker);

        let outcome = loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(result) => break Some(result),
                Poll::Pending => {
                    // A resume landed while we were polling; go again before
                    // parking.
                    if record.take_wake() {
                        continue;
                    }
                    break None;
                }
            }
        };

        rt.running.borrow_mut().pop();

        match outcome {
            None => {
                record.store_future(future);
                record.set_state(CoroState::Suspended);
            }
            Some(Ok(())) => {
                record.set_state(CoroState::Completed);
                rt.coros.borrow_mut().remove(&record.id());
                debug!(coroutine = %record.name(), "coroutine completed");
            }
            Some(Err(err)) => {
                record.set_state(CoroState::Failed);
                rt.coros.borrow_mut().remove(&record.id());
                debug!(coroutine = %record.name(), error = %err, "coroutine failed");
                // Handler runs after bookkeeping is settled so it may launch
                // or post freely.
                let handler = rt.failure_handler.borrow().clone();
                handler(record.name(), &err);
            }
        }
    }

    /// First free coroutine name for the hint among live coroutines
    fn invent_coro_name(&self, hint: &str) -> String {
        let base = if hint.is_empty() { "coro" } else { hint };
        let coros = self.coros.borrow();
        let taken = |name: &str| coros.values().any(|record| record.name() == name);
        if !taken(base) {
            return base.to_string();
        }
        let mut suffix = 1u64;
        loop {
            let candidate = format!("{base}{suffix}");
            if !taken(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

/// An owned runtime context: event pumps plus the coroutine scheduler.
///
/// `Runtime` is a cheap handle; clones share the same state. All handles,
/// pumps, and coroutines of one runtime must stay on one thread.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RtInner>,
}

impl Runtime {
    /// Create a new runtime with an empty pump registry and no coroutines.
    ///
    /// The initial failure handler logs at error level; replace it with
    /// [`Runtime::set_failure_handler`].
    pub fn new() -> Self {
        let handler: FailureHandler = Rc::new(|name, err| {
            error!(coroutine = %name, error = %err, "unhandled coroutine failure");
        });
        Self {
            inner: Rc::new(RtInner {
                pumps: Pumps::new(),
                coros: RefCell::new(FxHashMap::default()),
                running: RefCell::new(Vec::new()),
                failure_handler: RefCell::new(handler),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RtInner>) -> Self {
        Self { inner }
    }

    /// The pump registry of this runtime
    pub fn pumps(&self) -> &Pumps {
        &self.inner.pumps
    }

    /// Shorthand for `pumps().obtain(name)`
    pub fn obtain(&self, name: &str) -> Pump {
        self.inner.pumps.obtain(name)
    }

    /// Launch a coroutine and run it on this call stack until it first
    /// suspends or settles.
    ///
    /// The body receives a [`Coro`] handle carrying the suspend-point
    /// adapters. The coroutine gets a unique name derived from the hint
    /// (numeric suffix on collision with a live coroutine; empty hint
    /// defaults to `"coro"`). An `Err` returned by the body marks the
    /// coroutine `Failed` and is passed to the failure handler.
    pub fn launch<F, Fut>(&self, name_hint: &str, body: F) -> CoroHandle
    where
        F: FnOnce(Coro) -> Fut,
        Fut: Future<Output = Result<(), EventError>> + 'static,
    {
        let id = CoroId::new();
        let name = self.inner.invent_coro_name(name_hint);
        let record = Rc::new(CoroRecord::new(id, name.clone()));

        let coro = Coro {
            rt: Rc::downgrade(&self.inner),
            id,
            name: name.clone(),
        };
        record.store_future(Box::pin(body(coro)));
        self.inner.coros.borrow_mut().insert(id, record.clone());

        debug!(coroutine = %name, "launching coroutine");
        RtInner::run(&self.inner, &record);
        CoroHandle::new(record)
    }

    /// Replace the unhandled-failure handler.
    ///
    /// The handler receives the coroutine name and the error that escaped
    /// its body. It runs on the stack that drove the coroutine to failure.
    pub fn set_failure_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &EventError) + 'static,
    {
        *self.inner.failure_handler.borrow_mut() = Rc::new(handler);
    }

    /// Number of live (non-terminal) coroutines
    pub fn coro_count(&self) -> usize {
        self.inner.coros.borrow().len()
    }

    /// Names of all live coroutines, in no particular order
    pub fn active_names(&self) -> Vec<String> {
        self.inner
            .coros
            .borrow()
            .values()
            .map(|record| record.name().to_string())
            .collect()
    }

    /// Name of the innermost coroutine on the call stack, if any
    pub fn current_name(&self) -> Option<String> {
        let id = *self.inner.running.borrow().last()?;
        self.inner
            .coros
            .borrow()
            .get(&id)
            .map(|record| record.name().to_string())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("coros", &self.coro_count())
            .field("pumps", &self.inner.pumps.len())
            .finish()
    }
}

/// Resumes one specific coroutine; captured by suspend-request listeners
/// and promise settlements. Holds the runtime weakly, so a resumer whose
/// runtime is gone becomes a no-op.
#[derive(Clone)]
pub(crate) struct Resumer {
    rt: Weak<RtInner>,
    id: CoroId,
}

impl Resumer {
    pub(crate) fn new(rt: Weak<RtInner>, id: CoroId) -> Self {
        Self { rt, id }
    }

    pub(crate) fn resume(&self) {
        if let Some(rt) = self.rt.upgrade() {
            RtInner::resume(&rt, self.id);
        }
    }
}
