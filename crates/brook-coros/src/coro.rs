//! Coroutine identity, state, and bookkeeping records

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Wake;

use crate::error::EventError;
use crate::runtime::{Resumer, RtInner, Runtime};

/// The stored continuation of a coroutine between suspension points
pub(crate) type BodyFuture = Pin<Box<dyn Future<Output = Result<(), EventError>>>>;

/// Unique identifier for a coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CoroId(u64);

impl CoroId {
    /// Create a new unique coroutine ID
    pub fn new() -> Self {
        static NEXT_CORO_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_CORO_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CoroId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CoroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coro-{}", self.0)
    }
}

/// Lifecycle state of a coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroState {
    /// Created but not yet run
    Ready,
    /// On the active call stack right now
    Running,
    /// Parked at a suspension point awaiting its registered wakeup
    Suspended,
    /// Body returned normally; never runs again
    Completed,
    /// Body returned an unhandled error; never runs again
    Failed,
}

impl CoroState {
    /// Whether the coroutine can never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, CoroState::Completed | CoroState::Failed)
    }
}

/// Wake flag backing a coroutine's `std::task::Waker`.
///
/// Resumption is normally driven directly by a pump listener or promise
/// settlement, not by the waker; the flag covers futures that wake
/// themselves mid-poll, signalling the poll loop to run once more before
/// parking the coroutine.
pub(crate) struct WakeFlag {
    notified: AtomicBool,
}

impl WakeFlag {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            notified: AtomicBool::new(false),
        })
    }

    /// Request one more poll
    pub(crate) fn notify(&self) {
        self.notified.store(true, Ordering::SeqCst);
    }

    /// Consume a pending notification
    pub(crate) fn take(&self) -> bool {
        self.notified.swap(false, Ordering::SeqCst)
    }
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify();
    }
}

/// Scheduler-side record of one coroutine
pub(crate) struct CoroRecord {
    /// Unique coroutine ID
    id: CoroId,

    /// Unique name within the runtime, derived from the launch hint
    name: String,

    /// Current lifecycle state
    state: Cell<CoroState>,

    /// The continuation, present exactly while the coroutine is not on the
    /// active call stack and not terminal
    future: RefCell<Option<BodyFuture>>,

    /// Re-poll flag for mid-poll wakeups
    wake: Arc<WakeFlag>,
}

impl CoroRecord {
    pub(crate) fn new(id: CoroId, name: String) -> Self {
        Self {
            id,
            name,
            state: Cell::new(CoroState::Ready),
            future: RefCell::new(None),
            wake: WakeFlag::new(),
        }
    }

    pub(crate) fn id(&self) -> CoroId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> CoroState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: CoroState) {
        debug_assert!(
            !self.state.get().is_terminal(),
            "coroutine {} already settled",
            self.name
        );
        self.state.set(state);
    }

    pub(crate) fn store_future(&self, future: BodyFuture) {
        *self.future.borrow_mut() = Some(future);
    }

    pub(crate) fn take_future(&self) -> Option<BodyFuture> {
        self.future.borrow_mut().take()
    }

    pub(crate) fn wake_flag(&self) -> Arc<WakeFlag> {
        self.wake.clone()
    }

    /// Flag the coroutine for one more poll (resume arrived mid-poll)
    pub(crate) fn flag_wake(&self) {
        self.wake.notify();
    }

    pub(crate) fn take_wake(&self) -> bool {
        self.wake.take()
    }
}

/// Launcher-side handle to a coroutine.
///
/// Stays valid after the coroutine settles; terminal state and name remain
/// readable.
pub struct CoroHandle {
    record: Rc<CoroRecord>,
}

impl CoroHandle {
    pub(crate) fn new(record: Rc<CoroRecord>) -> Self {
        Self { record }
    }

    /// Coroutine ID
    pub fn id(&self) -> CoroId {
        self.record.id()
    }

    /// Unique coroutine name
    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CoroState {
        self.record.state()
    }

    /// Whether the coroutine has settled (completed or failed)
    pub fn is_terminal(&self) -> bool {
        self.record.state().is_terminal()
    }
}

impl fmt::Debug for CoroHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroHandle")
            .field("id", &self.record.id())
            .field("name", &self.record.name())
            .field("state", &self.record.state())
            .finish()
    }
}

/// In-body handle to the current coroutine.
///
/// Passed to every coroutine body; the suspend-point adapters hang off it.
/// Holds the runtime weakly, so a body never keeps its own runtime alive.
#[derive(Clone)]
pub struct Coro {
    pub(crate) rt: Weak<RtInner>,
    pub(crate) id: CoroId,
    pub(crate) name: String,
}

impl Coro {
    /// Coroutine ID
    pub fn id(&self) -> CoroId {
        self.id
    }

    /// Unique coroutine name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime this coroutine belongs to
    pub fn runtime(&self) -> Runtime {
        Runtime::from_inner(self.rt_inner())
    }

    pub(crate) fn rt_inner(&self) -> Rc<RtInner> {
        self.rt
            .upgrade()
            .expect("coroutine used after its Runtime was dropped")
    }

    pub(crate) fn resumer(&self) -> Resumer {
        Resumer::new(self.rt.clone(), self.id)
    }
}

impl fmt::Debug for Coro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coro")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
