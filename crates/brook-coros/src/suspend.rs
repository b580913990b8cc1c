//! Suspend-point adapters: the rendezvous between coroutines and pumps
//!
//! Each adapter registers the calling coroutine as a one-shot listener on
//! one or two pumps, parks the coroutine, and hands back the first value
//! delivered. Registration happens before any posting, so a responder that
//! replies synchronously inside the request post never races the wait: the
//! delivered value lands in the shared slot and the coroutine picks it up
//! at its next poll without ever missing the wakeup.
//!
//! Two-pump waits resolve first-responder-wins: the winning listener
//! silences its sibling before the coroutine resumes, so a late post on the
//! losing pump finds nobody listening.

use brook_events::{Pump, Pumps, WeakPump};
use serde_json::Value;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tracing::{debug, error};

use crate::coro::Coro;
use crate::error::EventError;
use crate::runtime::{Resumer, Runtime};

/// Tags which channel of a two-pump wait produced the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    /// The reply channel (index 0)
    Reply,
    /// The error channel (index 1)
    Error,
}

impl Which {
    /// Channel index: 0 for reply, 1 for error
    pub fn index(self) -> usize {
        match self {
            Which::Reply => 0,
            Which::Error => 1,
        }
    }

    /// True when the value arrived on the error channel
    pub fn is_error(self) -> bool {
        matches!(self, Which::Error)
    }
}

/// Accepted wherever an adapter names a pump: pass a [`Pump`] you already
/// hold, or a name to be resolved (creating the pump if needed) through the
/// runtime's registry.
pub trait PumpOrName {
    /// Resolve to a concrete pump in `pumps`
    fn resolve(&self, pumps: &Pumps) -> Pump;
}

impl PumpOrName for Pump {
    fn resolve(&self, _pumps: &Pumps) -> Pump {
        self.clone()
    }
}

impl PumpOrName for str {
    fn resolve(&self, pumps: &Pumps) -> Pump {
        pumps.obtain(self)
    }
}

impl PumpOrName for String {
    fn resolve(&self, pumps: &Pumps) -> Pump {
        pumps.obtain(self)
    }
}

impl<P: PumpOrName + ?Sized> PumpOrName for &P {
    fn resolve(&self, pumps: &Pumps) -> Pump {
        (**self).resolve(pumps)
    }
}

/// Future half of a suspend request.
///
/// Resolution is driven by the listener through the runtime's resume path,
/// not by the task waker; a poll simply checks whether the slot was filled.
struct SlotWait<T> {
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> SlotWait<T> {
    fn new(slot: Rc<RefCell<Option<T>>>) -> Self {
        Self { slot }
    }
}

impl<T> Future for SlotWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        match self.slot.borrow_mut().take() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

static NEXT_WAIT_ID: AtomicU64 = AtomicU64::new(1);

/// Listener id for one suspend request; the counter keeps ids unique even
/// across back-to-back waits by the same coroutine on the same pump.
fn wait_id(coro_name: &str, tag: &str) -> String {
    let n = NEXT_WAIT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{coro_name}.{tag}{n}")
}

/// Copy of `request` with `key` set to `name`. Non-object requests are
/// replaced by a one-key object, matching structured-value map assignment.
fn stamp(request: &Value, key: &str, name: &str) -> Value {
    let mut stamped = request.clone();
    match &mut stamped {
        Value::Object(map) => {
            map.insert(key.to_string(), Value::String(name.to_string()));
        }
        _ => {
            let mut map = serde_json::Map::new();
            map.insert(key.to_string(), Value::String(name.to_string()));
            stamped = Value::Object(map);
        }
    }
    stamped
}

/// Register a one-shot listener that fills `slot` and resumes the waiter.
///
/// The slot guard keeps a second post ahead of the coroutine's next poll
/// from overwriting the first value.
fn listen_for_value(pump: &Pump, id: &str, slot: Rc<RefCell<Option<Value>>>, resumer: Resumer) {
    pump.listen(id, move |value: &Value| {
        {
            let mut cell = slot.borrow_mut();
            if cell.is_some() {
                return false;
            }
            *cell = Some(value.clone());
        }
        resumer.resume();
        true
    })
    .expect("suspend listener ids are unique");
}

/// One side of a two-pump wait. Winning silences the sibling listener
/// before resuming, so the loser cannot fire for this request. The
/// sibling is held weakly; a parked pair must not keep itself alive
/// through its own listeners.
fn listen_for_race(
    pump: &Pump,
    id: &str,
    which: Which,
    sibling: WeakPump,
    sibling_id: String,
    slot: Rc<RefCell<Option<(Value, Which)>>>,
    resumer: Resumer,
) {
    pump.listen(id, move |value: &Value| {
        {
            let mut cell = slot.borrow_mut();
            if cell.is_some() {
                return false;
            }
            if let Some(sibling) = sibling.upgrade() {
                sibling.stop_listening(&sibling_id);
            }
            *cell = Some((value.clone(), which));
        }
        resumer.resume();
        true
    })
    .expect("suspend listener ids are unique");
}

impl Coro {
    /// Park this coroutine until a value is posted on `pump`, and return
    /// that value.
    ///
    /// The value must eventually arrive; there is no built-in timeout.
    pub async fn suspend_until_event_on(&self, pump: impl PumpOrName) -> Value {
        // Resolve inside a block; a runtime handle held across the park
        // is a cycle through the coroutine table.
        let pump = {
            let rt = self.rt_inner();
            pump.resolve(rt.pumps())
        };
        let id = wait_id(self.name(), "wait");
        let slot = Rc::new(RefCell::new(None));

        listen_for_value(&pump, &id, slot.clone(), self.resumer());
        debug!(coroutine = %self.name(), pump = %pump.name(), "suspending on pump");

        let value = SlotWait::new(slot).await;
        pump.stop_listening(&id);
        value
    }

    /// Stamp `request[reply_key]` with the reply pump's name, post the
    /// request, and park until the reply arrives.
    ///
    /// The reply listener is registered before the post, so a responder
    /// replying synchronously inside the post is handled correctly.
    pub async fn post_and_suspend(
        &self,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_pump: impl PumpOrName,
        reply_key: &str,
    ) -> Value {
        let (request_pump, reply_pump) = {
            let rt = self.rt_inner();
            (
                request_pump.resolve(rt.pumps()),
                reply_pump.resolve(rt.pumps()),
            )
        };
        let id = wait_id(self.name(), "reply");
        let slot = Rc::new(RefCell::new(None));

        listen_for_value(&reply_pump, &id, slot.clone(), self.resumer());

        let stamped = stamp(request, reply_key, reply_pump.name());
        debug!(
            coroutine = %self.name(),
            request = %request_pump.name(),
            reply = %reply_pump.name(),
            "posting request and suspending"
        );
        request_pump.post(&stamped);

        let value = SlotWait::new(slot).await;
        reply_pump.stop_listening(&id);
        value
    }

    /// Park until either pump fires; first responder wins. Returns the
    /// value and which channel delivered it. The losing listener is
    /// deregistered before this coroutine resumes.
    pub async fn suspend_until_event_on2(
        &self,
        reply_pump: impl PumpOrName,
        error_pump: impl PumpOrName,
    ) -> (Value, Which) {
        let (reply_pump, error_pump) = {
            let rt = self.rt_inner();
            (
                reply_pump.resolve(rt.pumps()),
                error_pump.resolve(rt.pumps()),
            )
        };
        let reply_id = wait_id(self.name(), "reply");
        let error_id = wait_id(self.name(), "error");
        let slot = Rc::new(RefCell::new(None));

        listen_for_race(
            &reply_pump,
            &reply_id,
            Which::Reply,
            error_pump.downgrade(),
            error_id.clone(),
            slot.clone(),
            self.resumer(),
        );
        listen_for_race(
            &error_pump,
            &error_id,
            Which::Error,
            reply_pump.downgrade(),
            reply_id.clone(),
            slot.clone(),
            self.resumer(),
        );
        debug!(
            coroutine = %self.name(),
            reply = %reply_pump.name(),
            error = %error_pump.name(),
            "suspending on reply/error pair"
        );

        let result = SlotWait::new(slot).await;
        reply_pump.stop_listening(&reply_id);
        error_pump.stop_listening(&error_id);
        result
    }

    /// Stamp both pump names into the request, post it, and race the
    /// reply pump against the error pump.
    #[allow(clippy::too_many_arguments)]
    pub async fn post_and_suspend2(
        &self,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_pump: impl PumpOrName,
        reply_key: &str,
        error_pump: impl PumpOrName,
        error_key: &str,
    ) -> (Value, Which) {
        let (request_pump, reply_pump, error_pump) = {
            let rt = self.rt_inner();
            (
                request_pump.resolve(rt.pumps()),
                reply_pump.resolve(rt.pumps()),
                error_pump.resolve(rt.pumps()),
            )
        };
        let reply_id = wait_id(self.name(), "reply");
        let error_id = wait_id(self.name(), "error");
        let slot = Rc::new(RefCell::new(None));

        listen_for_race(
            &reply_pump,
            &reply_id,
            Which::Reply,
            error_pump.downgrade(),
            error_id.clone(),
            slot.clone(),
            self.resumer(),
        );
        listen_for_race(
            &error_pump,
            &error_id,
            Which::Error,
            reply_pump.downgrade(),
            reply_id.clone(),
            slot.clone(),
            self.resumer(),
        );

        let stamped = stamp(
            &stamp(request, reply_key, reply_pump.name()),
            error_key,
            error_pump.name(),
        );
        debug!(
            coroutine = %self.name(),
            request = %request_pump.name(),
            reply = %reply_pump.name(),
            error = %error_pump.name(),
            "posting request and suspending on reply/error pair"
        );
        request_pump.post(&stamped);

        let result = SlotWait::new(slot).await;
        reply_pump.stop_listening(&reply_id);
        error_pump.stop_listening(&error_id);
        result
    }

    /// [`suspend_until_event_on2`](Coro::suspend_until_event_on2) with the
    /// error channel converted to `Err` via [`error_exception`].
    pub async fn suspend_until_event_on2_with_exception(
        &self,
        reply_pump: impl PumpOrName,
        error_pump: impl PumpOrName,
        context: &str,
    ) -> Result<Value, EventError> {
        let result = self.suspend_until_event_on2(reply_pump, error_pump).await;
        error_exception(result, context)
    }

    /// [`suspend_until_event_on2`](Coro::suspend_until_event_on2) with the
    /// error channel logged and escalated via [`error_log`].
    pub async fn suspend_until_event_on2_with_log(
        &self,
        reply_pump: impl PumpOrName,
        error_pump: impl PumpOrName,
        context: &str,
    ) -> Result<Value, EventError> {
        let result = self.suspend_until_event_on2(reply_pump, error_pump).await;
        error_log(result, context)
    }

    /// [`post_and_suspend2`](Coro::post_and_suspend2) with the error
    /// channel converted to `Err` via [`error_exception`].
    #[allow(clippy::too_many_arguments)]
    pub async fn post_and_suspend2_with_exception(
        &self,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_pump: impl PumpOrName,
        reply_key: &str,
        error_pump: impl PumpOrName,
        error_key: &str,
        context: &str,
    ) -> Result<Value, EventError> {
        let result = self
            .post_and_suspend2(
                request,
                request_pump,
                reply_pump,
                reply_key,
                error_pump,
                error_key,
            )
            .await;
        error_exception(result, context)
    }

    /// [`post_and_suspend2`](Coro::post_and_suspend2) with the error
    /// channel logged and escalated via [`error_log`].
    #[allow(clippy::too_many_arguments)]
    pub async fn post_and_suspend2_with_log(
        &self,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_pump: impl PumpOrName,
        reply_key: &str,
        error_pump: impl PumpOrName,
        error_key: &str,
        context: &str,
    ) -> Result<Value, EventError> {
        let result = self
            .post_and_suspend2(
                request,
                request_pump,
                reply_pump,
                reply_key,
                error_pump,
                error_key,
            )
            .await;
        error_log(result, context)
    }
}

/// Pass the reply channel through; turn the error channel into a catchable
/// [`EventError::ErrorEvent`] carrying the payload.
pub fn error_exception(result: (Value, Which), context: &str) -> Result<Value, EventError> {
    let (value, which) = result;
    match which {
        Which::Reply => Ok(value),
        Which::Error => Err(EventError::ErrorEvent {
            context: context.to_string(),
            data: value,
        }),
    }
}

/// Pass the reply channel through; log the error channel and escalate it
/// as non-recoverable [`EventError::Fatal`].
pub fn error_log(result: (Value, Which), context: &str) -> Result<Value, EventError> {
    let (value, which) = result;
    match which {
        Which::Reply => Ok(value),
        Which::Error => {
            error!(context = %context, payload = %value, "fatal error event");
            Err(EventError::Fatal {
                context: context.to_string(),
                data: value,
            })
        }
    }
}

/// Owns one uniquely named pump for receiving replies; the pump is removed
/// from the registry when this helper drops.
pub struct ReplyPump {
    pump: Pump,
    pumps: Pumps,
}

impl ReplyPump {
    /// Create a reply pump with a unique name in `rt`'s registry
    pub fn new(rt: &Runtime) -> Self {
        Self {
            pump: rt.pumps().make("reply"),
            pumps: rt.pumps().clone(),
        }
    }

    /// The generated pump name; hand this to whoever should post the reply
    pub fn name(&self) -> &str {
        self.pump.name()
    }

    /// The owned pump
    pub fn pump(&self) -> &Pump {
        &self.pump
    }

    /// Park `co` until a value is posted on this pump
    pub async fn suspend(&self, co: &Coro) -> Value {
        co.suspend_until_event_on(&self.pump).await
    }

    /// Post `request` stamped with this pump's name under `reply_key`,
    /// then park `co` for the reply
    pub async fn post_and_suspend(
        &self,
        co: &Coro,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_key: &str,
    ) -> Value {
        co.post_and_suspend(request, request_pump, &self.pump, reply_key)
            .await
    }
}

impl Drop for ReplyPump {
    fn drop(&mut self) {
        self.pumps.remove(self.pump.name());
    }
}

/// Owns a reply/error pump pair for two-channel waits; both pumps are
/// removed from the registry when this helper drops.
pub struct ReplyPumps {
    reply: Pump,
    error: Pump,
    pumps: Pumps,
}

impl ReplyPumps {
    /// Create a reply/error pump pair with unique names in `rt`'s registry
    pub fn new(rt: &Runtime) -> Self {
        Self {
            reply: rt.pumps().make("reply"),
            error: rt.pumps().make("error"),
            pumps: rt.pumps().clone(),
        }
    }

    /// Name of the reply pump (channel 0)
    pub fn name0(&self) -> &str {
        self.reply.name()
    }

    /// Name of the error pump (channel 1)
    pub fn name1(&self) -> &str {
        self.error.name()
    }

    /// The reply pump
    pub fn reply(&self) -> &Pump {
        &self.reply
    }

    /// The error pump
    pub fn error(&self) -> &Pump {
        &self.error
    }

    /// Park `co` until either pump fires
    pub async fn suspend(&self, co: &Coro) -> (Value, Which) {
        co.suspend_until_event_on2(&self.reply, &self.error).await
    }

    /// [`suspend`](ReplyPumps::suspend) with the [`error_exception`] policy
    pub async fn suspend_with_exception(
        &self,
        co: &Coro,
        context: &str,
    ) -> Result<Value, EventError> {
        co.suspend_until_event_on2_with_exception(&self.reply, &self.error, context)
            .await
    }

    /// [`suspend`](ReplyPumps::suspend) with the [`error_log`] policy
    pub async fn suspend_with_log(&self, co: &Coro, context: &str) -> Result<Value, EventError> {
        co.suspend_until_event_on2_with_log(&self.reply, &self.error, context)
            .await
    }

    /// Post `request` stamped with both pump names, then park `co` for the
    /// first response
    pub async fn post_and_suspend(
        &self,
        co: &Coro,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_key: &str,
        error_key: &str,
    ) -> (Value, Which) {
        co.post_and_suspend2(
            request,
            request_pump,
            &self.reply,
            reply_key,
            &self.error,
            error_key,
        )
        .await
    }

    /// [`post_and_suspend`](ReplyPumps::post_and_suspend) with the
    /// [`error_exception`] policy
    #[allow(clippy::too_many_arguments)]
    pub async fn post_and_suspend_with_exception(
        &self,
        co: &Coro,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_key: &str,
        error_key: &str,
        context: &str,
    ) -> Result<Value, EventError> {
        co.post_and_suspend2_with_exception(
            request,
            request_pump,
            &self.reply,
            reply_key,
            &self.error,
            error_key,
            context,
        )
        .await
    }

    /// [`post_and_suspend`](ReplyPumps::post_and_suspend) with the
    /// [`error_log`] policy
    #[allow(clippy::too_many_arguments)]
    pub async fn post_and_suspend_with_log(
        &self,
        co: &Coro,
        request: &Value,
        request_pump: impl PumpOrName,
        reply_key: &str,
        error_key: &str,
        context: &str,
    ) -> Result<Value, EventError> {
        co.post_and_suspend2_with_log(
            request,
            request_pump,
            &self.reply,
            reply_key,
            &self.error,
            error_key,
            context,
        )
        .await
    }
}

impl Drop for ReplyPumps {
    fn drop(&mut self) {
        self.pumps.remove(self.reply.name());
        self.pumps.remove(self.error.name());
    }
}
