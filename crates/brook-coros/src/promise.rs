//! Promise/future bridge: suspend on a foreign callback instead of a pump
//!
//! A [`Promise`] is a one-shot, single-value handoff slot. The producing
//! side (any callback on this thread) calls [`Promise::set_value`] exactly
//! once; the consuming coroutine parks on [`Promise::wait`] and is resumed
//! in place by the settlement, with the same same-step semantics as a pump
//! post. A promise settled before the wait begins delivers immediately,
//! without suspending.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;

use crate::coro::Coro;
use crate::runtime::Resumer;

/// Promise misuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// `set_value` was called on an already settled promise
    #[error("promise already settled")]
    DoubleSettlement,
}

enum PromiseState<T> {
    /// No value yet, nobody waiting
    Unset,
    /// A coroutine is parked on the paired wait
    Waiting(Resumer),
    /// Value stored, not yet collected
    Ready(T),
    /// Value handed to the waiter
    Delivered,
}

/// One-shot handoff slot between a callback and a suspending coroutine.
///
/// Clones share the settlement state: hand one clone to the producer and
/// keep one for the waiting coroutine. Single-threaded, like the rest of
/// the runtime.
pub struct Promise<T> {
    state: Rc<RefCell<PromiseState<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Create an unsettled promise
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(PromiseState::Unset)),
        }
    }

    /// True once a value has been set, whether or not it was collected
    pub fn is_settled(&self) -> bool {
        matches!(
            &*self.state.borrow(),
            PromiseState::Ready(_) | PromiseState::Delivered
        )
    }

    /// Settle the promise.
    ///
    /// If a coroutine is parked on [`Promise::wait`], it resumes on this
    /// call stack before `set_value` returns. Settling twice fails with
    /// [`PromiseError::DoubleSettlement`].
    pub fn set_value(&self, value: T) -> Result<(), PromiseError> {
        let mut state = self.state.borrow_mut();
        if matches!(&*state, PromiseState::Ready(_) | PromiseState::Delivered) {
            return Err(PromiseError::DoubleSettlement);
        }
        let prev = std::mem::replace(&mut *state, PromiseState::Ready(value));
        // Release the borrow before resuming; the waiter's poll reborrows.
        drop(state);
        if let PromiseState::Waiting(resumer) = prev {
            resumer.resume();
        }
        Ok(())
    }

    /// Collect the value, parking `co` until the promise settles.
    ///
    /// A promise settled beforehand returns immediately. The value is
    /// delivered exactly once; a promise supports a single waiter, and
    /// waiting again after delivery panics.
    pub async fn wait(&self, co: &Coro) -> T {
        {
            let mut state = self.state.borrow_mut();
            match &*state {
                PromiseState::Unset => *state = PromiseState::Waiting(co.resumer()),
                PromiseState::Ready(_) => {}
                PromiseState::Waiting(_) => panic!("promise already has a waiting coroutine"),
                PromiseState::Delivered => panic!("promise value already collected"),
            }
        }
        PromiseWait {
            state: self.state.clone(),
        }
        .await
    }
}

/// Future half of [`Promise::wait`]; resolution is driven by the
/// settlement through the runtime's resume path.
struct PromiseWait<T> {
    state: Rc<RefCell<PromiseState<T>>>,
}

impl<T> Future for PromiseWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        match std::mem::replace(&mut *state, PromiseState::Delivered) {
            PromiseState::Ready(value) => Poll::Ready(value),
            other => {
                *state = other;
                Poll::Pending
            }
        }
    }
}
