// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-assignment promises.
//!
//! A [`Deferred`] is the write side of a single-assignment cell, a [`Promise`] the read side.
//! Subscribers attached to a promise are notified in subscription order, always through
//! [`Schedule::queue`][crate::scheduler::Schedule::queue] and never inline, so no subscriber
//! can ever run on the stack of the code resolving the cell.
//!
//! Promises are plain Rust futures too: awaiting a `Promise<T>` yields its `Result<T, Error>`.

mod completions;
mod join;
mod state;

use crate::coroutine::budget;
use crate::error::{Error, UsageError};
use crate::scheduler::Handle;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::rc::Rc;

pub use completions::Completions;
pub use join::{Join, join_all};
pub(crate) use state::is_promise;
pub use state::{State, SubscriptionId};

/// The read side of a single-assignment cell.
pub struct Promise<T> {
    state: Rc<State<T>>,
}

/// The write side of a single-assignment cell.
///
/// Dropping a `Deferred` that was never resolved fails its promise, so nothing waits on a
/// resolver that is gone.
pub struct Deferred<T: 'static> {
    state: Rc<State<T>>,
}

/// The future returned by awaiting a [`Promise`].
///
/// Subscribes to the promise on the first pending poll, re-subscribes only when polled with a
/// different waker and unsubscribes when dropped.
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct Await<T: 'static> {
    promise: Promise<T>,
    subscription: Option<(SubscriptionId, Waker)>,
}

// === impl Promise ===

impl<T: 'static> Promise<T> {
    /// Returns a promise that is already resolved with `value`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is itself a promise, promises must be flattened explicitly using
    /// [`Promise::and_then`].
    #[track_caller]
    pub fn completed(value: T) -> Self {
        let state = State::new();
        if let Err(err) = state.resolve(Ok(value)) {
            panic!("{err}");
        }
        Self { state }
    }

    /// Returns a promise that has already failed with `error`.
    #[track_caller]
    pub fn failed(error: Error) -> Self {
        let state = State::new();
        if let Err(err) = state.resolve(Err(error)) {
            unreachable!("{err}");
        }
        Self { state }
    }

    /// Calls `callback` with the outcome of this promise once it is resolved.
    ///
    /// The callback is always invoked through the scheduler queue, even if the promise is already
    /// resolved.
    ///
    /// # Panics
    ///
    /// Panics if the promise is already resolved and no scheduler is entered on this thread.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce(&Result<T, Error>) + 'static,
    {
        self.state.subscribe(Box::new(callback))
    }

    /// Removes a subscription.
    ///
    /// This is advisory only: a callback that was already handed to the scheduler may still run.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.state.unsubscribe(id);
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Returns the outcome of this promise if it is resolved.
    pub fn outcome(&self) -> Option<&Result<T, Error>> {
        self.state.outcome()
    }

    /// Returns a promise resolved with `f` applied to this promise's value.
    ///
    /// Errors are passed through untouched.
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        T: Clone,
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let deferred = Deferred::new();
        let out = deferred.promise();

        self.subscribe(move |outcome| {
            let mapped = outcome.clone().map(f);
            if let Err(err) = deferred.settle(mapped) {
                let _ = deferred.fail(Error::new(err));
            }
        });

        out
    }

    /// Chains a promise returning computation onto this promise, flattening the result.
    pub fn and_then<U, F>(self, f: F) -> Promise<U>
    where
        T: Clone,
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        let deferred = Deferred::new();
        let out = deferred.promise();

        self.subscribe(move |outcome| match outcome.clone() {
            Ok(value) => {
                f(value).subscribe(move |inner| {
                    let _ = deferred.settle(inner.clone());
                });
            }
            Err(err) => {
                let _ = deferred.fail(err);
            }
        });

        out
    }

    /// Drives the current scheduler until this promise resolves.
    ///
    /// This is the only blocking operation in the crate. It returns the original error the
    /// promise failed with.
    ///
    /// # Errors
    ///
    /// Returns the error this promise failed with.
    ///
    /// # Panics
    ///
    /// Panics when no scheduler is entered, when called from within a scheduler callback, or
    /// when the scheduler runs out of work before the promise resolves.
    #[track_caller]
    pub fn join(self) -> Result<T, Error>
    where
        T: Clone,
    {
        let handle = Handle::current();

        loop {
            if let Some(outcome) = self.outcome() {
                return outcome.clone();
            }

            let tick = handle.tick();

            if !tick.has_remaining && !self.is_complete() {
                panic!("deadlock: the scheduler ran out of work before the promise resolved");
            }
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.state).finish()
    }
}

impl<T: Clone + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Await<T>;

    fn into_future(self) -> Self::IntoFuture {
        Await {
            promise: self,
            subscription: None,
        }
    }
}

// === impl Deferred ===

impl<T: 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            state: State::new(),
        }
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            state: self.state.clone(),
        }
    }

    /// Resolves the promise with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AlreadyResolved`] if the promise was already resolved, leaving the
    /// stored outcome untouched, and [`UsageError::InvalidResult`] if `value` is itself a promise.
    ///
    /// # Panics
    ///
    /// Panics if the promise has subscribers but no scheduler is entered on this thread.
    #[track_caller]
    pub fn resolve(&self, value: T) -> Result<(), UsageError> {
        self.state.resolve(Ok(value))
    }

    /// Fails the promise with `error`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AlreadyResolved`] if the promise was already resolved.
    ///
    /// # Panics
    ///
    /// Panics if the promise has subscribers but no scheduler is entered on this thread.
    #[track_caller]
    pub fn fail(&self, error: Error) -> Result<(), UsageError> {
        self.state.resolve(Err(error))
    }

    #[track_caller]
    pub(crate) fn settle(&self, outcome: Result<T, Error>) -> Result<(), UsageError> {
        self.state.resolve(outcome)
    }

    pub fn is_resolved(&self) -> bool {
        self.state.is_complete()
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if !self.state.is_complete() {
            tracing::trace!("unresolved deferred dropped");
            self.state.abandon(Error::msg("the resolver was dropped without resolving"));
        }
    }
}

impl<T: 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferred").field(&self.state).finish()
    }
}

// === impl Await ===

impl<T: Clone + 'static> Future for Await<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(outcome) = this.promise.outcome() {
            // a ready await continues the current step synchronously, which is bounded
            if !budget::consume() {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }

            if let Some((id, _)) = this.subscription.take() {
                this.promise.unsubscribe(id);
            }
            if let Err(err) = outcome {
                budget::observe(err);
            }

            return Poll::Ready(outcome.clone());
        }

        match &this.subscription {
            Some((_, waker)) if waker.will_wake(cx.waker()) => {}
            _ => {
                if let Some((id, _)) = this.subscription.take() {
                    this.promise.unsubscribe(id);
                }

                let waker = cx.waker().clone();
                let id = this.promise.subscribe({
                    let waker = waker.clone();
                    move |_| waker.wake()
                });
                this.subscription = Some((id, waker));
            }
        }

        Poll::Pending
    }
}

impl<T: 'static> Drop for Await<T> {
    fn drop(&mut self) {
        if let Some((id, _)) = self.subscription.take() {
            self.promise.unsubscribe(id);
        }
    }
}

impl<T: 'static> fmt::Debug for Await<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Await")
            .field("promise", &self.promise)
            .field("subscribed", &self.subscription.is_some())
            .finish()
    }
}
