// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, ResolutionTrace, UsageError};
use crate::future::Promise;
use crate::scheduler::Handle;
use core::any::TypeId;
use core::cell::{Cell, OnceCell, RefCell};
use core::fmt;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

/// Identifies a subscription to a [`Promise`] or [`CancellationToken`].
///
/// [`CancellationToken`]: crate::cancel::CancellationToken
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

pub(crate) type Subscriber<T> = Box<dyn FnOnce(&Result<T, Error>) + 'static>;

/// The single-assignment cell shared by a [`Promise`] and its resolver.
///
/// The outcome lives outside the subscriber list so that subscribers can read it (and subscribe
/// again) while being notified.
pub struct State<T> {
    outcome: OnceCell<Result<T, Error>>,
    subscribers: RefCell<BTreeMap<SubscriptionId, Subscriber<T>>>,
    next_id: Cell<u64>,
    resolved_at: Cell<Option<ResolutionTrace>>,
}

std::thread_local! {
    /// Every `Promise<U>` type instantiated on this thread. Promises are `!Send`, so any
    /// `Promise<U>` value a thread can observe was created on that same thread.
    static PROMISE_TYPES: RefCell<HashSet<TypeId>> = RefCell::new(HashSet::new());
}

/// Returns `true` if `T` is a `Promise<U>` for some `U`.
pub(crate) fn is_promise<T: 'static>() -> bool {
    let id = TypeId::of::<T>();
    PROMISE_TYPES.with(|types| types.borrow().contains(&id))
}

// === impl State ===

impl<T: 'static> State<T> {
    pub(crate) fn new() -> Rc<Self> {
        PROMISE_TYPES.with(|types| {
            let id = TypeId::of::<Promise<T>>();
            // avoid the mutable borrow on the hot path
            if !types.borrow().contains(&id) {
                types.borrow_mut().insert(id);
            }
        });

        Rc::new(Self {
            outcome: OnceCell::new(),
            subscribers: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
            resolved_at: Cell::new(None),
        })
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub(crate) fn outcome(&self) -> Option<&Result<T, Error>> {
        self.outcome.get()
    }

    fn next_id(&self) -> SubscriptionId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        SubscriptionId(id)
    }

    /// Registers `callback`. If the cell is already resolved the callback is queued right away.
    pub(crate) fn subscribe(self: &Rc<Self>, callback: Subscriber<T>) -> SubscriptionId {
        let id = self.next_id();

        if self.is_complete() {
            tracing::trace!(subscription = ?id, "subscribed to resolved cell, queueing");
            let this = self.clone();
            Handle::current().queue(move || this.deliver(callback));
        } else {
            tracing::trace!(subscription = ?id, "subscribed");
            self.subscribers.borrow_mut().insert(id, callback);
        }

        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscribers.borrow_mut().remove(&id).is_some() {
            tracing::trace!(subscription = ?id, "unsubscribed");
        }
    }

    /// Stores `outcome` and queues every subscriber in subscription order.
    ///
    /// # Panics
    ///
    /// Panics if there are subscribers to notify but no scheduler is entered on this thread.
    #[track_caller]
    pub(crate) fn resolve(self: &Rc<Self>, outcome: Result<T, Error>) -> Result<(), UsageError> {
        if self.is_complete() {
            return Err(UsageError::AlreadyResolved {
                first: self.resolved_at.get(),
            });
        }
        if outcome.is_ok() && is_promise::<T>() {
            return Err(UsageError::InvalidResult);
        }

        tracing::trace!(ok = outcome.is_ok(), "resolving cell");
        self.resolved_at.set(ResolutionTrace::capture());
        if self.outcome.set(outcome).is_err() {
            unreachable!("cell resolved twice");
        }

        let subscribers = core::mem::take(&mut *self.subscribers.borrow_mut());
        if subscribers.is_empty() {
            return Ok(());
        }

        let handle = Handle::current();
        for (_, callback) in subscribers {
            let this = self.clone();
            handle.queue(move || this.deliver(callback));
        }

        Ok(())
    }

    /// Fails the cell because its resolver went away without resolving it.
    ///
    /// With no scheduler entered there is nobody to notify through, so the subscribers are dropped
    /// instead of queued. Never panics, it runs from `Drop`.
    pub(crate) fn abandon(self: &Rc<Self>, error: Error) {
        if self.is_complete() {
            return;
        }
        if Handle::try_current().is_some() {
            let _ = self.resolve(Err(error));
            return;
        }

        tracing::debug!("resolver dropped outside of a scheduler, subscribers will not be notified");
        let _ = self.outcome.set(Err(error));
        let subscribers = core::mem::take(&mut *self.subscribers.borrow_mut());
        drop(subscribers);
    }

    fn deliver(&self, callback: Subscriber<T>) {
        if let Some(outcome) = self.outcome.get() {
            callback(outcome);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }
}

impl<T> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome.get() {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(_)) => "failed",
        };

        f.debug_struct("State")
            .field("outcome", &outcome)
            .field("subscribers", &self.subscribers.borrow().len())
            .finish_non_exhaustive()
    }
}
