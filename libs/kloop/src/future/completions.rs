// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::channel::Consumer;
use crate::coroutine;
use crate::error::Error;
use crate::future::{Deferred, Promise};
use core::cell::RefCell;
use core::fmt;
use std::collections::VecDeque;
use std::rc::Rc;

type Item<K, T> = (K, Promise<T>);

/// Yields keyed promises in the order they resolve, rather than the order they were handed in.
///
/// ```
/// # use kloop::future::{Completions, Deferred};
/// # use kloop::scheduler::EventLoop;
/// let ev = EventLoop::new();
/// let _guard = ev.enter();
///
/// let slow = Deferred::<u8>::new();
/// let fast = Deferred::<u8>::new();
/// let completions = Completions::from_iter([("slow", slow.promise()), ("fast", fast.promise())]);
///
/// fast.resolve(1).unwrap();
/// let (key, _) = ev.block_on(completions.next()).unwrap().unwrap();
/// assert_eq!(key, "fast");
/// ```
pub struct Completions<K: 'static, T: 'static> {
    shared: Rc<RefCell<Shared<K, T>>>,
}

struct Shared<K: 'static, T: 'static> {
    /// Resolved members that were not pulled yet, in resolution order.
    ready: VecDeque<Item<K, T>>,
    /// Consumers waiting for the next resolution.
    waiters: VecDeque<Deferred<Option<Item<K, T>>>>,
    /// Members that did not resolve yet.
    pending: usize,
    /// All members are known.
    exhausted: bool,
    /// The source failed before all members were known.
    failure: Option<Error>,
}

impl<K: 'static, T: 'static> Shared<K, T> {
    fn is_finished(&self) -> bool {
        self.exhausted && self.pending == 0 && self.ready.is_empty()
    }
}

impl<K: 'static, T: 'static> Completions<K, T> {
    fn empty() -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                ready: VecDeque::new(),
                waiters: VecDeque::new(),
                pending: 0,
                exhausted: false,
                failure: None,
            })),
        }
    }

    /// Tracks a fixed set of promises. Membership is known up front, so nothing has to be driven.
    #[allow(clippy::should_implement_trait, reason = "builds from owned pairs, not a `FromIterator` collection")]
    pub fn from_iter<I>(members: I) -> Self
    where
        I: IntoIterator<Item = Item<K, T>>,
    {
        let this = Self::empty();
        for (key, promise) in members {
            track(&this.shared, key, promise);
        }
        this.shared.borrow_mut().exhausted = true;
        Self::finish_shared(&this.shared);
        this
    }

    /// Tracks promises as they are produced into a channel.
    ///
    /// The channel is drained on a separate coroutine, so slow production never holds back
    /// members that already resolved. A failing channel fails the next pull.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler is entered on the calling thread.
    pub fn from_pipeline<S: 'static>(source: Consumer<Item<K, T>, S>) -> Self
    where
        K: Clone,
    {
        let this = Self::empty();
        let shared = this.shared.clone();

        let _ = coroutine::Builder::new()
            .name("completions")
            .spawn(async move {
                loop {
                    match source.next().await {
                        Ok(Some((key, promise))) => track(&shared, key, promise),
                        Ok(None) => break,
                        Err(err) => {
                            tracing::trace!(%err, "completion source failed");
                            let waiters = {
                                let mut shared = shared.borrow_mut();
                                shared.failure = Some(err.clone());
                                core::mem::take(&mut shared.waiters)
                            };
                            for waiter in waiters {
                                let _ = waiter.fail(err.clone());
                            }
                            return Ok(());
                        }
                    }
                }

                shared.borrow_mut().exhausted = true;
                Self::finish_shared(&shared);
                Ok(())
            });

        this
    }

    /// Pulls the next resolved member, or `None` once every member was pulled.
    pub fn next(&self) -> Promise<Option<Item<K, T>>>
    where
        K: Clone,
    {
        let mut shared = self.shared.borrow_mut();

        if let Some(item) = shared.ready.pop_front() {
            return Promise::completed(Some(item));
        }
        if let Some(err) = &shared.failure {
            return Promise::failed(err.clone());
        }
        if shared.is_finished() {
            return Promise::completed(None);
        }

        let deferred = Deferred::new();
        let promise = deferred.promise();
        shared.waiters.push_back(deferred);
        promise
    }

    fn finish_shared(shared: &Rc<RefCell<Shared<K, T>>>) {
        let waiters = {
            let mut shared = shared.borrow_mut();
            if !shared.is_finished() {
                return;
            }
            core::mem::take(&mut shared.waiters)
        };

        for waiter in waiters {
            let _ = waiter.resolve(None);
        }
    }
}

fn track<K: 'static, T: 'static>(shared: &Rc<RefCell<Shared<K, T>>>, key: K, promise: Promise<T>) {
    shared.borrow_mut().pending += 1;

    let member = promise.clone();
    let shared = shared.clone();
    promise.subscribe(move |_| {
        let waiter = {
            let mut inner = shared.borrow_mut();
            inner.pending -= 1;
            inner.waiters.pop_front()
        };

        match waiter {
            Some(waiter) => {
                let _ = waiter.resolve(Some((key, member)));
            }
            None => shared.borrow_mut().ready.push_back((key, member)),
        }
        Completions::finish_shared(&shared);
    });
}

impl<K: 'static, T: 'static> fmt::Debug for Completions<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Completions")
            .field("ready", &shared.ready.len())
            .field("pending", &shared.pending)
            .field("exhausted", &shared.exhausted)
            .finish_non_exhaustive()
    }
}
