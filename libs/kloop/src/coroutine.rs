// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coroutines: `async` computations driven by promise resolution.
//!
//! A coroutine is polled once when spawned and afterwards only when one of the promises it awaits
//! resolves. Such a resumption runs inline in the promise's (queued) subscription callback.
//!
//! Awaiting a promise that is already resolved continues the computation on the same stack. To
//! bound stack growth a single step may only do that `max_depth` times, after which the next
//! resumption is rescheduled through [`Schedule::queue`][crate::scheduler::Schedule::queue].

mod builder;
pub(crate) mod budget;
mod waker;

use crate::error::Error;
use crate::future::{Deferred, Promise};
use crate::scheduler::{self, Handle};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};
use std::collections::HashMap;
use std::panic;
use std::rc::Rc;

pub use builder::Builder;

/// How many already resolved promises a coroutine may await in a row by default.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// An opaque ID that uniquely identifies a coroutine.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Id(u64);

/// Spawns `future` as a coroutine on the current scheduler, see [`Builder::spawn`].
///
/// # Panics
///
/// Panics if no scheduler is entered on the calling thread.
#[inline]
#[track_caller]
pub fn spawn<F, T>(future: F) -> Promise<T>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    Builder::new().spawn(future)
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + 'static>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    /// Waiting for an awaited promise to resolve.
    Suspended,
    /// Being polled right now.
    Running,
    /// Woken while being polled, must be polled again.
    Notified,
    /// A resumption sits in the scheduler queue.
    Scheduled,
    /// Completed, failed or disposed. Never polled again.
    Done,
}

struct Coroutine<T: 'static> {
    id: Id,
    span: tracing::Span,
    max_depth: usize,
    handle: Handle,
    waker: Waker,
    status: Cell<Status>,
    future: RefCell<Option<BoxFuture<T>>>,
    deferred: Deferred<T>,
}

/// Type erased coroutine as stored in the registry.
trait Drive {
    fn wake(self: Rc<Self>);
}

std::thread_local! {
    /// Coroutines owned by this thread that have not finished yet.
    static REGISTRY: RefCell<HashMap<Id, Rc<dyn Drive>>> = RefCell::new(HashMap::new());
}

/// Resumes the coroutine `id` of the calling thread, if it is still alive.
fn resume(id: Id) {
    let coroutine = REGISTRY.with(|registry| registry.borrow().get(&id).cloned());
    if let Some(coroutine) = coroutine {
        coroutine.wake();
    }
}

// === impl Id ===

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self(id)
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Coroutine ===

impl<T: 'static> Coroutine<T> {
    fn start<F>(future: F, id: Id, span: tracing::Span, max_depth: usize, handle: Handle) -> Promise<T>
    where
        F: Future<Output = Result<T, Error>> + 'static,
    {
        let this = Rc::new(Self {
            id,
            span,
            max_depth,
            handle,
            waker: waker::waker(id),
            status: Cell::new(Status::Running),
            future: RefCell::new(Some(Box::pin(future))),
            deferred: Deferred::new(),
        });
        let promise = this.deferred.promise();

        REGISTRY.with(|registry| {
            registry
                .borrow_mut()
                .insert(id, this.clone() as Rc<dyn Drive>)
        });
        tracing::debug!(parent: &this.span, "spawned");

        this.step();
        promise
    }

    /// Polls the computation once.
    fn step(self: &Rc<Self>) {
        self.status.set(Status::Running);

        let step = budget::enter(self.max_depth);
        let poll = {
            let _enter = self.span.enter();
            let mut cx = Context::from_waker(&self.waker);
            let mut slot = self.future.borrow_mut();
            let Some(future) = slot.as_mut() else {
                return;
            };
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };
        let disposed = step.finish();

        match poll {
            Err(panic) => {
                let message = format!("coroutine panicked: {}", scheduler::panic_message(&panic));
                scheduler::report_panic(panic);
                self.finish(Err(Error::msg(message)));
            }
            // the computation must not swallow a disposal
            Ok(Poll::Ready(Ok(_))) if disposed => self.finish(Err(Error::disposed())),
            Ok(Poll::Ready(outcome)) => self.finish(outcome),
            Ok(Poll::Pending) if disposed => {
                tracing::debug!(parent: &self.span, "disposed while suspended, dropping");
                self.finish(Err(Error::disposed()));
            }
            Ok(Poll::Pending) if self.status.get() == Status::Notified => {
                tracing::debug!(parent: &self.span, "rescheduling");
                self.status.set(Status::Scheduled);
                let this = self.clone();
                self.handle.queue(move || {
                    if this.status.get() == Status::Scheduled {
                        this.step();
                    }
                });
            }
            Ok(Poll::Pending) => {
                tracing::debug!(parent: &self.span, "suspended");
                self.status.set(Status::Suspended);
            }
        }
    }

    fn finish(&self, outcome: Result<T, Error>) {
        self.status.set(Status::Done);
        // drop the computation (and any subscriptions it holds) before notifying anyone
        let future = self.future.borrow_mut().take();
        drop(future);
        REGISTRY.with(|registry| registry.borrow_mut().remove(&self.id));

        tracing::debug!(parent: &self.span, ok = outcome.is_ok(), "completed");
        if let Err(err) = self.deferred.settle(outcome) {
            let _ = self.deferred.fail(Error::new(err));
        }
    }
}

impl<T: 'static> Drive for Coroutine<T> {
    fn wake(self: Rc<Self>) {
        match self.status.get() {
            Status::Suspended => self.step(),
            Status::Running => self.status.set(Status::Notified),
            Status::Notified | Status::Scheduled | Status::Done => {}
        }
    }
}
