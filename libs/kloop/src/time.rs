// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Clocks and timer backed helpers.

use crate::error::{Cancelled, Error};
use crate::future::{Deferred, Promise};
use crate::scheduler::Handle;
use core::cell::Cell;
use core::fmt;
use core::time::Duration;
use std::rc::Rc;
use std::time::Instant;

/// The time source of an [`EventLoop`][crate::scheduler::EventLoop].
///
/// Time is measured as the [`Duration`] elapsed since the clock was created.
#[derive(Clone)]
pub struct Clock {
    name: &'static str,
    kind: ClockKind,
}

#[derive(Clone)]
enum ClockKind {
    System { anchor: Instant },
    Manual { now: Rc<Cell<Duration>> },
}

// === impl Clock ===

impl Clock {
    /// A clock backed by the monotonic system clock.
    #[must_use]
    pub fn system() -> Self {
        Self {
            name: "system",
            kind: ClockKind::System {
                anchor: Instant::now(),
            },
        }
    }

    /// A virtual clock that only moves when told to.
    ///
    /// An event loop driven by a manual clock never sleeps: when it has nothing to do but wait
    /// for a timer it jumps straight to that timer's deadline.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            name: "manual",
            kind: ClockKind::Manual {
                now: Rc::new(Cell::new(Duration::ZERO)),
            },
        }
    }

    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the time elapsed since this clock was created.
    #[must_use]
    pub fn now(&self) -> Duration {
        match &self.kind {
            ClockKind::System { anchor } => anchor.elapsed(),
            ClockKind::Manual { now } => now.get(),
        }
    }

    /// Moves a manual clock forward by `by`.
    ///
    /// # Panics
    ///
    /// Panics if this is not a [`Clock::manual`] clock.
    #[track_caller]
    pub fn advance(&self, by: Duration) {
        match &self.kind {
            ClockKind::Manual { now } => {
                tracing::trace!(clock = self.name, ?by, "advancing clock");
                now.set(now.get() + by);
            }
            ClockKind::System { .. } => panic!("only manual clocks can be advanced"),
        }
    }

    /// Blocks the calling thread until `deadline`.
    pub(crate) fn park_until(&self, deadline: Duration) {
        match &self.kind {
            ClockKind::System { anchor } => {
                if let Some(remaining) = deadline.checked_sub(anchor.elapsed()) {
                    std::thread::sleep(remaining);
                }
            }
            ClockKind::Manual { now } => {
                if deadline > now.get() {
                    now.set(deadline);
                }
            }
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("now", &self.now())
            .finish()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// === helpers ===

/// Returns a promise that resolves once `duration` has elapsed on the current scheduler.
///
/// # Panics
///
/// Panics if no scheduler is entered on the calling thread.
pub fn delay(duration: Duration) -> Promise<()> {
    let deferred = Deferred::new();
    let promise = deferred.promise();

    Handle::current().delay(duration, move |_| {
        // only this watcher resolves the promise
        let _ = deferred.resolve(());
    });

    promise
}

/// Requires `promise` to settle before `duration` elapses.
///
/// The returned promise adopts the outcome of `promise`, or fails with a timeout [`Cancelled`]
/// error once `duration` has passed. The timer is cancelled as soon as `promise` settles.
///
/// # Panics
///
/// Panics if no scheduler is entered on the calling thread.
pub fn timeout<T>(duration: Duration, promise: Promise<T>) -> Promise<T>
where
    T: Clone + 'static,
{
    let handle = Handle::current();
    let deferred = Rc::new(Deferred::new());
    let out = deferred.promise();

    let watcher = handle.delay(duration, {
        let deferred = deferred.clone();
        move |_| {
            if !deferred.is_resolved() {
                tracing::trace!(?duration, "timed out");
                let _ = deferred.fail(Cancelled::timed_out(duration).into());
            }
        }
    });

    promise.subscribe(move |outcome: &Result<T, Error>| {
        handle.cancel(watcher);
        if !deferred.is_resolved() {
            let _ = deferred.settle(outcome.clone());
        }
    });

    out
}
