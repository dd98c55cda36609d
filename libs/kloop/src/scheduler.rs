// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler interface consumed by the core.
//!
//! Everything in this crate that needs to run "later" goes through [`Schedule::queue`]: resolution
//! notifications, cancellation notifications and coroutine resumptions past the recursion bound.
//! A queued callback never runs inside the stack frame that queued it, which means no callback can
//! ever observe (or re-enter) a resolver that is still halfway through its work.
//!
//! The crate ships one implementation, the single threaded [`EventLoop`]. Other backends (select,
//! epoll or extension based reactors) only need to implement [`Schedule`].

mod event_loop;

use core::cell::{Cell, RefCell};
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::time::Duration;
use std::any::Any;
use std::panic;
use std::rc::Rc;

pub use event_loop::{Builder, EventLoop};

/// A callback handed to [`Schedule::queue`].
pub type Callback = Box<dyn FnOnce() + 'static>;

/// A callback attached to a watcher. Receives the id of the watcher that fired.
pub type WatcherCallback = Box<dyn FnMut(WatcherId) + 'static>;

/// The payload of a panic that escaped a scheduled callback.
pub type Panic = Box<dyn Any + Send + 'static>;

/// Identifies a watcher registered with a [`Schedule`] implementation.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WatcherId(pub(crate) u64);

/// Outcome of calling [`Schedule::tick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Tick {
    /// The total number of queued callbacks run on this tick.
    pub ran: usize,

    /// The number of timer watchers that fired on this tick.
    pub timers_fired: usize,

    /// `true` if the scheduler still has queued callbacks or enabled, referenced watchers.
    pub has_remaining: bool,
}

/// The scheduler primitives this crate relies on.
///
/// Implementations are single threaded: all methods are called from the thread that owns the
/// scheduler, and callbacks are invoked on that same thread.
pub trait Schedule {
    /// Schedule `callback` to be invoked later, never synchronously within the caller's stack.
    ///
    /// Callbacks run in the order they were queued.
    fn queue(&self, callback: Callback);

    /// Invoke `callback` once on the next tick.
    fn defer(&self, callback: WatcherCallback) -> WatcherId;

    /// Invoke `callback` once after `after` has elapsed.
    fn delay(&self, after: Duration, callback: WatcherCallback) -> WatcherId;

    /// Invoke `callback` every `interval` until the watcher is cancelled.
    fn repeat(&self, interval: Duration, callback: WatcherCallback) -> WatcherId;

    /// Re-enable a previously disabled watcher. Unknown ids are ignored.
    fn enable(&self, id: WatcherId);

    /// Disable a watcher without dropping it. Unknown ids are ignored.
    fn disable(&self, id: WatcherId);

    /// Cancel a watcher, dropping its callback. Unknown ids are ignored.
    fn cancel(&self, id: WatcherId);

    /// Make the watcher keep the scheduler alive (the default).
    fn reference(&self, id: WatcherId);

    /// Make the watcher no longer keep the scheduler alive on its own.
    fn unreference(&self, id: WatcherId);

    /// Run one scheduling round.
    ///
    /// This is used by [`Promise::join`][crate::future::Promise::join] to pump the scheduler.
    ///
    /// # Panics
    ///
    /// Implementations must panic when called from within one of their own callbacks.
    fn tick(&self) -> Tick;
}

/// A cheaply clonable reference to the scheduler driving the current thread.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<dyn Schedule>,
}

/// Restores the previously entered [`Handle`] when dropped.
#[must_use = "the handle is only entered until the guard is dropped"]
pub struct EnterGuard {
    prev: Option<Handle>,
}

std::thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
    static PANIC_HANDLER: Cell<Option<fn(Panic)>> = const { Cell::new(None) };
}

// === impl Handle ===

impl Handle {
    pub fn new(scheduler: Rc<dyn Schedule>) -> Self {
        Self { inner: scheduler }
    }

    /// Returns the handle of the scheduler entered on this thread.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler has been entered on this thread.
    #[track_caller]
    pub fn current() -> Self {
        Self::try_current().expect("no scheduler entered on this thread, call `Handle::enter` first")
    }

    /// Returns the handle of the scheduler entered on this thread, if any.
    ///
    /// Also `None` while the thread's locals are being torn down.
    pub fn try_current() -> Option<Self> {
        CURRENT
            .try_with(|current| current.borrow().clone())
            .ok()
            .flatten()
    }

    /// Makes this handle the current one for the calling thread until the guard is dropped.
    pub fn enter(&self) -> EnterGuard {
        let prev = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        EnterGuard { prev }
    }

    /// Schedules `f` to run later. A panic inside `f` is caught and handed to the fallback handler.
    pub fn queue<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.queue(Box::new(move || guarded(f)));
    }

    pub fn defer<F>(&self, f: F) -> WatcherId
    where
        F: FnOnce(WatcherId) + 'static,
    {
        let mut f = Some(f);
        self.inner.defer(Box::new(move |id| {
            if let Some(f) = f.take() {
                guarded(|| f(id));
            }
        }))
    }

    pub fn delay<F>(&self, after: Duration, f: F) -> WatcherId
    where
        F: FnOnce(WatcherId) + 'static,
    {
        let mut f = Some(f);
        self.inner.delay(
            after,
            Box::new(move |id| {
                if let Some(f) = f.take() {
                    guarded(|| f(id));
                }
            }),
        )
    }

    pub fn repeat<F>(&self, interval: Duration, mut f: F) -> WatcherId
    where
        F: FnMut(WatcherId) + 'static,
    {
        self.inner
            .repeat(interval, Box::new(move |id| guarded(|| f(id))))
    }

    pub fn enable(&self, id: WatcherId) {
        self.inner.enable(id);
    }

    pub fn disable(&self, id: WatcherId) {
        self.inner.disable(id);
    }

    pub fn cancel(&self, id: WatcherId) {
        self.inner.cancel(id);
    }

    pub fn reference(&self, id: WatcherId) {
        self.inner.reference(id);
    }

    pub fn unreference(&self, id: WatcherId) {
        self.inner.unreference(id);
    }

    pub fn tick(&self) -> Tick {
        self.inner.tick()
    }

    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("scheduler", &Rc::as_ptr(&self.inner))
            .finish()
    }
}

// === impl EnterGuard ===

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

impl fmt::Debug for EnterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterGuard")
            .field("prev", &self.prev)
            .finish()
    }
}

// === panic handling ===

/// Installs the fallback handler for panics that escape scheduled callbacks on this thread.
///
/// Such panics are caught so the remaining callbacks still run, and re-surfaced here on a fresh
/// queue entry. Without a handler the panic is logged and unwinding resumes out of the scheduler.
pub fn set_panic_handler(handler: fn(Panic)) {
    PANIC_HANDLER.with(|h| h.set(Some(handler)));
}

/// Removes a handler installed through [`set_panic_handler`], restoring the default behaviour.
pub fn take_panic_handler() -> Option<fn(Panic)> {
    PANIC_HANDLER.with(Cell::take)
}

fn guarded<F: FnOnce()>(f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        report_panic(panic);
    }
}

pub(crate) fn report_panic(panic: Panic) {
    let handler = PANIC_HANDLER.with(Cell::get);

    let deliver = move || match handler {
        Some(handler) => handler(panic),
        None => {
            tracing::error!(panic = panic_message(&panic), "unhandled panic in scheduled callback");
            panic::resume_unwind(panic);
        }
    };

    // hand the failure to a fresh queue entry so the handler never runs on the stack of the
    // callback that failed
    match Handle::try_current() {
        Some(handle) => handle.inner.queue(Box::new(deliver)),
        None => deliver(),
    }
}

pub(crate) fn panic_message(panic: &Panic) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockScheduler, trace_init};

    #[test]
    fn enter_nests() {
        let _trace = trace_init();

        let outer = MockScheduler::new();
        let inner = MockScheduler::new();

        assert!(Handle::try_current().is_none());
        {
            let _outer = outer.handle().enter();
            assert!(Handle::current().ptr_eq(&outer.handle()));
            {
                let _inner = inner.handle().enter();
                assert!(Handle::current().ptr_eq(&inner.handle()));
            }
            assert!(Handle::current().ptr_eq(&outer.handle()));
        }
        assert!(Handle::try_current().is_none());
    }

    #[test]
    fn queue_is_never_inline() {
        let _trace = trace_init();

        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let ran = Rc::new(Cell::new(false));
        Handle::current().queue({
            let ran = ran.clone();
            move || ran.set(true)
        });

        assert!(!ran.get());
        mock.run_until_idle();
        assert!(ran.get());
    }

    #[test]
    fn panicking_callback_is_reported() {
        let _trace = trace_init();

        std::thread_local! {
            static CAUGHT: Cell<usize> = const { Cell::new(0) };
        }

        fn handler(panic: Panic) {
            assert_eq!(panic_message(&panic), "boom");
            CAUGHT.with(|c| c.set(c.get() + 1));
        }

        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();
        set_panic_handler(handler);

        let after = Rc::new(Cell::new(false));
        Handle::current().queue(|| panic!("boom"));
        Handle::current().queue({
            let after = after.clone();
            move || after.set(true)
        });
        mock.run_until_idle();

        take_panic_handler();
        assert!(after.get(), "a panicking callback must not stop later callbacks");
        assert_eq!(CAUGHT.with(Cell::get), 1);
    }
}
