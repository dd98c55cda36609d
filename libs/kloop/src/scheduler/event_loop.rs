// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::future::Promise;
use crate::scheduler::{Callback, EnterGuard, Handle, Schedule, Tick, WatcherCallback, WatcherId};
use crate::time::Clock;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::time::Duration;
use static_assertions::assert_not_impl_any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

/// A single threaded event loop that runs callbacks and timers on the calling thread.
///
/// The loop is `!Send` and `!Sync`: everything it runs lives on the thread that created it.
pub struct EventLoop {
    core: Rc<Core>,
}

// The loop is strictly single threaded; make sure it can't accidentally cross threads.
assert_not_impl_any!(EventLoop: Send, Sync);

/// Configures and builds an [`EventLoop`].
#[derive(Debug)]
pub struct Builder {
    clock: Option<Clock>,
    tick_size: usize,
}

struct Core {
    clock: Clock,
    tick_size: usize,
    next_id: Cell<u64>,
    /// Callbacks handed to `queue`, in FIFO order.
    run_queue: RefCell<VecDeque<Callback>>,
    watchers: RefCell<BTreeMap<WatcherId, Watcher>>,
    /// Enabled timer watchers ordered by deadline, then registration order.
    timers: RefCell<BTreeSet<(Duration, WatcherId)>>,
    /// `true` while a tick is in progress, used to reject reentrant ticks.
    ticking: Cell<bool>,
}

struct Watcher {
    kind: WatcherKind,
    enabled: bool,
    referenced: bool,
}

/// Each watcher kind carries only the state relevant to it. The callback is taken out while it
/// runs so it can freely register or cancel watchers.
enum WatcherKind {
    Defer {
        callback: Option<WatcherCallback>,
    },
    Delay {
        after: Duration,
        deadline: Duration,
        callback: Option<WatcherCallback>,
    },
    Repeat {
        interval: Duration,
        deadline: Duration,
        callback: Option<WatcherCallback>,
    },
}

// === impl Builder ===

impl Builder {
    /// How many queued callbacks are run per [`Schedule::tick`] by default.
    pub const DEFAULT_TICK_SIZE: usize = 256;

    pub const fn new() -> Self {
        Self {
            clock: None,
            tick_size: Self::DEFAULT_TICK_SIZE,
        }
    }

    /// Override the clock driving timers. Defaults to [`Clock::system`].
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override how many queued callbacks a single tick runs before yielding back to the caller.
    ///
    /// # Panics
    ///
    /// Panics if `tick_size` is zero.
    #[must_use]
    pub fn tick_size(mut self, tick_size: usize) -> Self {
        assert!(tick_size > 0, "tick size must be at least one");
        self.tick_size = tick_size;
        self
    }

    pub fn build(self) -> EventLoop {
        let clock = self.clock.unwrap_or_else(Clock::system);
        tracing::debug!(%clock, tick_size = self.tick_size, "building event loop");

        EventLoop {
            core: Rc::new(Core {
                clock,
                tick_size: self.tick_size,
                next_id: Cell::new(1),
                run_queue: RefCell::new(VecDeque::new()),
                watchers: RefCell::new(BTreeMap::new()),
                timers: RefCell::new(BTreeSet::new()),
                ticking: Cell::new(false),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl EventLoop ===

impl EventLoop {
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub const fn builder() -> Builder {
        Builder::new()
    }

    pub fn handle(&self) -> Handle {
        Handle::new(self.core.clone())
    }

    /// Make this loop the current scheduler of the calling thread until the guard is dropped.
    pub fn enter(&self) -> EnterGuard {
        self.handle().enter()
    }

    pub fn clock(&self) -> &Clock {
        &self.core.clock
    }

    /// Runs the loop until there are no queued callbacks and no enabled, referenced watchers left.
    ///
    /// # Panics
    ///
    /// Panics if called from within a callback of this loop, or if a scheduled callback panicked
    /// and no fallback handler is installed.
    pub fn run(&self) {
        let _enter = self.enter();
        let _span = tracing::debug_span!("event loop run").entered();

        loop {
            let tick = self.core.tick();
            tracing::trace!(?tick, "event loop tick");

            if !tick.has_remaining {
                break;
            }
        }
    }

    /// Drives the loop until `promise` resolves and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the error `promise` failed with.
    ///
    /// # Panics
    ///
    /// Panics if called from within a callback of this loop, or if the loop runs out of work
    /// before `promise` resolves.
    pub fn block_on<T: Clone + 'static>(&self, promise: Promise<T>) -> Result<T, Error> {
        let _enter = self.enter();
        promise.join()
    }

    /// The number of registered watchers, enabled or not.
    pub fn watcher_count(&self) -> usize {
        self.core.watchers.borrow().len()
    }

    /// `true` if there are callbacks waiting to be run.
    pub fn has_queued(&self) -> bool {
        !self.core.run_queue.borrow().is_empty()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("clock", &self.core.clock)
            .field("tick_size", &self.core.tick_size)
            .field("queued", &self.core.run_queue.borrow().len())
            .field("watchers", &self.core.watchers.borrow().len())
            .finish()
    }
}

// === impl Core ===

impl Core {
    fn next_id(&self) -> WatcherId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        WatcherId(id)
    }

    fn register(&self, kind: WatcherKind) -> WatcherId {
        let id = self.next_id();

        match &kind {
            WatcherKind::Delay { deadline, .. } | WatcherKind::Repeat { deadline, .. } => {
                self.timers.borrow_mut().insert((*deadline, id));
            }
            WatcherKind::Defer { .. } => {}
        }

        self.watchers.borrow_mut().insert(
            id,
            Watcher {
                kind,
                enabled: true,
                referenced: true,
            },
        );

        tracing::trace!(watcher = ?id, "registered watcher");
        id
    }

    fn fire_timers(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;

        loop {
            let next = {
                let mut timers = self.timers.borrow_mut();
                match timers.first() {
                    Some(&(deadline, id)) if deadline <= now => {
                        timers.pop_first();
                        Some(id)
                    }
                    _ => None,
                }
            };
            let Some(id) = next else { break };

            let Some(mut callback) = self.take_callback(id) else {
                continue;
            };
            tracing::trace!(watcher = ?id, "timer fired");
            callback(id);
            fired += 1;

            self.after_fire(id, callback, now);
        }

        fired
    }

    fn fire_defers(&self) -> usize {
        let due: Vec<WatcherId> = self
            .watchers
            .borrow()
            .iter()
            .filter(|(_, w)| w.enabled && matches!(w.kind, WatcherKind::Defer { .. }))
            .map(|(id, _)| *id)
            .collect();

        let mut fired = 0;
        for id in due {
            let Some(mut callback) = self.take_callback(id) else {
                continue;
            };
            callback(id);
            fired += 1;
            self.watchers.borrow_mut().remove(&id);
        }
        fired
    }

    fn take_callback(&self, id: WatcherId) -> Option<WatcherCallback> {
        let mut watchers = self.watchers.borrow_mut();
        let watcher = watchers.get_mut(&id)?;
        if !watcher.enabled {
            return None;
        }

        match &mut watcher.kind {
            WatcherKind::Defer { callback }
            | WatcherKind::Delay { callback, .. }
            | WatcherKind::Repeat { callback, .. } => callback.take(),
        }
    }

    /// Puts a repeating watcher's callback back and re-arms it, or drops a one-shot watcher.
    fn after_fire(&self, id: WatcherId, cb: WatcherCallback, now: Duration) {
        let mut watchers = self.watchers.borrow_mut();

        // the callback may have cancelled its own watcher
        let Some(watcher) = watchers.get_mut(&id) else {
            return;
        };

        match &mut watcher.kind {
            WatcherKind::Repeat {
                interval,
                deadline,
                callback,
            } => {
                *callback = Some(cb);
                *deadline = now + *interval;
                if watcher.enabled {
                    self.timers.borrow_mut().insert((*deadline, id));
                }
            }
            WatcherKind::Delay { .. } | WatcherKind::Defer { .. } => {
                watchers.remove(&id);
            }
        }
    }

    fn run_queued(&self) -> usize {
        let mut ran = 0;
        while ran < self.tick_size {
            // the borrow must end before the callback runs, callbacks queue more callbacks
            let Some(callback) = self.run_queue.borrow_mut().pop_front() else {
                break;
            };
            callback();
            ran += 1;
        }
        ran
    }

    fn has_remaining(&self) -> bool {
        !self.run_queue.borrow().is_empty()
            || self
                .watchers
                .borrow()
                .values()
                .any(|w| w.enabled && w.referenced)
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers.borrow().first().map(|(deadline, _)| *deadline)
    }
}

impl Schedule for Core {
    fn queue(&self, callback: Callback) {
        self.run_queue.borrow_mut().push_back(callback);
    }

    fn defer(&self, callback: WatcherCallback) -> WatcherId {
        self.register(WatcherKind::Defer {
            callback: Some(callback),
        })
    }

    fn delay(&self, after: Duration, callback: WatcherCallback) -> WatcherId {
        self.register(WatcherKind::Delay {
            after,
            deadline: self.clock.now() + after,
            callback: Some(callback),
        })
    }

    fn repeat(&self, interval: Duration, callback: WatcherCallback) -> WatcherId {
        self.register(WatcherKind::Repeat {
            interval,
            deadline: self.clock.now() + interval,
            callback: Some(callback),
        })
    }

    fn enable(&self, id: WatcherId) {
        let mut watchers = self.watchers.borrow_mut();
        let Some(watcher) = watchers.get_mut(&id) else {
            return;
        };
        if watcher.enabled {
            return;
        }
        watcher.enabled = true;

        // timers count from the moment they are re-enabled
        let now = self.clock.now();
        match &mut watcher.kind {
            WatcherKind::Delay {
                after, deadline, ..
            } => {
                *deadline = now + *after;
                self.timers.borrow_mut().insert((*deadline, id));
            }
            WatcherKind::Repeat {
                interval, deadline, ..
            } => {
                *deadline = now + *interval;
                self.timers.borrow_mut().insert((*deadline, id));
            }
            WatcherKind::Defer { .. } => {}
        }
    }

    fn disable(&self, id: WatcherId) {
        let mut watchers = self.watchers.borrow_mut();
        let Some(watcher) = watchers.get_mut(&id) else {
            return;
        };
        watcher.enabled = false;

        match &watcher.kind {
            WatcherKind::Delay { deadline, .. } | WatcherKind::Repeat { deadline, .. } => {
                self.timers.borrow_mut().remove(&(*deadline, id));
            }
            WatcherKind::Defer { .. } => {}
        }
    }

    fn cancel(&self, id: WatcherId) {
        let removed = self.watchers.borrow_mut().remove(&id);
        if let Some(watcher) = removed {
            tracing::trace!(watcher = ?id, "cancelled watcher");
            match watcher.kind {
                WatcherKind::Delay { deadline, .. } | WatcherKind::Repeat { deadline, .. } => {
                    self.timers.borrow_mut().remove(&(deadline, id));
                }
                WatcherKind::Defer { .. } => {}
            }
        }
    }

    fn reference(&self, id: WatcherId) {
        if let Some(watcher) = self.watchers.borrow_mut().get_mut(&id) {
            watcher.referenced = true;
        }
    }

    fn unreference(&self, id: WatcherId) {
        if let Some(watcher) = self.watchers.borrow_mut().get_mut(&id) {
            watcher.referenced = false;
        }
    }

    fn tick(&self) -> Tick {
        assert!(
            !self.ticking.replace(true),
            "reentrant tick: the event loop cannot be driven from within one of its own callbacks"
        );
        let _reset = ResetTicking(&self.ticking);

        let timers_fired = self.fire_timers() + self.fire_defers();
        let ran = self.run_queued();
        let has_remaining = self.has_remaining();

        // nothing to do right now, wait for the next timer
        if ran == 0 && timers_fired == 0 && has_remaining && self.run_queue.borrow().is_empty() {
            if let Some(deadline) = self.next_deadline() {
                tracing::trace!(?deadline, "parking until next timer");
                self.clock.park_until(deadline);
            }
        }

        Tick {
            ran,
            timers_fired,
            has_remaining,
        }
    }
}

struct ResetTicking<'a>(&'a Cell<bool>);

impl Drop for ResetTicking<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::trace_init;

    fn manual_loop() -> EventLoop {
        EventLoop::builder().clock(Clock::manual()).build()
    }

    #[test]
    fn runs_queue_in_order() {
        let _trace = trace_init();
        let ev = manual_loop();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            ev.handle().queue(move || seen.borrow_mut().push(i));
        }
        ev.run();

        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn delay_fires_after_virtual_time() {
        let _trace = trace_init();
        let ev = manual_loop();
        let fired_at = Rc::new(Cell::new(None));

        ev.handle().delay(Duration::from_millis(50), {
            let fired_at = fired_at.clone();
            let clock = ev.clock().clone();
            move |_| fired_at.set(Some(clock.now()))
        });
        ev.run();

        assert_eq!(fired_at.get(), Some(Duration::from_millis(50)));
        assert_eq!(ev.watcher_count(), 0);
    }

    #[test]
    fn repeat_until_cancelled() {
        let _trace = trace_init();
        let ev = manual_loop();
        let count = Rc::new(Cell::new(0));

        let handle = ev.handle();
        handle.repeat(Duration::from_millis(10), {
            let count = count.clone();
            let handle = handle.clone();
            move |id| {
                count.set(count.get() + 1);
                if count.get() == 3 {
                    handle.cancel(id);
                }
            }
        });
        ev.run();

        assert_eq!(count.get(), 3);
        assert_eq!(ev.clock().now(), Duration::from_millis(30));
    }

    #[test]
    fn unreferenced_watchers_dont_keep_loop_alive() {
        let _trace = trace_init();
        let ev = manual_loop();
        let fired = Rc::new(Cell::new(false));

        let id = ev.handle().delay(Duration::from_secs(10), {
            let fired = fired.clone();
            move |_| fired.set(true)
        });
        ev.handle().unreference(id);
        ev.run();

        assert!(!fired.get());
        assert_eq!(ev.watcher_count(), 1);
        ev.handle().cancel(id);
        assert_eq!(ev.watcher_count(), 0);
    }

    #[test]
    fn disabled_defer_does_not_run() {
        let _trace = trace_init();
        let ev = manual_loop();
        let fired = Rc::new(Cell::new(0));

        let id = ev.handle().defer({
            let fired = fired.clone();
            move |_| fired.set(fired.get() + 1)
        });
        ev.handle().disable(id);
        ev.run();
        assert_eq!(fired.get(), 0);

        ev.handle().enable(id);
        ev.run();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    #[should_panic(expected = "reentrant tick")]
    fn reentrant_tick_panics() {
        let ev = manual_loop();
        let handle = ev.handle();
        // bypass the panic guard of `Handle::queue`, the reentrancy check must surface directly
        handle.inner.queue(Box::new({
            let handle = handle.clone();
            move || {
                handle.tick();
            }
        }));
        ev.run();
    }
}
