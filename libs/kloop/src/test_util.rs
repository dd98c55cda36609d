// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::{Callback, Handle, Schedule, Tick, WatcherCallback, WatcherId};
use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a test subscriber for the current thread, filtered through `RUST_LOG`.
pub fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// A [`Schedule`] implementation that only runs anything when told to, and keeps count of what
/// was handed to it.
///
/// Time is virtual and only moves through [`MockScheduler::advance`].
pub struct MockScheduler {
    inner: Rc<Mock>,
}

struct Mock {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    queue: RefCell<VecDeque<Callback>>,
    queued: Cell<usize>,
    watchers: RefCell<BTreeMap<WatcherId, MockWatcher>>,
}

struct MockWatcher {
    /// `None` for defer watchers, which fire on the next tick.
    deadline: Option<Duration>,
    interval: Option<Duration>,
    enabled: bool,
    callback: Option<WatcherCallback>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Mock {
                now: Cell::new(Duration::ZERO),
                next_id: Cell::new(1),
                queue: RefCell::new(VecDeque::new()),
                queued: Cell::new(0),
                watchers: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle::new(self.inner.clone())
    }

    /// The number of callbacks ever handed to [`Schedule::queue`].
    pub fn queued(&self) -> usize {
        self.inner.queued.get()
    }

    /// The number of live timer watchers.
    pub fn pending_timers(&self) -> usize {
        self.inner
            .watchers
            .borrow()
            .values()
            .filter(|w| w.deadline.is_some())
            .count()
    }

    /// Ticks until there are no queued callbacks left.
    pub fn run_until_idle(&self) {
        while self.inner.tick().has_remaining {}
    }

    /// Moves virtual time forward, fires every timer that became due and runs until idle.
    pub fn advance(&self, by: Duration) {
        self.inner.now.set(self.inner.now.get() + by);
        self.run_until_idle();
    }
}

impl Mock {
    fn register(
        &self,
        deadline: Option<Duration>,
        interval: Option<Duration>,
        callback: WatcherCallback,
    ) -> WatcherId {
        let id = WatcherId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.watchers.borrow_mut().insert(
            id,
            MockWatcher {
                deadline,
                interval,
                enabled: true,
                callback: Some(callback),
            },
        );
        id
    }

    fn fire_due(&self) -> usize {
        let now = self.now.get();
        let due: Vec<_> = self
            .watchers
            .borrow()
            .iter()
            .filter(|(_, w)| w.enabled && w.deadline.is_none_or(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &due {
            let callback = self
                .watchers
                .borrow_mut()
                .get_mut(id)
                .and_then(|w| w.callback.take());
            let Some(mut callback) = callback else {
                continue;
            };
            callback(*id);

            let mut watchers = self.watchers.borrow_mut();
            match watchers.get_mut(id) {
                Some(watcher) if watcher.interval.is_some() => {
                    watcher.deadline = watcher.interval.map(|i| now + i);
                    watcher.callback = Some(callback);
                }
                Some(_) => {
                    watchers.remove(id);
                }
                None => {}
            }
        }

        due.len()
    }
}

impl Schedule for Mock {
    fn queue(&self, callback: Callback) {
        self.queued.set(self.queued.get() + 1);
        self.queue.borrow_mut().push_back(callback);
    }

    fn defer(&self, callback: WatcherCallback) -> WatcherId {
        self.register(None, None, callback)
    }

    fn delay(&self, after: Duration, callback: WatcherCallback) -> WatcherId {
        self.register(Some(self.now.get() + after), None, callback)
    }

    fn repeat(&self, interval: Duration, callback: WatcherCallback) -> WatcherId {
        self.register(Some(self.now.get() + interval), Some(interval), callback)
    }

    fn enable(&self, id: WatcherId) {
        if let Some(watcher) = self.watchers.borrow_mut().get_mut(&id) {
            watcher.enabled = true;
        }
    }

    fn disable(&self, id: WatcherId) {
        if let Some(watcher) = self.watchers.borrow_mut().get_mut(&id) {
            watcher.enabled = false;
        }
    }

    fn cancel(&self, id: WatcherId) {
        self.watchers.borrow_mut().remove(&id);
    }

    fn reference(&self, _id: WatcherId) {}

    fn unreference(&self, _id: WatcherId) {}

    fn tick(&self) -> Tick {
        let timers_fired = self.fire_due();

        let mut ran = 0;
        loop {
            let Some(callback) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            callback();
            ran += 1;
        }

        Tick {
            ran,
            timers_fired,
            has_remaining: !self.queue.borrow().is_empty() || timers_fired > 0,
        }
    }
}
