// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coroutine::{Id, resume};
use core::task::Waker;
use std::sync::Arc;
use std::task::Wake;
use std::thread::{self, ThreadId};

/// The wake handle of a coroutine.
///
/// [`Waker`]s must be `Send + Sync`, coroutines are not. The handle therefore only carries the
/// coroutine's id and owning thread, the coroutine itself is looked up in the owning thread's
/// registry.
struct WakeHandle {
    owner: ThreadId,
    id: Id,
}

pub(crate) fn waker(id: Id) -> Waker {
    Waker::from(Arc::new(WakeHandle {
        owner: thread::current().id(),
        id,
    }))
}

impl Wake for WakeHandle {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if thread::current().id() != self.owner {
            tracing::warn!(
                coroutine.id = %self.id,
                "coroutine woken from a foreign thread, ignoring"
            );
            return;
        }

        resume(self.id);
    }
}
