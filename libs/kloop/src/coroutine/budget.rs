// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-step bookkeeping of the coroutine currently being polled on this thread.
//!
//! Every await of an already resolved promise continues the current step on the same call stack.
//! The budget caps how many of those a single step may chain before the driver has to go through
//! the scheduler queue, bounding stack growth.

use crate::error::Error;
use core::cell::Cell;

#[derive(Clone, Copy, Debug)]
struct Step {
    depth: usize,
    max_depth: usize,
    disposed: bool,
}

std::thread_local! {
    static CURRENT: Cell<Option<Step>> = const { Cell::new(None) };
}

/// Restores the enclosing step (if any) when dropped.
#[must_use]
pub(crate) struct StepGuard {
    prev: Option<Step>,
}

/// Begins a new step with a fresh depth counter.
pub(crate) fn enter(max_depth: usize) -> StepGuard {
    let prev = CURRENT.with(|current| {
        current.replace(Some(Step {
            depth: 0,
            max_depth,
            disposed: false,
        }))
    });
    StepGuard { prev }
}

/// Accounts for one synchronously ready await.
///
/// Returns `false` once the current step exhausted its budget or observed a disposal, the caller
/// must then yield. Outside of a coroutine step there is no budget and this always returns `true`.
pub(crate) fn consume() -> bool {
    CURRENT.with(|current| match current.get() {
        Some(step) if step.disposed => false,
        Some(mut step) if step.depth < step.max_depth => {
            step.depth += 1;
            current.set(Some(step));
            true
        }
        Some(step) => {
            tracing::trace!(depth = step.depth, "coroutine budget exhausted");
            false
        }
        None => true,
    })
}

/// Notes an error delivered into the current step.
pub(crate) fn observe(error: &Error) {
    if !error.is_disposed() {
        return;
    }

    CURRENT.with(|current| {
        if let Some(mut step) = current.get() {
            step.disposed = true;
            current.set(Some(step));
        }
    });
}

impl StepGuard {
    /// Ends the step, returning `true` if a disposal was delivered into it.
    pub(crate) fn finish(self) -> bool {
        CURRENT.with(|current| current.get().is_some_and(|step| step.disposed))
    }
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| current.set(prev));
    }
}
