// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::type_name;
use core::panic::Location;

use crate::coroutine::{Coroutine, DEFAULT_MAX_DEPTH, Id};
use crate::error::Error;
use crate::future::Promise;
use crate::scheduler::Handle;

/// Configures coroutines before spawning them.
#[derive(Debug, Clone)]
pub struct Builder<'a> {
    location: Option<Location<'a>>,
    name: Option<&'a str>,
    max_depth: usize,
}

impl<'a> Builder<'a> {
    pub const fn new() -> Self {
        Self {
            location: None,
            name: None,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Override the name of coroutines spawned by this builder.
    ///
    /// By default, coroutines are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the source code location that will be associated with coroutines spawned by this
    /// builder.
    ///
    /// By default, coroutines will inherit the source code location of where they have been
    /// spawned.
    #[must_use]
    pub fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }

    /// Override how many already resolved promises a coroutine may await in a row before its next
    /// resumption is rescheduled through the scheduler queue.
    ///
    /// Defaults to [`DEFAULT_MAX_DEPTH`].
    #[must_use]
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Spawns `future` as a coroutine on the current scheduler.
    ///
    /// The first step runs synchronously, before this method returns. The returned promise
    /// resolves with the coroutine's output.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler is entered on the calling thread.
    #[inline]
    #[track_caller]
    pub fn spawn<F, T>(&self, future: F) -> Promise<T>
    where
        F: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let id = Id::next();

        let loc = self.location.as_ref().unwrap_or(Location::caller());
        let span = tracing::debug_span!(
            "coroutine",
            coroutine.id = id.as_u64(),
            coroutine.name = ?self.name,
            coroutine.output = %type_name::<T>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        Coroutine::start(future, id, span, self.max_depth, Handle::current())
    }
}

impl Default for Builder<'_> {
    fn default() -> Self {
        Self::new()
    }
}
