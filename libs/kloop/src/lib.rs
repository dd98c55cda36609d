// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-threaded cooperative concurrency core.
//!
//! Everything in this crate runs on one thread and is driven by a [`scheduler::Handle`]: an
//! [`EventLoop`] in production, or any other [`scheduler::Schedule`] implementation. On top of
//! the scheduler sit single-assignment [`Promise`]s, coroutines written as ordinary `async` blocks
//! ([`spawn`]), cooperative [`cancel::CancellationToken`]s and backpressured [`channel`]s.
//!
//! ```
//! use kloop::{EventLoop, channel::generate, spawn};
//!
//! let ev = EventLoop::new();
//! let _guard = ev.enter();
//!
//! let squares = generate::<u32, (), _, _>(|producer| async move {
//!     for i in 1..=3 {
//!         producer.emit(i * i)?.await?;
//!     }
//!     Ok(())
//! });
//!
//! let sum = spawn(async move {
//!     let mut sum = 0;
//!     while let Some(square) = squares.next().await? {
//!         sum += square;
//!     }
//!     Ok(sum)
//! });
//!
//! assert_eq!(ev.block_on(sum).unwrap(), 14);
//! ```

pub mod cancel;
pub mod channel;
pub mod coroutine;
pub mod error;
pub mod future;
pub mod scheduler;
#[cfg(test)]
mod test_util;
pub mod time;

pub use coroutine::spawn;
pub use error::Error;
pub use future::{Deferred, Promise};
pub use scheduler::EventLoop;
