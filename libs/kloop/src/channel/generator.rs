// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::channel::{Consumer, Producer, channel};
use crate::coroutine;
use crate::error::Error;

/// Runs `body` as a coroutine producing into a fresh channel and returns the consuming half.
///
/// The channel completes when `body` returns `Ok(())` and fails when it returns an error. Once the
/// consumer disposes of the channel, the generator is stopped at its next emit.
///
/// ```
/// # use kloop::channel::generate;
/// # use kloop::scheduler::EventLoop;
/// let ev = EventLoop::new();
/// let _guard = ev.enter();
///
/// let numbers = generate::<u32, (), _, _>(|producer| async move {
///     for i in 0..3 {
///         producer.emit(i)?.await?;
///     }
///     Ok(())
/// });
///
/// assert_eq!(ev.block_on(numbers.next()).unwrap(), Some(0));
/// ```
///
/// # Panics
///
/// Panics if no scheduler is entered on the calling thread.
#[track_caller]
pub fn generate<T, S, F, Fut>(body: F) -> Consumer<T, S>
where
    T: 'static,
    S: Clone + 'static,
    F: FnOnce(Producer<T, S>) -> Fut,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    let (producer, consumer) = channel();
    let driver = producer.share();
    let body = body(producer);

    let _ = coroutine::Builder::new().name("generator").spawn(async move {
        match body.await {
            Ok(()) => {
                let _ = driver.complete();
            }
            Err(err) if err.is_disposed() => {
                tracing::debug!("generator stopped, consumer disposed");
            }
            Err(err) => {
                let _ = driver.fail(err);
            }
        }
        Ok(())
    });

    consumer
}
