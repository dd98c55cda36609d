// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A backpressured single-producer single-consumer channel.
//!
//! The producer [`emit`](Producer::emit)s values and gets back an acknowledgement promise that
//! resolves once the consumer asked for the *next* value. The consumer pulls values with
//! [`next`](Consumer::next), and may hand a value back to the producer with
//! [`send`](Consumer::send) or an error with [`throw`](Consumer::throw).
//!
//! Both sides advance their own position. Value `N` is matched with the `N`th consumer request,
//! while the payload supplied with request `N + 1` acknowledges emit `N`. A producer that awaits
//! every acknowledgement therefore never has more than one value in flight.

mod generator;
mod stream;

use crate::error::{Error, ResolutionTrace, UsageError};
use crate::future::{Deferred, Promise, is_promise};
use crate::scheduler::{Callback, EnterGuard, Handle};
use core::cell::{Cell, RefCell};
use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

pub use generator::generate;
pub use stream::ConsumerStream;

/// Creates a new channel producing `T`s, whose consumer can send back `S`s.
///
/// A channel created while a scheduler is entered keeps notifying through that scheduler, even
/// when one of its halves is dropped outside of it.
pub fn channel<T: 'static, S: 'static>() -> (Producer<T, S>, Consumer<T, S>) {
    let source = Rc::new(Source {
        inner: RefCell::new(Inner::new()),
        producers: Cell::new(1),
        handle: Handle::try_current(),
    });

    (
        Producer {
            source: source.clone(),
        },
        Consumer { source },
    )
}

/// The producing half of a channel.
pub struct Producer<T: 'static, S: 'static = ()> {
    source: Rc<Source<T, S>>,
}

/// The consuming half of a channel. Dropping it disposes the channel.
pub struct Consumer<T: 'static, S: 'static = ()> {
    source: Rc<Source<T, S>>,
}

/// What the consumer hands back to the producer alongside a request.
type Payload<S> = Result<Option<S>, Error>;

struct Source<T: 'static, S: 'static> {
    inner: RefCell<Inner<T, S>>,
    /// Live producer handles, the channel fails once the last one is dropped while still open.
    producers: Cell<usize>,
    handle: Option<Handle>,
}

struct Inner<T: 'static, S: 'static> {
    emit_position: u64,
    consume_position: u64,
    /// Values produced before the consumer asked for them.
    emitted: BTreeMap<u64, T>,
    /// Consumer requests waiting for a value.
    waiting: BTreeMap<u64, Deferred<Option<T>>>,
    /// Producers waiting for an acknowledgement.
    back_pressure: BTreeMap<u64, Deferred<Option<S>>>,
    /// Acknowledgements that arrived before the emit they belong to.
    send_values: BTreeMap<u64, Payload<S>>,
    terminal: Terminal,
    resolved_at: Option<ResolutionTrace>,
    on_disposal: Vec<Callback>,
}

enum Terminal {
    Open,
    Completed,
    Failed(Error),
    Disposed(Error),
}

// === impl Inner ===

impl<T: 'static, S: 'static> Inner<T, S> {
    fn new() -> Self {
        Self {
            emit_position: 0,
            consume_position: 0,
            emitted: BTreeMap::new(),
            waiting: BTreeMap::new(),
            back_pressure: BTreeMap::new(),
            send_values: BTreeMap::new(),
            terminal: Terminal::Open,
            resolved_at: None,
            on_disposal: Vec::new(),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.terminal, Terminal::Open)
    }
}

// === impl Source ===

impl<T: 'static, S: 'static> Source<T, S> {
    /// Enters the scheduler the channel was created on, if there was one.
    fn enter(&self) -> Option<EnterGuard> {
        self.handle.as_ref().map(Handle::enter)
    }

    /// Matches a consumer request with the producer.
    ///
    /// The request at position `p` acknowledges emit `p - 1` with `payload` (or stashes the
    /// payload until that emit happens), then receives value `p`.
    fn advance_consumer(&self, payload: Payload<S>) -> Promise<Option<T>> {
        let mut inner = self.inner.borrow_mut();

        let position = inner.consume_position;
        inner.consume_position += 1;
        tracing::trace!(position, "advancing consumer");

        // resolving only queues notifications, so it is fine to do it while borrowed
        if let Some(acknowledged) = position.checked_sub(1) {
            match inner.back_pressure.remove(&acknowledged) {
                Some(producer) => {
                    let _ = producer.settle(payload);
                }
                None => {
                    inner.send_values.insert(acknowledged, payload);
                }
            }
        }

        if let Some(value) = inner.emitted.remove(&position) {
            return Promise::completed(Some(value));
        }

        match &inner.terminal {
            Terminal::Completed => return Promise::completed(None),
            Terminal::Failed(err) | Terminal::Disposed(err) => return Promise::failed(err.clone()),
            Terminal::Open => {}
        }

        let deferred = Deferred::new();
        let promise = deferred.promise();
        inner.waiting.insert(position, deferred);
        promise
    }

    #[track_caller]
    fn emit(&self, value: T) -> Result<Promise<Option<S>>, UsageError> {
        if is_promise::<T>() {
            return Err(UsageError::InvalidEmit);
        }

        let mut inner = self.inner.borrow_mut();
        match &inner.terminal {
            Terminal::Open => {}
            Terminal::Disposed(err) => {
                tracing::trace!("emit into disposed channel");
                return Ok(Promise::failed(err.clone()));
            }
            Terminal::Completed | Terminal::Failed(_) => {
                return Err(UsageError::AlreadyResolved {
                    first: inner.resolved_at,
                });
            }
        }

        let position = inner.emit_position;
        inner.emit_position += 1;
        tracing::trace!(position, "emitting");

        match inner.waiting.remove(&position) {
            Some(consumer) => {
                let _ = consumer.resolve(Some(value));

                // the consumer already asked for the value after this one
                if let Some(payload) = inner.send_values.remove(&position) {
                    return Ok(match payload {
                        Ok(sent) => Promise::completed(sent),
                        Err(err) => Promise::failed(err),
                    });
                }
            }
            None => {
                inner.emitted.insert(position, value);
            }
        }

        let deferred = Deferred::new();
        let promise = deferred.promise();
        inner.back_pressure.insert(position, deferred);
        Ok(promise)
    }

    #[track_caller]
    fn terminate(&self, terminal: Terminal) -> Result<(), UsageError> {
        let mut inner = self.inner.borrow_mut();
        match &inner.terminal {
            Terminal::Open => {}
            // the consumer is gone, nobody is interested anymore
            Terminal::Disposed(_) => return Ok(()),
            Terminal::Completed | Terminal::Failed(_) => {
                return Err(UsageError::AlreadyResolved {
                    first: inner.resolved_at,
                });
            }
        }

        let failure = match &terminal {
            Terminal::Failed(err) => Some(err.clone()),
            _ => None,
        };
        tracing::trace!(ok = failure.is_none(), "terminating channel");

        inner.terminal = terminal;
        inner.resolved_at = ResolutionTrace::capture();

        for (_, consumer) in core::mem::take(&mut inner.waiting) {
            let _ = match &failure {
                Some(err) => consumer.fail(err.clone()),
                None => consumer.resolve(None),
            };
        }

        Ok(())
    }

    fn dispose(&self) {
        let (producers, waiting, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.is_open() {
                return;
            }

            tracing::trace!(
                blocked_producers = inner.back_pressure.len(),
                "disposing channel"
            );
            inner.terminal = Terminal::Disposed(Error::disposed());
            inner.emitted.clear();
            inner.send_values.clear();

            (
                core::mem::take(&mut inner.back_pressure),
                core::mem::take(&mut inner.waiting),
                core::mem::take(&mut inner.on_disposal),
            )
        };

        let _enter = self.enter();
        if Handle::try_current().is_none() {
            // dropping the waiters fails them without notifying anyone
            tracing::debug!("channel disposed without a scheduler");
            return;
        }

        for (_, producer) in producers {
            let _ = producer.fail(Error::disposed());
        }
        for (_, consumer) in waiting {
            let _ = consumer.fail(Error::disposed());
        }
        let handle = Handle::current();
        for callback in callbacks {
            handle.queue(callback);
        }
    }

    fn on_disposal(&self, callback: Callback) {
        {
            let mut inner = self.inner.borrow_mut();
            match inner.terminal {
                Terminal::Open => {
                    inner.on_disposal.push(callback);
                    return;
                }
                // a terminated channel is never disposed
                Terminal::Completed | Terminal::Failed(_) => return,
                Terminal::Disposed(_) => {}
            }
        }

        Handle::current().queue(callback);
    }
}

// === impl Producer ===

impl<T: 'static, S: 'static> Producer<T, S> {
    /// Emits `value`.
    ///
    /// The returned promise resolves once the consumer requested the value after this one,
    /// carrying whatever the consumer sent along with that request. It fails with the error the
    /// consumer threw in, or with [`Disposed`][crate::error::Disposed] once the consumer went
    /// away, in which case the value is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::InvalidEmit`] if `value` is a promise (promises must be resolved
    /// before they are emitted) and [`UsageError::AlreadyResolved`] if the channel was already
    /// completed or failed.
    #[track_caller]
    pub fn emit(&self, value: T) -> Result<Promise<Option<S>>, UsageError> {
        self.source.emit(value)
    }

    /// Completes the channel. The consumer receives `None` once it drained all emitted values.
    ///
    /// Completing a disposed channel is accepted and does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AlreadyResolved`] if the channel was already completed or failed.
    #[track_caller]
    pub fn complete(&self) -> Result<(), UsageError> {
        self.source.terminate(Terminal::Completed)
    }

    /// Fails the channel with `error`, delivered to the consumer after all emitted values.
    ///
    /// Failing a disposed channel is accepted and does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AlreadyResolved`] if the channel was already completed or failed.
    #[track_caller]
    pub fn fail(&self, error: Error) -> Result<(), UsageError> {
        self.source.terminate(Terminal::Failed(error))
    }

    /// Returns `true` if the channel was completed or failed.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.source.inner.borrow().terminal,
            Terminal::Completed | Terminal::Failed(_)
        )
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.source.inner.borrow().terminal, Terminal::Disposed(_))
    }

    /// Runs `callback` (through the scheduler queue) once the consumer disposes of the channel.
    ///
    /// # Panics
    ///
    /// Panics if the channel is already disposed and no scheduler is entered on this thread.
    pub fn on_disposal<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.source.on_disposal(Box::new(callback));
    }

    /// A second handle to the producing side, used by the generator driver to terminate the
    /// channel after the body's handle is gone.
    pub(crate) fn share(&self) -> Self {
        self.source.producers.set(self.source.producers.get() + 1);
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T: 'static, S: 'static> Drop for Producer<T, S> {
    fn drop(&mut self) {
        let remaining = self.source.producers.get() - 1;
        self.source.producers.set(remaining);

        if remaining == 0 && self.source.inner.borrow().is_open() {
            tracing::debug!("producer dropped without completing the channel");
            let _enter = self.source.enter();
            if Handle::try_current().is_some() {
                let _ = self
                    .source
                    .terminate(Terminal::Failed(Error::msg("the producer was dropped")));
            }
        }
    }
}

impl<T: 'static, S: 'static> fmt::Debug for Producer<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("complete", &self.is_complete())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// === impl Consumer ===

impl<T: 'static, S: 'static> Consumer<T, S> {
    /// Requests the next value, acknowledging the previous one.
    ///
    /// Resolves with `Some(value)`, or `None` once the channel completed and all values were
    /// consumed. Fails with the error the channel failed with.
    pub fn next(&self) -> Promise<Option<T>> {
        self.source.advance_consumer(Ok(None))
    }

    /// Requests the next value, handing `value` to the producer as the acknowledgement of the
    /// previous one.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NotInitialized`] if [`Consumer::next`] was never called, as there is
    /// no emitted value to acknowledge yet.
    pub fn send(&self, value: S) -> Result<Promise<Option<T>>, UsageError> {
        self.ensure_started()?;
        Ok(self.source.advance_consumer(Ok(Some(value))))
    }

    /// Requests the next value, failing the producer's acknowledgement of the previous one with
    /// `error`.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NotInitialized`] if [`Consumer::next`] was never called.
    pub fn throw(&self, error: Error) -> Result<Promise<Option<T>>, UsageError> {
        self.ensure_started()?;
        Ok(self.source.advance_consumer(Err(error)))
    }

    /// Disposes the channel, releasing a producer blocked on an acknowledgement.
    ///
    /// Does nothing if the channel already completed or failed.
    pub fn dispose(&self) {
        self.source.dispose();
    }

    /// Turns this consumer into a [`futures::Stream`] of values.
    pub fn into_stream(self) -> ConsumerStream<T, S>
    where
        T: Clone,
    {
        ConsumerStream::new(self)
    }

    fn ensure_started(&self) -> Result<(), UsageError> {
        if self.source.inner.borrow().consume_position == 0 {
            return Err(UsageError::NotInitialized);
        }
        Ok(())
    }
}

impl<T: 'static, S: 'static> Drop for Consumer<T, S> {
    fn drop(&mut self) {
        self.source.dispose();
    }
}

impl<T: 'static, S: 'static> fmt::Debug for Consumer<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.source.inner.borrow();
        f.debug_struct("Consumer")
            .field("position", &inner.consume_position)
            .field("open", &inner.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockScheduler, trace_init};

    fn value<T: Clone + 'static>(promise: &Promise<T>) -> T {
        promise.outcome().unwrap().clone().unwrap()
    }

    #[test]
    fn emit_waits_for_the_next_request() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u32, ()>();
        let ack = producer.emit(1).unwrap();
        assert!(!ack.is_complete());

        let first = consumer.next();
        assert_eq!(value(&first), Some(1));
        assert!(!ack.is_complete(), "emit 0 is acknowledged by request 1");

        let second = consumer.next();
        assert!(ack.is_complete());
        assert!(!second.is_complete());
    }

    #[test]
    fn two_emits_keep_order() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<&str, ()>();
        let first_ack = producer.emit("a").unwrap();
        let second_ack = producer.emit("b").unwrap();

        assert_eq!(value(&consumer.next()), Some("a"));
        assert!(!second_ack.is_complete());
        assert_eq!(value(&consumer.next()), Some("b"));
        assert!(first_ack.is_complete());
        assert!(!second_ack.is_complete());

        let _ = consumer.next();
        assert!(second_ack.is_complete());

        let inner = producer.source.inner.borrow();
        assert!(inner.emitted.is_empty());
        assert!(inner.back_pressure.is_empty());
    }

    #[test]
    fn waiting_consumer_gets_value() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        let request = consumer.next();
        assert!(!request.is_complete());

        let _ack = producer.emit(9).unwrap();
        assert_eq!(value(&request), Some(9));
    }

    #[test]
    fn send_reaches_producer_one_emit_later() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, &str>();

        let first = consumer.next();
        let ack0 = producer.emit(0).unwrap();
        assert_eq!(value(&first), Some(0));

        let second = consumer.send("for emit 0").unwrap();
        assert_eq!(value(&ack0), Some("for emit 0"));

        // the consumer runs ahead: its payload waits for the emit it acknowledges
        let _third = consumer.send("for emit 1").unwrap();
        let ack1 = producer.emit(1).unwrap();
        assert_eq!(value(&second), Some(1));
        assert_eq!(value(&ack1), Some("for emit 1"));
    }

    #[test]
    fn throw_fails_the_acknowledgement() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        let ack = producer.emit(0).unwrap();
        let _ = consumer.next();
        let _ = consumer.throw(Error::msg("stop")).unwrap();

        let err = ack.outcome().unwrap().clone().unwrap_err();
        assert_eq!(err.to_string(), "stop");
    }

    #[test]
    fn send_before_next_is_rejected() {
        let (_producer, consumer) = channel::<u8, u8>();
        assert_eq!(consumer.send(1).unwrap_err(), UsageError::NotInitialized);
        assert_eq!(
            consumer.throw(Error::msg("x")).unwrap_err(),
            UsageError::NotInitialized
        );
    }

    #[test]
    fn emitting_a_promise_is_rejected() {
        let (producer, _consumer) = channel::<Promise<u8>, ()>();
        assert_eq!(
            producer.emit(Promise::completed(1)).unwrap_err(),
            UsageError::InvalidEmit
        );
    }

    #[test]
    fn completion_after_values() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        let _ = producer.emit(1).unwrap();
        producer.complete().unwrap();

        assert!(producer.is_complete());
        assert!(matches!(
            producer.complete(),
            Err(UsageError::AlreadyResolved { .. })
        ));
        assert!(matches!(
            producer.emit(2),
            Err(UsageError::AlreadyResolved { .. })
        ));

        assert_eq!(value(&consumer.next()), Some(1));
        assert_eq!(value(&consumer.next()), None);
        assert_eq!(value(&consumer.next()), None);
    }

    #[test]
    fn failure_reaches_waiting_consumer() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        let request = consumer.next();
        producer.fail(Error::msg("upstream broke")).unwrap();

        let err = request.join().unwrap_err();
        assert_eq!(err.to_string(), "upstream broke");
    }

    #[test]
    fn dispose_releases_blocked_producer() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        let disposed = Rc::new(Cell::new(false));
        producer.on_disposal({
            let disposed = disposed.clone();
            move || disposed.set(true)
        });

        let ack = producer.emit(1).unwrap();
        consumer.dispose();

        assert!(ack.join().unwrap_err().is_disposed());
        mock.run_until_idle();
        assert!(producer.is_disposed());
        assert!(!producer.is_complete());
        assert!(disposed.get());

        // the producer is released, not errored
        let late = producer.emit(2).unwrap();
        assert!(late.join().unwrap_err().is_disposed());
        producer.complete().unwrap();
    }

    #[test]
    fn terminal_states_reach_waiting_consumers_of_non_clone_values() {
        struct Token;

        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<Token, ()>();
        let request = consumer.next();
        producer.complete().unwrap();
        assert!(matches!(request.outcome(), Some(Ok(None))));

        let (producer, consumer) = channel::<Token, ()>();
        let request = consumer.next();
        producer.fail(Error::msg("upstream broke")).unwrap();
        mock.run_until_idle();
        assert!(matches!(
            request.outcome(),
            Some(Err(err)) if err.to_string() == "upstream broke"
        ));
    }

    #[test]
    fn dispose_outside_the_scheduler_releases_blocked_producer() {
        let _trace = trace_init();
        let mock = MockScheduler::new();

        let (producer, consumer) = {
            let _guard = mock.handle().enter();
            channel::<u8, ()>()
        };
        let ack = producer.emit(1).unwrap();
        let released = Rc::new(Cell::new(false));
        ack.subscribe({
            let released = released.clone();
            move |outcome| released.set(outcome.as_ref().is_err_and(Error::is_disposed))
        });

        // no scheduler is entered here
        drop(consumer);
        assert!(ack.is_complete());
        assert!(!released.get(), "notifications are queued");

        mock.run_until_idle();
        assert!(released.get());
        assert!(producer.is_disposed());
    }

    #[test]
    fn dropping_consumer_disposes() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        drop(consumer);
        assert!(producer.is_disposed());
    }

    #[test]
    fn dispose_after_completion_is_ignored() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        producer.complete().unwrap();
        consumer.dispose();

        assert!(!producer.is_disposed());
        assert_eq!(value(&consumer.next()), None);
    }

    #[test]
    fn dropping_producer_fails_channel() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let (producer, consumer) = channel::<u8, ()>();
        drop(producer);
        assert!(consumer.next().join().is_err());
    }
}
