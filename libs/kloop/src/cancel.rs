// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative cancellation.
//!
//! A [`CancellationTokenSource`] hands out [`CancellationToken`]s and cancels them exactly once.
//! Cancellation is advisory: nothing is torn down forcibly, a computation observes cancellation
//! through [`CancellationToken::throw_if_requested`], a subscription, or by racing the token
//! against the promise it awaits ([`CancellationToken::race`]).

use crate::error::{Cancelled, Error};
use crate::future::{Deferred, Promise, State, SubscriptionId};
use crate::scheduler::{Handle, WatcherId};
use core::cell::Cell;
use core::convert::Infallible;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::rc::{Rc, Weak};

/// Cancels the tokens it hands out.
pub struct CancellationTokenSource {
    shared: Rc<Shared>,
}

/// A handle to observe cancellation requests.
#[derive(Clone)]
pub struct CancellationToken {
    kind: TokenKind,
}

#[derive(Clone)]
enum TokenKind {
    /// Never cancelled.
    Never,
    Source(Rc<Shared>),
    Combined(Rc<Combined>),
    Timeout(Rc<TimeoutToken>),
}

/// The cancellation cell: a single-assignment cell that can only ever fail.
struct Shared {
    cell: Rc<State<Infallible>>,
    /// Position in the global cancellation order, used to pick the first of several sources.
    sequence: Cell<Option<u64>>,
}

struct Combined {
    shared: Rc<Shared>,
    sources: Vec<(CancellationToken, SubscriptionId)>,
}

struct TimeoutToken {
    shared: Rc<Shared>,
    watcher: WatcherId,
    handle: Handle,
}

fn next_sequence() -> u64 {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

fn as_error(outcome: &Result<Infallible, Error>) -> &Error {
    match outcome {
        Ok(never) => match *never {},
        Err(err) => err,
    }
}

// === impl Shared ===

impl Shared {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            cell: State::new(),
            sequence: Cell::new(None),
        })
    }

    fn reason(&self) -> Option<&Error> {
        self.cell.outcome().map(as_error)
    }

    fn cancelled(&self) -> Option<(u64, Error)> {
        Some((self.sequence.get()?, self.reason()?.clone()))
    }

    /// Returns `false` if already cancelled.
    fn cancel(&self, error: Error) -> bool {
        if self.cell.is_complete() {
            tracing::trace!("cancellation already requested");
            return false;
        }

        self.sequence.set(Some(next_sequence()));
        tracing::trace!(reason = %error, "cancellation requested");
        self.cell.resolve(Err(error)).is_ok()
    }

    fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce(&Error) + 'static,
    {
        self.cell
            .subscribe(Box::new(move |outcome| callback(as_error(outcome))))
    }
}

// === impl CancellationTokenSource ===

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            kind: TokenKind::Source(self.shared.clone()),
        }
    }

    /// Requests cancellation, optionally giving a reason.
    ///
    /// Only the first call has any effect: it stores a [`Cancelled`] error (with `reason` as its
    /// cause) and queues every subscriber with it.
    ///
    /// # Panics
    ///
    /// Panics if the token has subscribers but no scheduler is entered on this thread.
    pub fn cancel(&self, reason: Option<Error>) {
        self.shared.cancel(Cancelled::new(reason).into());
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cell.is_complete()
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// === impl CancellationToken ===

impl CancellationToken {
    /// A token that is never cancelled.
    pub const fn none() -> Self {
        Self {
            kind: TokenKind::Never,
        }
    }

    /// A token cancelled as soon as any of `tokens` is cancelled.
    ///
    /// The first source to be cancelled determines the reason. The combined token stops
    /// listening to its sources once the last handle to it is dropped.
    pub fn any<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = CancellationToken>,
    {
        let shared = Shared::new();
        let weak = Rc::downgrade(&shared);
        let tokens: Vec<_> = tokens.into_iter().collect();

        let mut sources = Vec::with_capacity(tokens.len());
        for token in tokens.iter().filter(|t| !matches!(t.kind, TokenKind::Never)) {
            let id = token.subscribe({
                let weak: Weak<Shared> = weak.clone();
                let tokens = tokens.clone();
                move |_| {
                    if let Some(shared) = weak.upgrade()
                        && let Some((_, reason)) = earliest(&tokens)
                    {
                        shared.cancel(reason);
                    }
                }
            });
            sources.push((token.clone(), id));
        }

        Self {
            kind: TokenKind::Combined(Rc::new(Combined { shared, sources })),
        }
    }

    /// A token cancelled with a timeout error once `after` has elapsed.
    ///
    /// The underlying timer does not keep the scheduler alive, and is cancelled when the last
    /// handle to the token is dropped.
    ///
    /// # Panics
    ///
    /// Panics if no scheduler is entered on the calling thread.
    pub fn timeout(after: Duration) -> Self {
        let handle = Handle::current();
        let shared = Shared::new();

        let watcher = handle.delay(after, {
            let shared = shared.clone();
            move |_| {
                shared.cancel(Cancelled::timed_out(after).into());
            }
        });
        handle.unreference(watcher);
        tracing::trace!(?after, ?watcher, "timeout token armed");

        Self {
            kind: TokenKind::Timeout(Rc::new(TimeoutToken {
                shared,
                watcher,
                handle,
            })),
        }
    }

    fn shared(&self) -> Option<&Rc<Shared>> {
        match &self.kind {
            TokenKind::Never => None,
            TokenKind::Source(shared) => Some(shared),
            TokenKind::Combined(combined) => Some(&combined.shared),
            TokenKind::Timeout(timeout) => Some(&timeout.shared),
        }
    }

    /// Calls `callback` with the cancellation error once cancellation is requested.
    ///
    /// Like promise subscribers, the callback is always invoked through the scheduler queue.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnOnce(&Error) + 'static,
    {
        match self.shared() {
            Some(shared) => shared.subscribe(callback),
            // the callback can never run, a fresh cell hands out a valid, inert id
            None => State::<Infallible>::new().subscribe(Box::new(|_| {})),
        }
    }

    /// Removes a subscription. Advisory only, see [`Promise::unsubscribe`].
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(shared) = self.shared() {
            shared.cell.unsubscribe(id);
        }
    }

    /// Returns `true` if cancellation was requested.
    ///
    /// Combined tokens consult their sources directly, without waiting for the queued
    /// notification.
    pub fn is_requested(&self) -> bool {
        self.reason().is_some()
    }

    /// Returns the cancellation error if cancellation was requested.
    pub fn reason(&self) -> Option<Error> {
        self.first_cancelled().map(|(_, reason)| reason)
    }

    /// The earliest cancellation that reached this token, with its position in the global
    /// cancellation order.
    ///
    /// Combined tokens walk down to their leaf sources, so nesting neither delays the request nor
    /// changes which source wins.
    fn first_cancelled(&self) -> Option<(u64, Error)> {
        match &self.kind {
            TokenKind::Never => None,
            TokenKind::Source(shared) => shared.cancelled(),
            TokenKind::Timeout(timeout) => timeout.shared.cancelled(),
            TokenKind::Combined(combined) => {
                let own = combined.shared.cancelled();
                earliest(combined.sources.iter().map(|(token, _)| token))
                    .into_iter()
                    .chain(own)
                    .min_by_key(|(sequence, _)| *sequence)
            }
        }
    }

    /// Returns `Err` with the cancellation error if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns the [`Error::Cancelled`] error the token was cancelled with.
    pub fn throw_if_requested(&self) -> Result<(), Error> {
        match self.reason() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Races `promise` against this token.
    ///
    /// The returned promise adopts the outcome of `promise`, unless cancellation is requested
    /// first, in which case it fails with the cancellation error. The token subscription is
    /// removed once `promise` settles.
    pub fn race<T>(&self, promise: Promise<T>) -> Promise<T>
    where
        T: Clone + 'static,
    {
        if let Some(reason) = self.reason() {
            return Promise::failed(reason);
        }
        if matches!(self.kind, TokenKind::Never) {
            return promise;
        }

        let deferred = Rc::new(Deferred::new());
        let out = deferred.promise();

        let cancelled = self.subscribe({
            let deferred = deferred.clone();
            move |err| {
                if !deferred.is_resolved() {
                    let _ = deferred.fail(err.clone());
                }
            }
        });

        let token = self.clone();
        promise.subscribe(move |outcome| {
            token.unsubscribe(cancelled);
            if !deferred.is_resolved() {
                let _ = deferred.settle(outcome.clone());
            }
        });

        out
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            TokenKind::Never => "never",
            TokenKind::Source(_) => "source",
            TokenKind::Combined(_) => "combined",
            TokenKind::Timeout(_) => "timeout",
        };

        f.debug_struct("CancellationToken")
            .field("kind", &kind)
            .field("requested", &self.is_requested())
            .finish()
    }
}

/// The cancellation of whichever of `tokens` was cancelled first, if any.
fn earliest<'a>(
    tokens: impl IntoIterator<Item = &'a CancellationToken>,
) -> Option<(u64, Error)> {
    tokens
        .into_iter()
        .filter_map(CancellationToken::first_cancelled)
        .min_by_key(|(sequence, _)| *sequence)
}

// === impl Combined ===

impl Drop for Combined {
    fn drop(&mut self) {
        for (token, id) in &self.sources {
            token.unsubscribe(*id);
        }
    }
}

// === impl TimeoutToken ===

impl Drop for TimeoutToken {
    fn drop(&mut self) {
        tracing::trace!(watcher = ?self.watcher, "timeout token dropped, cancelling timer");
        self.handle.cancel(self.watcher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockScheduler, trace_init};
    use core::cell::RefCell;

    fn reason_message(token: &CancellationToken) -> String {
        let Some(Error::Cancelled(cancelled)) = token.reason() else {
            panic!("token not cancelled");
        };
        cancelled.cause().map(ToString::to_string).unwrap_or_default()
    }

    #[test]
    fn cancel_is_idempotent() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        let token = source.token();
        let notified = Rc::new(RefCell::new(Vec::new()));
        token.subscribe({
            let notified = notified.clone();
            move |err| notified.borrow_mut().push(err.to_string())
        });

        source.cancel(Some(Error::msg("A")));
        source.cancel(Some(Error::msg("B")));
        assert!(notified.borrow().is_empty(), "notifications are queued");
        mock.run_until_idle();

        assert_eq!(*notified.borrow(), vec!["operation was cancelled: A".to_owned()]);
        assert_eq!(reason_message(&token), "A");
        assert!(token.throw_if_requested().unwrap_err().is_cancelled());
    }

    #[test]
    fn late_subscriber_is_queued() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        source.cancel(None);

        let seen = Rc::new(Cell::new(false));
        source.token().subscribe({
            let seen = seen.clone();
            move |_| seen.set(true)
        });
        assert!(!seen.get());
        mock.run_until_idle();
        assert!(seen.get());
    }

    #[test]
    fn combined_first_wins() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let t1 = CancellationTokenSource::new();
        let t2 = CancellationTokenSource::new();
        let combined = CancellationToken::any([t1.token(), t2.token()]);
        assert!(!combined.is_requested());

        t2.cancel(Some(Error::msg("second source")));
        assert!(combined.is_requested(), "must not wait for the queue");
        assert_eq!(reason_message(&combined), "second source");

        t1.cancel(Some(Error::msg("first source")));
        mock.run_until_idle();
        assert_eq!(reason_message(&combined), "second source");
    }

    #[test]
    fn nested_combined_observes_sources_immediately() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        let inner = CancellationToken::any([source.token()]);
        let outer = CancellationToken::any([inner.clone()]);

        source.cancel(Some(Error::msg("leaf")));
        assert!(inner.is_requested());
        assert!(outer.is_requested(), "must not wait for the queue");
        assert_eq!(reason_message(&outer), "leaf");
    }

    #[test]
    fn nested_combined_first_wins_by_source_order() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let t1 = CancellationTokenSource::new();
        let t2 = CancellationTokenSource::new();
        let combined = CancellationToken::any([CancellationToken::any([t1.token()]), t2.token()]);

        t1.cancel(Some(Error::msg("first source")));
        t2.cancel(Some(Error::msg("second source")));
        assert_eq!(reason_message(&combined), "first source");

        mock.run_until_idle();
        assert_eq!(reason_message(&combined), "first source");
    }

    #[test]
    fn timeout_token_as_combined_source() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        let combined = CancellationToken::any([
            CancellationToken::timeout(Duration::from_millis(10)),
            source.token(),
        ]);
        assert!(!combined.is_requested());

        mock.advance(Duration::from_millis(10));
        assert!(combined.is_requested());

        source.cancel(Some(Error::msg("too late")));
        mock.run_until_idle();
        assert!(combined.reason().unwrap().is_timeout());
    }

    #[test]
    fn dropped_combined_token_unsubscribes() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        let combined = CancellationToken::any([source.token(), CancellationToken::none()]);
        assert_eq!(source.shared.cell.subscriber_count(), 1);

        drop(combined);
        assert_eq!(source.shared.cell.subscriber_count(), 0);
    }

    #[test]
    fn timeout_token_cleans_up_timer() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let token = CancellationToken::timeout(Duration::from_secs(1));
        assert_eq!(mock.pending_timers(), 1);

        drop(token);
        assert_eq!(mock.pending_timers(), 0);
    }

    #[test]
    fn timeout_token_fires() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let token = CancellationToken::timeout(Duration::from_millis(10));
        mock.advance(Duration::from_millis(10));

        let err = token.throw_if_requested().unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn race_against_token() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        let token = source.token();

        let never = Deferred::<u8>::new();
        let raced = token.race(never.promise());
        source.cancel(None);
        assert!(raced.join().unwrap_err().is_cancelled());

        let won = token.race(Promise::completed(1u8));
        assert!(won.join().unwrap_err().is_cancelled());

        let settled = CancellationToken::none().race(Promise::completed(2u8));
        assert_eq!(settled.join().unwrap(), 2);
    }

    #[test]
    fn race_unsubscribes_when_promise_settles() {
        let _trace = trace_init();
        let mock = MockScheduler::new();
        let _guard = mock.handle().enter();

        let source = CancellationTokenSource::new();
        let raced = source.token().race(Promise::completed(3u8));
        assert_eq!(source.shared.cell.subscriber_count(), 1);

        assert_eq!(raced.join().unwrap(), 3);
        assert_eq!(source.shared.cell.subscriber_count(), 0);
    }
}
