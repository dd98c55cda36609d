// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::panic::Location;
use core::time::Duration;
use std::sync::Arc;

/// The failure outcome of a [`Promise`][crate::future::Promise], a cancelled
/// [`CancellationToken`][crate::cancel::CancellationToken] or a terminated channel.
///
/// Errors are delivered to every subscriber of a cell, so this type is cheap to clone. User
/// errors are carried as [`anyhow::Error`], which keeps the original error (and its backtrace)
/// intact all the way to [`Promise::join`][crate::future::Promise::join].
#[derive(Clone)]
pub enum Error {
    /// Cancellation was requested, see [`Cancelled`].
    Cancelled(Cancelled),
    /// The consuming side walked away, see [`Disposed`].
    Disposed(Disposed),
    /// Any other error.
    Custom(Arc<anyhow::Error>),
}

/// The terminal error of a cancelled token.
///
/// A cancellation triggered by a timeout token is a `Cancelled` with [`Cancelled::timeout`] set.
#[derive(Clone)]
pub struct Cancelled {
    timeout: Option<Duration>,
    cause: Option<Box<Error>>,
}

/// Returned to a producer whose consumer disposed of the channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Disposed(pub(crate) ());

/// Programmer errors.
///
/// These indicate a violated core invariant rather than a recoverable runtime condition, which
/// is why every API returning them is `#[must_use]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// A future or channel was completed twice.
    AlreadyResolved {
        /// Where the first resolution happened, when the `resolution-trace` feature is enabled.
        first: Option<ResolutionTrace>,
    },
    /// A future was completed with another future as its value.
    InvalidResult,
    /// A value was sent or thrown into a channel before the first call to `next`.
    NotInitialized,
    /// A pending future was emitted into a channel.
    InvalidEmit,
}

/// Call site of the first resolution of a cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolutionTrace(&'static Location<'static>);

// === impl Error ===

impl Error {
    /// Wraps an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Custom(Arc::new(error.into()))
    }

    /// Creates an error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(anyhow::Error::msg(message)))
    }

    pub(crate) fn disposed() -> Self {
        Self::Disposed(Disposed(()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Cancelled(c) if c.timeout.is_some())
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed(_))
    }

    /// Attempts to downcast a [`Error::Custom`] to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Custom(inner) => inner.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(c) => f.debug_tuple("Cancelled").field(c).finish(),
            Self::Disposed(d) => f.debug_tuple("Disposed").field(d).finish(),
            Self::Custom(e) => f.debug_tuple("Custom").field(&**e).finish(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(c) => fmt::Display::fmt(c, f),
            Self::Disposed(d) => fmt::Display::fmt(d, f),
            Self::Custom(e) => fmt::Display::fmt(&**e, f),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Cancelled(c) => c.cause.as_deref().map(|e| e as _),
            Self::Disposed(_) => None,
            Self::Custom(e) => {
                let wrapped: &(dyn core::error::Error + 'static) = (**e).as_ref();
                Some(wrapped)
            }
        }
    }
}

impl From<Cancelled> for Error {
    fn from(c: Cancelled) -> Self {
        Self::Cancelled(c)
    }
}

impl From<Disposed> for Error {
    fn from(d: Disposed) -> Self {
        Self::Disposed(d)
    }
}

impl From<UsageError> for Error {
    fn from(e: UsageError) -> Self {
        Self::new(e)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Self::Custom(Arc::new(e))
    }
}

// === impl Cancelled ===

impl Cancelled {
    pub(crate) fn new(cause: Option<Error>) -> Self {
        Self {
            timeout: None,
            cause: cause.map(Box::new),
        }
    }

    pub(crate) fn timed_out(after: Duration) -> Self {
        Self {
            timeout: Some(after),
            cause: None,
        }
    }

    /// The duration after which the timeout token fired, if this cancellation was a timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The reason that was passed to [`CancellationTokenSource::cancel`].
    ///
    /// [`CancellationTokenSource::cancel`]: crate::cancel::CancellationTokenSource::cancel
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled")
            .field("timeout", &self.timeout)
            .field("cause", &self.cause)
            .finish()
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.timeout, &self.cause) {
            (Some(after), _) => write!(f, "operation timed out after {after:?}"),
            (None, Some(cause)) => write!(f, "operation was cancelled: {cause}"),
            (None, None) => f.write_str("operation was cancelled"),
        }
    }
}

impl core::error::Error for Cancelled {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        self.cause.as_deref().map(|e| e as _)
    }
}

// === impl Disposed ===

impl fmt::Display for Disposed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("the consumer disposed of the channel")
    }
}

impl core::error::Error for Disposed {}

// === impl UsageError ===

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyResolved { first: None } => f.write_str("already resolved"),
            Self::AlreadyResolved { first: Some(trace) } => {
                write!(f, "already resolved (first resolved at {trace})")
            }
            Self::InvalidResult => f.write_str("cannot resolve a promise with another promise"),
            Self::NotInitialized => {
                f.write_str("the channel must be started by calling `next` first")
            }
            Self::InvalidEmit => f.write_str("cannot emit a pending promise into a channel"),
        }
    }
}

impl core::error::Error for UsageError {}

// === impl ResolutionTrace ===

impl ResolutionTrace {
    /// Captures the caller's location when the `resolution-trace` feature is enabled.
    #[track_caller]
    #[inline]
    pub(crate) fn capture() -> Option<Self> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "resolution-trace")] {
                Some(Self(Location::caller()))
            } else {
                None
            }
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.0
    }
}

impl fmt::Display for ResolutionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)
    }
}
