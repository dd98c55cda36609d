// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::channel::Consumer;
use crate::error::Error;
use crate::future::Await;
use core::pin::Pin;
use core::task::{Context, Poll, ready};
use futures::Stream;
use futures::stream::FusedStream;
use pin_project::pin_project;

/// A [`Stream`] over the values of a channel, see [`Consumer::into_stream`].
///
/// Yields `Ok(value)` for every emitted value and ends once the channel completes. A failed
/// channel yields its error once, then ends. Dropping the stream disposes the channel.
#[pin_project]
#[must_use = "streams do nothing unless polled"]
pub struct ConsumerStream<T: Clone + 'static, S: 'static> {
    consumer: Consumer<T, S>,
    #[pin]
    pending: Option<Await<Option<T>>>,
    done: bool,
}

impl<T: Clone + 'static, S: 'static> ConsumerStream<T, S> {
    pub(super) fn new(consumer: Consumer<T, S>) -> Self {
        Self {
            consumer,
            pending: None,
            done: false,
        }
    }
}

impl<T: Clone + 'static, S: 'static> Stream for ConsumerStream<T, S> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut me = self.project();
        if *me.done {
            return Poll::Ready(None);
        }

        if me.pending.is_none() {
            me.pending.set(Some(me.consumer.next().into_future()));
        }
        let outcome = match me.pending.as_mut().as_pin_mut() {
            Some(pending) => ready!(pending.poll(cx)),
            None => return Poll::Ready(None),
        };
        me.pending.set(None);

        match outcome {
            Ok(Some(value)) => Poll::Ready(Some(Ok(value))),
            Ok(None) => {
                *me.done = true;
                Poll::Ready(None)
            }
            Err(err) => {
                *me.done = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<T: Clone + 'static, S: 'static> FusedStream for ConsumerStream<T, S> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}
