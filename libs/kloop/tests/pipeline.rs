// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::RefCell;
use core::time::Duration;
use futures::StreamExt;
use kloop::cancel::{CancellationToken, CancellationTokenSource};
use kloop::channel::generate;
use kloop::future::{Completions, join_all};
use kloop::time::{self, Clock};
use kloop::{Error, EventLoop, Promise, spawn};
use std::rc::Rc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

fn manual_loop() -> EventLoop {
    EventLoop::builder().clock(Clock::manual()).build()
}

#[test]
fn generator_feeds_completions_in_resolution_order() {
    let _trace = trace_init();
    let ev = manual_loop();
    let _guard = ev.enter();

    let jobs = generate::<(u64, Promise<u64>), (), _, _>(|producer| async move {
        for ms in [40, 10, 30, 20] {
            let job = time::delay(Duration::from_millis(ms)).map(move |()| ms);
            producer.emit((ms, job))?.await?;
        }
        Ok(())
    });
    let completions = Completions::from_pipeline(jobs);

    let order = spawn(async move {
        let mut order = Vec::new();
        while let Some((key, job)) = completions.next().await? {
            assert_eq!(job.await?, key);
            order.push(key);
        }
        Ok(order)
    });

    assert_eq!(ev.block_on(order).unwrap(), [10, 20, 30, 40]);
    assert_eq!(ev.clock().now(), Duration::from_millis(40));
}

#[test]
fn cancelling_a_consumer_stops_the_generator() {
    let _trace = trace_init();
    let ev = manual_loop();
    let _guard = ev.enter();

    let source = CancellationTokenSource::new();
    let token = source.token();
    let produced = Rc::new(RefCell::new(Vec::new()));

    let ticks = generate::<u32, (), _, _>({
        let produced = produced.clone();
        move |producer| async move {
            let mut i = 0;
            loop {
                time::delay(Duration::from_millis(10)).await?;
                produced.borrow_mut().push(i);
                producer.emit(i)?.await?;
                i += 1;
            }
        }
    });

    let consumer = spawn(async move {
        let mut seen = 0;
        loop {
            token.throw_if_requested()?;
            match token.race(ticks.next()).await? {
                Some(_) => seen += 1,
                None => return Ok(seen),
            }
        }
    });

    ev.handle().delay(Duration::from_millis(35), move |_| {
        source.cancel(Some(Error::msg("enough ticks")));
    });

    let err = ev.block_on(consumer).unwrap_err();
    let Error::Cancelled(cancelled) = &err else {
        panic!("expected a cancellation, got {err:?}");
    };
    assert_eq!(cancelled.cause().unwrap().to_string(), "enough ticks");
    assert_eq!(ev.clock().now(), Duration::from_millis(35));

    // the generator finishes the tick it was waiting for, then its emit observes the disposal
    ev.run();
    assert_eq!(*produced.borrow(), [0, 1, 2, 3]);
    assert_eq!(ev.watcher_count(), 0);
}

#[test]
fn timeout_token_bounds_a_slow_join() {
    let _trace = trace_init();
    let ev = manual_loop();
    let _guard = ev.enter();

    let token = CancellationToken::any([
        CancellationToken::none(),
        CancellationToken::timeout(Duration::from_millis(25)),
    ]);

    let all = join_all(vec![
        time::delay(Duration::from_millis(10)).map(|()| 1),
        time::delay(Duration::from_millis(50)).map(|()| 2),
    ]);

    let err = ev.block_on(token.race(all)).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(ev.clock().now(), Duration::from_millis(25));
}

#[test]
fn timeout_passes_fast_values_through() {
    let _trace = trace_init();
    let ev = manual_loop();
    let _guard = ev.enter();

    let fast = time::delay(Duration::from_millis(5)).map(|()| "fast");
    let value = ev
        .block_on(time::timeout(Duration::from_millis(10), fast))
        .unwrap();
    assert_eq!(value, "fast");

    ev.run();
    assert_eq!(ev.watcher_count(), 0);
}

#[test]
fn channel_as_stream() {
    let _trace = trace_init();
    let ev = manual_loop();
    let _guard = ev.enter();

    let letters = generate::<char, (), _, _>(|producer| async move {
        for c in ['k', 'l', 'o', 'o', 'p'] {
            producer.emit(c)?.await?;
        }
        Ok(())
    });

    let word = spawn(async move {
        let mut stream = letters.into_stream();
        let mut word = String::new();
        while let Some(c) = stream.next().await {
            word.push(c?);
        }
        Ok(word)
    });

    assert_eq!(ev.block_on(word).unwrap(), "kloop");
}
