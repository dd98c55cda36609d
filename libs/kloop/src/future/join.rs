// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::future::{Deferred, Promise};
use core::cell::RefCell;
use std::rc::Rc;

/// A collection of promises that can be awaited as one.
///
/// Implemented for `Vec<Promise<T>>` and for tuples of up to four promises. The joined promise
/// resolves once every member resolved, or fails with the first member failure. Results of the
/// remaining members are discarded in that case.
pub trait Join {
    type Output;

    fn join_all(self) -> Promise<Self::Output>;
}

/// Joins a collection of promises, see [`Join`].
pub fn join_all<J: Join>(promises: J) -> Promise<J::Output> {
    promises.join_all()
}

/// Bookkeeping shared by the member subscriptions of one join.
struct Joined<S, O: 'static> {
    slots: RefCell<S>,
    remaining: RefCell<usize>,
    deferred: Deferred<O>,
}

impl<S, O: 'static> Joined<S, O> {
    fn new(slots: S, remaining: usize) -> Rc<Self> {
        Rc::new(Self {
            slots: RefCell::new(slots),
            remaining: RefCell::new(remaining),
            deferred: Deferred::new(),
        })
    }

    /// Records a member outcome, returns `true` once every member succeeded.
    fn member_done<T: Clone>(
        &self,
        outcome: &Result<T, Error>,
        store: impl FnOnce(&mut S, T),
    ) -> bool {
        if self.deferred.is_resolved() {
            return false;
        }

        match outcome {
            Ok(value) => {
                store(&mut self.slots.borrow_mut(), value.clone());
                let mut remaining = self.remaining.borrow_mut();
                *remaining -= 1;
                *remaining == 0
            }
            Err(err) => {
                tracing::trace!(%err, "join member failed");
                let _ = self.deferred.fail(err.clone());
                false
            }
        }
    }
}

impl<T: Clone + 'static> Join for Vec<Promise<T>> {
    type Output = Vec<T>;

    fn join_all(self) -> Promise<Vec<T>> {
        if self.is_empty() {
            return Promise::completed(Vec::new());
        }

        let slots: Vec<Option<T>> = (0..self.len()).map(|_| None).collect();
        let joined = Joined::new(slots, self.len());
        let out = joined.deferred.promise();

        for (index, member) in self.into_iter().enumerate() {
            let joined = joined.clone();
            member.subscribe(move |outcome| {
                if joined.member_done(outcome, |slots, value| slots[index] = Some(value)) {
                    let values = joined.slots.take().into_iter().flatten().collect();
                    let _ = joined.deferred.resolve(values);
                }
            });
        }

        out
    }
}

macro_rules! impl_join_tuple {
    ($($name:ident: $idx:tt),+) => {
        impl<$($name: Clone + 'static),+> Join for ($(Promise<$name>,)+) {
            type Output = ($($name,)+);

            fn join_all(self) -> Promise<Self::Output> {
                fn take_all<$($name),+>(slots: ($(Option<$name>,)+)) -> Option<($($name,)+)> {
                    Some(($(slots.$idx?,)+))
                }

                let count = [$(stringify!($name)),+].len();
                let joined = Joined::new(($(None::<$name>,)+), count);
                let out = joined.deferred.promise();

                $(
                    let joined_ = joined.clone();
                    self.$idx.subscribe(move |outcome| {
                        if joined_.member_done(outcome, |slots, value| slots.$idx = Some(value)) {
                            if let Some(values) = take_all(joined_.slots.take()) {
                                let _ = joined_.deferred.resolve(values);
                            }
                        }
                    });
                )+

                out
            }
        }
    };
}

impl_join_tuple!(A: 0, B: 1);
impl_join_tuple!(A: 0, B: 1, C: 2);
impl_join_tuple!(A: 0, B: 1, C: 2, D: 3);
