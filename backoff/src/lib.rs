//! Retries an async [Operation] with the delays yielded by an interval strategy, for as long as
//! its [Condition] accepts the error.

use std::future::Future;

/// [Retry](retry::Retry) future.
pub mod retry;

/// Interval strategies.
pub mod strategy;

/// An async operation that can be started again after a failure.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt is worth another one.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}
