//! Retry an async [`Operation`] with a backoff [`strategy`], stopping early when a
//! [`Condition`] says the error is not retryable or when a cancellation token fires while
//! the operation is cooling off.

use std::future::Future;
use std::time::Duration;

pub mod retry;
pub mod strategy;

/// An operation that can be run more than once. Every call to [`Operation::run`] starts a
/// fresh attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    F: FnMut() -> T,
    T: Future<Output = Result<I, E>>,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt may be retried.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}

/// Called right before the retry future starts cooling off.
/// Arguments are the error of the failed attempt, the 1-based number of the retry about
/// to happen and the delay that precedes it.
pub trait Notify<E> {
    fn notify(&mut self, error: &E, retry: usize, delay: Duration);
}

impl<E, F> Notify<E> for F
where
    F: FnMut(&E, usize, Duration),
{
    fn notify(&mut self, error: &E, retry: usize, delay: Duration) {
        self(error, retry, delay)
    }
}

/// [`Notify`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNotify;

impl<E> Notify<E> for NoNotify {
    fn notify(&mut self, _error: &E, _retry: usize, _delay: Duration) {}
}
