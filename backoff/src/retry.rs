use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{Condition, NoNotify, Notify, Operation};

/// Why a [`Retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The last attempt failed and either the error was not retryable or the backoff ran out.
    Exhausted { attempts: usize, error: E },
    /// The cancellation token fired while cooling off before the next attempt. `error` is the
    /// error of the last attempt that actually ran.
    Cancelled { attempts: usize, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts that were run, including the first one.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Cancelled { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Cancelled { error, .. } => error,
        }
    }
}

/// The retry future flips between running the [`Operation`] and sleeping for the delay
/// handed out by the backoff iterator:
/// ```no_rust
///  (op) --(Ok)--> [Return(Ok)]
///    \
///     (Err) --(not retryable / backoff empty)--> [Return(Exhausted)]
///         \
///          (Sleep) --(cancelled)--> [Return(Cancelled)]
///              \
///               (Ready) --> (op)
/// ```
/// Cancellation is only observed while sleeping, an attempt that already started is always
/// allowed to finish.
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retry retries an operation based on the backoff strategy.
#[pin_project]
pub struct Retry<I, O, C, N = NoNotify>
where
    O: Operation,
{
    #[pin]
    retry_state: RetryState<O>,
    #[pin]
    cancelled: WaitForCancellationFutureOwned,
    backoff: I,
    operation: O,
    condition: C,
    notify: N,
    attempts: usize,
    last_error: Option<O::Error>,
}

impl<I, O, C> Retry<I, O, C, NoNotify>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            retry_state: RetryState::Running(operation.run()),
            cancelled: cancel.cancelled_owned(),
            backoff: backoff.into_iter(),
            operation,
            condition,
            notify: NoNotify,
            attempts: 1,
            last_error: None,
        }
    }
}

impl<I, O, C, N> Retry<I, O, C, N>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
    N: Notify<O::Error>,
{
    /// Registers a hook invoked before every cool-off.
    pub fn with_notify<M: Notify<O::Error>>(self, notify: M) -> Retry<I, O, C, M> {
        Retry {
            retry_state: self.retry_state,
            cancelled: self.cancelled,
            backoff: self.backoff,
            operation: self.operation,
            condition: self.condition,
            notify,
            attempts: self.attempts,
            last_error: self.last_error,
        }
    }
}

impl<I, O, C, N> Future for Retry<I, O, C, N>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
    N: Notify<O::Error>,
{
    type Output = Result<O::Item, RetryError<O::Error>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            match this.retry_state.project() {
                RetryStateProj::Running(op) => {
                    let error = match ready!(op.poll(cx)) {
                        Ok(item) => return Poll::Ready(Ok(item)),
                        Err(error) => error,
                    };

                    let mut this = self.as_mut().project();
                    let attempts = *this.attempts;
                    if !this.condition.can_retry(&error) {
                        return Poll::Ready(Err(RetryError::Exhausted { attempts, error }));
                    }
                    let Some(delay) = this.backoff.next() else {
                        return Poll::Ready(Err(RetryError::Exhausted { attempts, error }));
                    };

                    // the retry about to happen is the `attempts`-th one
                    this.notify.notify(&error, attempts, delay);
                    *this.last_error = Some(error);
                    this.retry_state
                        .set(RetryState::Sleeping(sleep_until(Instant::now() + delay)));
                }
                RetryStateProj::Sleeping(sleep) => {
                    if this.cancelled.poll(cx).is_ready() {
                        let attempts = *this.attempts;
                        if let Some(error) = this.last_error.take() {
                            return Poll::Ready(Err(RetryError::Cancelled { attempts, error }));
                        }
                    }
                    ready!(sleep.poll(cx));

                    let mut this = self.as_mut().project();
                    *this.attempts += 1;
                    let future = this.operation.run();
                    this.retry_state.set(RetryState::Running(future));
                }
            }
        }
    }
}
