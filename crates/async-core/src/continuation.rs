//! Host continuations: the pollable work an asynchronous host function hands
//! back instead of its results.
//!
//! When guest code calls an asynchronous host function, the function runs
//! once on the guest's fiber and returns a [`HostContinuation`]. The fiber
//! then suspends, and every subsequent poll of the owning
//! [`CallFuture`](crate::CallFuture) polls the continuation instead of the
//! guest. Once the continuation reports its results they are checked against
//! the function's signature, the continuation is dropped, and the guest
//! resumes with those results.
//!
//! Any state the continuation needs is owned by the value itself, and its
//! `Drop` implementation is the cleanup hook. It runs exactly once, either
//! after completion or when the call is cancelled while waiting.

use crate::{Caller, Val, ValType};
use anyhow::{anyhow, Result};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Pollable host work which produces the results of an asynchronous host
/// function.
pub trait HostContinuation<T>: Send {
    /// Advances the work.
    ///
    /// Returns `Poll::Ready` with the function's results (or an error, which
    /// terminates the call) once finished. Returning `Poll::Pending` makes
    /// the owning call report "not done" to its driver; the continuation is
    /// polled again on the next poll of the call.
    ///
    /// A continuation is never polled again after returning `Poll::Ready`.
    fn poll(&mut self, caller: Caller<'_, T>, cx: &mut Context<'_>) -> Poll<Result<Vec<Val>>>;
}

/// Creates a continuation from a polling closure.
///
/// Whatever the closure captures is dropped together with the continuation.
pub fn poll_fn<T, F>(f: F) -> Box<dyn HostContinuation<T>>
where
    F: FnMut(Caller<'_, T>, &mut Context<'_>) -> Poll<Result<Vec<Val>>> + Send + 'static,
{
    struct PollFn<F>(F);

    impl<T, F> HostContinuation<T> for PollFn<F>
    where
        F: FnMut(Caller<'_, T>, &mut Context<'_>) -> Poll<Result<Vec<Val>>> + Send,
    {
        fn poll(
            &mut self,
            caller: Caller<'_, T>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<Vec<Val>>> {
            (self.0)(caller, cx)
        }
    }

    Box::new(PollFn(f))
}

/// Creates a continuation which drives a future to completion.
///
/// The future does not get access to the store; capture what it needs
/// up front.
pub fn from_future<T, F>(future: F) -> Box<dyn HostContinuation<T>>
where
    F: Future<Output = Result<Vec<Val>>> + Send + 'static,
{
    struct FromFuture(Pin<Box<dyn Future<Output = Result<Vec<Val>>> + Send>>);

    impl<T> HostContinuation<T> for FromFuture {
        fn poll(
            &mut self,
            _caller: Caller<'_, T>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<Vec<Val>>> {
            self.0.as_mut().poll(cx)
        }
    }

    Box::new(FromFuture(Box::pin(future)))
}

/// Creates a continuation which is done the first time it is polled.
pub fn ready<T>(result: Result<Vec<Val>>) -> Box<dyn HostContinuation<T>> {
    struct Ready(Option<Result<Vec<Val>>>);

    impl<T> HostContinuation<T> for Ready {
        fn poll(&mut self, _caller: Caller<'_, T>, _cx: &mut Context<'_>) -> Poll<Result<Vec<Val>>> {
            Poll::Ready(
                self.0
                    .take()
                    .unwrap_or_else(|| Err(anyhow!("continuation polled after completion"))),
            )
        }
    }

    Box::new(Ready(Some(result)))
}

/// A continuation registered with a store while its fiber is suspended.
pub(crate) struct PendingContinuation<T> {
    pub(crate) name: String,
    pub(crate) continuation: Box<dyn HostContinuation<T>>,
    pub(crate) results: Box<[ValType]>,
}

impl<T> PendingContinuation<T> {
    pub(crate) fn new(
        name: impl Into<String>,
        continuation: Box<dyn HostContinuation<T>>,
        results: Box<[ValType]>,
    ) -> PendingContinuation<T> {
        PendingContinuation {
            name: name.into(),
            continuation,
            results,
        }
    }
}
