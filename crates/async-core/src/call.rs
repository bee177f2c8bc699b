//! The handle through which a driver advances an asynchronous guest call.

use crate::continuation::PendingContinuation;
use crate::fiber::{make_fiber, resume_fiber, FiberResume, StoreFiber, SuspendReason};
use crate::trap::panic_message;
use crate::values::typecheck;
use crate::{interp, Caller, Func, Store, Trap, Val};
use anyhow::{bail, Context as _, Result};
use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::task::noop_waker_ref;
use std::panic;

/// Where a [`CallFuture`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// Created but not yet polled; no guest code has run.
    Created,
    /// Guest code is executing on the call's fiber. Only observable from
    /// inside the call.
    Running,
    /// The fiber is parked for the given reason.
    Suspended(SuspendReason),
    /// The call finished, successfully or not. Further polls are no-ops.
    Completed,
}

/// The outcome of a completed call, as returned by
/// [`CallFuture::get_results`].
#[derive(Debug)]
pub enum CallOutcome<'a> {
    /// The guest returned normally with these values.
    Returned(&'a [Val]),
    /// Guest execution trapped; the error downcasts to [`Trap`].
    Trap(&'a anyhow::Error),
    /// A host error ended the call, for example bad arguments or an error
    /// returned by a host function before it produced a continuation.
    Error(&'a anyhow::Error),
}

impl CallOutcome<'_> {
    /// Returns the trap code if the call trapped.
    pub fn trap(&self) -> Option<Trap> {
        match self {
            CallOutcome::Trap(e) => e.downcast_ref::<Trap>().copied(),
            _ => None,
        }
    }
}

/// An in-progress asynchronous call into guest code.
///
/// Created by [`Func::call_async`]. A driver advances the call by invoking
/// [`CallFuture::poll`] repeatedly until it returns `true`, then reads the
/// outcome with [`CallFuture::get_results`]. Each poll performs one step:
/// starting or resuming the guest until it next suspends, or polling the
/// host continuation the guest is waiting on.
///
/// `CallFuture` also implements [`Future`], so it can simply be `.await`ed
/// on an executor instead. Every suspension of the guest wakes the task
/// immediately; after that, a pending host continuation wakes it whenever
/// the continuation arranges to.
///
/// Dropping a `CallFuture` before it completes cancels the call: any pending
/// host continuation is dropped, the guest stack is unwound, and its native
/// stack is released.
pub struct CallFuture<'a, T> {
    store: &'a mut Store<T>,
    fiber: Option<StoreFiber<'a>>,
    status: CallStatus,
    outcome: Option<Result<Vec<Val>>>,
}

impl<'a, T> CallFuture<'a, T> {
    pub(crate) fn new(store: &'a mut Store<T>, func: Func, params: Vec<Val>) -> CallFuture<'a, T> {
        match make_fiber(store.inner_mut(), move |store| {
            interp::invoke(store, func, params)
        }) {
            Ok(fiber) => CallFuture {
                store,
                fiber: Some(fiber),
                status: CallStatus::Created,
                outcome: None,
            },
            Err(e) => CallFuture::failed(store, e),
        }
    }

    /// A call which is done before it starts.
    pub(crate) fn failed(store: &'a mut Store<T>, error: anyhow::Error) -> CallFuture<'a, T> {
        log::debug!("asynchronous call failed to start: {error:#}");
        CallFuture {
            store,
            fiber: None,
            status: CallStatus::Completed,
            outcome: Some(Err(error)),
        }
    }

    /// Performs one step of the call, returning whether it is done.
    ///
    /// Once this returns `true` it keeps returning `true` without doing
    /// anything. When it returns `false` because the guest ran out of fuel,
    /// the driver should wait for the backoff reported by
    /// [`CallFuture::status`] before polling again.
    pub fn poll(&mut self) -> bool {
        let mut cx = Context::from_waker(noop_waker_ref());
        self.step(&mut cx)
    }

    /// Returns the current state of the call.
    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Whether the call has completed.
    pub fn is_done(&self) -> bool {
        self.status == CallStatus::Completed
    }

    /// Returns the outcome of the call.
    ///
    /// # Errors
    ///
    /// Returns an error if the call has not completed yet, or if its outcome
    /// was already taken by awaiting it.
    pub fn get_results(&self) -> Result<CallOutcome<'_>> {
        match &self.outcome {
            None if !self.is_done() => bail!("call has not completed yet"),
            None => bail!("the outcome of this call was already taken"),
            Some(Ok(vals)) => Ok(CallOutcome::Returned(vals)),
            Some(Err(e)) if e.is::<Trap>() => Ok(CallOutcome::Trap(e)),
            Some(Err(e)) => Ok(CallOutcome::Error(e)),
        }
    }

    /// Consumes a completed call and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the guest trap or host error which ended the call, or an error
    /// if the call has not completed yet.
    pub fn into_results(mut self) -> Result<Vec<Val>> {
        if !self.is_done() {
            bail!("call has not completed yet");
        }
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => bail!("the outcome of this call was already taken"),
        }
    }

    /// Same as [`Store::get_fuel`], usable while the call holds the store.
    pub fn get_fuel(&self) -> Result<u64> {
        self.store.get_fuel()
    }

    /// Same as [`Store::set_fuel`], usable while the call holds the store.
    pub fn set_fuel(&mut self, fuel: u64) -> Result<()> {
        self.store.set_fuel(fuel)
    }

    /// Returns the data of the store this call runs in.
    pub fn data(&self) -> &T {
        self.store.data()
    }

    fn step(&mut self, cx: &mut Context<'_>) -> bool {
        let resume: FiberResume = match self.status {
            CallStatus::Completed => return true,
            CallStatus::Running => panic!("`CallFuture` polled while running or after a panic"),
            CallStatus::Created
            | CallStatus::Suspended(SuspendReason::OutOfFuel { .. } | SuspendReason::EpochDeadline) => {
                Ok(Vec::new())
            }
            CallStatus::Suspended(SuspendReason::AwaitingContinuation) => {
                match self.poll_continuation(cx) {
                    Poll::Ready(result) => result,
                    Poll::Pending => return false,
                }
            }
        };
        self.resume(resume, cx)
    }

    /// Polls the continuation the guest is suspended on. On completion the
    /// continuation is dropped and its checked results returned.
    fn poll_continuation(&mut self, cx: &mut Context<'_>) -> Poll<FiberResume> {
        let store = self.store.inner_mut();
        let Some(mut pending) = store.pending.take() else {
            return Poll::Ready(Err(anyhow::anyhow!(
                "call suspended without a pending continuation"
            )));
        };
        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            pending.continuation.poll(Caller::new(store), cx)
        }));
        match polled {
            Ok(Poll::Pending) => {
                store.pending = Some(pending);
                Poll::Pending
            }
            Ok(Poll::Ready(result)) => {
                let PendingContinuation {
                    name,
                    continuation,
                    results,
                } = pending;
                drop(continuation);
                log::trace!("continuation of `{name}` completed");
                Poll::Ready(match result {
                    Ok(vals) => typecheck("results", &results, &vals)
                        .with_context(|| {
                            format!("continuation of host function `{name}` returned bad results")
                        })
                        .map(|()| vals),
                    Err(e) => {
                        log::debug!("continuation of `{name}` failed: {e:#}");
                        Err(anyhow::Error::from(Trap::HostError)
                            .context(format!("continuation of host function `{name}` failed: {e:#}")))
                    }
                })
            }
            Err(payload) => {
                let msg = panic_message(&*payload);
                let name = pending.name.clone();
                drop(pending);
                log::debug!("continuation of `{name}` panicked: {msg}");
                Poll::Ready(Err(anyhow::Error::from(Trap::HostPanic).context(format!(
                    "continuation of host function `{name}` panicked: {msg}"
                ))))
            }
        }
    }

    fn resume(&mut self, resume: FiberResume, cx: &mut Context<'_>) -> bool {
        let Some(fiber) = self.fiber.as_mut() else {
            self.complete(Err(anyhow::anyhow!("call has no fiber to resume")));
            return true;
        };
        self.status = CallStatus::Running;
        match resume_fiber(self.store.inner_mut(), fiber, resume) {
            Ok(outcome) => {
                self.fiber = None;
                self.complete(outcome);
                true
            }
            Err(reason) => {
                self.status = CallStatus::Suspended(reason);
                // The next step has work to do right away: resuming after a
                // budget suspension, or the first poll of a continuation.
                cx.waker().wake_by_ref();
                false
            }
        }
    }

    fn complete(&mut self, outcome: Result<Vec<Val>>) {
        match &outcome {
            Ok(vals) => log::debug!("asynchronous call returned {vals:?}"),
            Err(e) => log::debug!("asynchronous call failed: {e:#}"),
        }
        self.status = CallStatus::Completed;
        self.outcome = Some(outcome);
    }
}

impl<T> Future for CallFuture<'_, T> {
    type Output = Result<Vec<Val>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.step(cx) {
            return Poll::Pending;
        }
        match this.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => panic!("`CallFuture` polled after completion"),
        }
    }
}

impl<T> Drop for CallFuture<'_, T> {
    fn drop(&mut self) {
        let store = self.store.inner_mut();
        // Cleanup of a pending continuation happens before the guest stack
        // is unwound.
        if let Some(pending) = store.pending.take() {
            log::debug!("dropping continuation of `{}` for cancelled call", pending.name);
            drop(pending);
        }
        if let Some(fiber) = &mut self.fiber {
            fiber.dispose(store);
        }
    }
}
