//! Epoch-based deadlines.
//!
//! The epoch itself lives in the [`Engine`](crate::Engine) as a single
//! atomic counter which an external timer advances. Each store holds its own
//! deadline; guest code compares a relaxed snapshot of the counter against
//! that deadline at function entry and loop back-edges.

use crate::Caller;
use anyhow::Result;
use core::fmt;
use core::future::Future;
use core::pin::Pin;

/// What to do after returning from a callback when the engine epoch reaches
/// the deadline of a store during execution of a function using that store.
pub enum UpdateDeadline {
    /// Extend the deadline by the specified number of ticks and keep
    /// running.
    Continue(u64),
    /// Extend the deadline by the specified number of ticks after yielding
    /// to the driver of the current asynchronous call.
    Yield(u64),
    /// Extend the deadline by the specified number of ticks once the
    /// provided future resolves.
    ///
    /// The future is driven by the same poll loop as the asynchronous call
    /// itself, in place of the guest code, and is dropped without resuming
    /// the guest if the call is cancelled first.
    YieldCustom(u64, Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl UpdateDeadline {
    pub(crate) fn delta(&self) -> u64 {
        match self {
            UpdateDeadline::Continue(delta)
            | UpdateDeadline::Yield(delta)
            | UpdateDeadline::YieldCustom(delta, _) => *delta,
        }
    }
}

impl fmt::Debug for UpdateDeadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateDeadline::Continue(delta) => f.debug_tuple("Continue").field(delta).finish(),
            UpdateDeadline::Yield(delta) => f.debug_tuple("Yield").field(delta).finish(),
            UpdateDeadline::YieldCustom(delta, _) => f
                .debug_tuple("YieldCustom")
                .field(delta)
                .finish_non_exhaustive(),
        }
    }
}

pub(crate) type EpochCallback<T> =
    Box<dyn FnMut(Caller<'_, T>) -> Result<UpdateDeadline> + Send + Sync>;

/// The configured reaction of a store to its epoch deadline.
pub(crate) enum EpochDeadline<T> {
    /// Terminate the call with `Trap::Interrupt`.
    Trap,
    /// Yield to the driver, then extend the deadline by the given delta.
    YieldAndUpdate(u64),
    /// Ask the embedder.
    Callback(EpochCallback<T>),
}

impl<T> EpochDeadline<T> {
    /// Whether a checkpoint observing `current` has hit `deadline`.
    pub(crate) fn reached(current: u64, deadline: u64) -> bool {
        current >= deadline
    }
}

impl<T> fmt::Debug for EpochDeadline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochDeadline::Trap => write!(f, "Trap"),
            EpochDeadline::YieldAndUpdate(delta) => {
                f.debug_tuple("YieldAndUpdate").field(delta).finish()
            }
            EpochDeadline::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}
