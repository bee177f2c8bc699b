#![deny(unsafe_op_in_unsafe_fn)]

use crate::store::{StoreId, StoreInner, StoreOpaque};
use crate::trap::panic_message;
use crate::{Engine, Trap, Val};
use anyhow::{anyhow, bail, Result};
use core::panic::AssertUnwindSafe;
use core::ptr;
use core::time::Duration;
use std::panic;
use wasmtime_fiber::{Fiber, FiberStack, Suspend};

/// Helper struct for reseting a raw pointer to its original value on drop.
struct Reset<T: Copy>(*mut T, T);

impl<T: Copy> Drop for Reset<T> {
    fn drop(&mut self) {
        unsafe {
            *self.0 = self.1;
        }
    }
}

/// Why a fiber handed control back to whoever resumed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendReason {
    /// An asynchronous host function returned a continuation which must be
    /// polled to completion before the guest can continue.
    AwaitingContinuation,
    /// The store ran out of its active fuel slice. The driver should wait at
    /// least `backoff` before resuming the call.
    OutOfFuel {
        /// Advisory delay; zero for periodic yields.
        backoff: Duration,
    },
    /// The engine epoch reached the store's deadline.
    EpochDeadline,
}

impl SuspendReason {
    /// Whether the call can be resumed right away without polling anything
    /// else first.
    pub fn is_out_of_budget(&self) -> bool {
        !matches!(self, SuspendReason::AwaitingContinuation)
    }
}

/// Value a fiber is resumed with: the results of the continuation it was
/// waiting on (empty for budget suspensions), or an error to unwind with.
pub(crate) type FiberResume = Result<Vec<Val>>;
pub(crate) type FiberReturn = Result<Vec<Val>>;
type StoreSuspend = Suspend<FiberResume, SuspendReason, FiberReturn>;

/// Fiber bookkeeping kept inside each store.
pub(crate) struct AsyncState {
    /// The `Suspend` for the current fiber (or null if no such fiber is
    /// running).
    current_suspend: *mut StoreSuspend,

    /// The last fiber stack that was in use by the store.
    last_fiber_stack: Option<FiberStack>,
}

impl Default for AsyncState {
    fn default() -> Self {
        Self {
            current_suspend: ptr::null_mut(),
            last_fiber_stack: None,
        }
    }
}

// The raw pointer is only dereferenced on the fiber which installed it.
unsafe impl Send for AsyncState {}
unsafe impl Sync for AsyncState {}

impl StoreOpaque {
    /// Whether the currently running code is on a fiber of this store.
    pub(crate) fn on_fiber(&self) -> bool {
        !self.async_state.current_suspend.is_null()
    }

    /// Suspends the current fiber with `reason`, returning whatever the
    /// resumer passes back in.
    ///
    /// An `Err` means the call was cancelled; it must be propagated so that
    /// the guest stack unwinds.
    pub(crate) fn suspend(&mut self, reason: SuspendReason) -> Result<Vec<Val>> {
        let current_suspend = self.current_suspend_ptr();
        // SAFETY: the pointer targets this store, which outlives the call.
        // The `Reset` restores the suspend pointer when control comes back,
        // and it is nulled in between so that reentrant misuse is caught.
        unsafe {
            let reset_suspend = Reset(current_suspend, *current_suspend);
            if reset_suspend.1.is_null() {
                bail!("cannot suspend outside of an asynchronous call");
            }
            *current_suspend = ptr::null_mut();
            log::trace!("suspending fiber: {reason:?}");
            (*reset_suspend.1).suspend(reason)
        }
    }

    /// Yields for a budget reason and discards the (empty) resume payload.
    pub(crate) fn async_yield(&mut self, reason: SuspendReason) -> Result<()> {
        debug_assert!(reason.is_out_of_budget());
        self.suspend(reason)?;
        Ok(())
    }

    fn current_suspend_ptr(&mut self) -> *mut *mut StoreSuspend {
        &raw mut self.async_state.current_suspend
    }

    fn allocate_fiber_stack(&mut self) -> Result<FiberStack> {
        if let Some(stack) = self.async_state.last_fiber_stack.take() {
            return Ok(stack);
        }
        self.engine().allocator().allocate_fiber_stack()
    }

    fn deallocate_fiber_stack(&mut self, stack: FiberStack) {
        self.flush_fiber_stack();
        self.async_state.last_fiber_stack = Some(stack);
    }

    /// Releases any fiber stack cached by this store back to the engine.
    pub(crate) fn flush_fiber_stack(&mut self) {
        if let Some(stack) = self.async_state.last_fiber_stack.take() {
            self.engine().allocator().deallocate_fiber_stack(stack);
        }
    }
}

pub(crate) struct StoreFiber<'a> {
    /// The raw `wasmtime_fiber::Fiber`, or `None` once it has finished and
    /// its stack was handed back.
    fiber: Option<Fiber<'a, FiberResume, SuspendReason, FiberReturn>>,
    /// The engine which allocated the stack, for the rare case where the
    /// fiber is dropped without a store at hand.
    engine: Engine,
    /// The current `Suspend` for this fiber (or null if it's not currently
    /// running).
    suspend: *mut *mut StoreSuspend,
    /// The id of the store with which this fiber was created.
    ///
    /// Any attempt to resume a fiber with a different store than the one with
    /// which it was created will panic.
    id: StoreId,
}

impl StoreFiber<'_> {
    pub(crate) fn done(&self) -> bool {
        self.fiber.as_ref().map_or(true, |f| f.done())
    }

    /// Cancels the fiber, unwinding whatever guest code is on its stack.
    pub(crate) fn dispose(&mut self, store: &mut StoreOpaque) {
        if self.done() {
            return;
        }
        log::debug!("disposing of suspended fiber");
        let result = resume_fiber(store, self, Err(anyhow!("future dropped")));
        debug_assert!(matches!(result, Ok(Err(_))));
    }
}

// Panics if the fiber is in progress, which aborts the process when a panic
// is already unwinding. Every owner calls `StoreFiber::dispose` first.
impl Drop for StoreFiber<'_> {
    fn drop(&mut self) {
        let Some(fiber) = self.fiber.take() else {
            return;
        };
        assert!(
            fiber.done(),
            "attempted to drop in-progress fiber without first calling `StoreFiber::dispose`"
        );
        self.engine
            .allocator()
            .deallocate_fiber_stack(fiber.into_stack());
    }
}

// The fiber holds raw pointers into its store. The store is exclusively
// borrowed by the owner of the `StoreFiber` for as long as it lives, and the
// fiber only runs inside `resume_fiber`, so moving it between threads along
// with that borrow is sound.
unsafe impl Send for StoreFiber<'_> {}
unsafe impl Sync for StoreFiber<'_> {}

/// Resume the specified fiber, granting it exclusive access to the store with
/// which it was created.
///
/// This will return `Ok(result)` if the fiber resolved, where `result` is the
/// returned value; it will return `Err(reason)` if the fiber suspended.
pub(crate) fn resume_fiber(
    store: &mut StoreOpaque,
    fiber: &mut StoreFiber<'_>,
    resume: FiberResume,
) -> Result<FiberReturn, SuspendReason> {
    assert_eq!(store.id(), fiber.id, "fiber resumed on a foreign store");
    let result = {
        let inner = fiber
            .fiber
            .as_ref()
            .expect("attempted to resume a completed fiber");
        assert!(!inner.done(), "attempted to resume a completed fiber");
        // SAFETY: `suspend` points into `store`, which we hold exclusively.
        let _reset_suspend = unsafe { Reset(fiber.suspend, *fiber.suspend) };
        inner.resume(resume)
    };

    match &result {
        // The fiber has finished, so recycle its stack.
        Ok(_) => {
            if let Some(f) = fiber.fiber.take() {
                store.deallocate_fiber_stack(f.into_stack());
            }
            log::trace!("fiber finished");
        }
        Err(reason) => log::trace!("fiber suspended: {reason:?}"),
    }

    result
}

/// Create a new `StoreFiber` which runs the specified closure.
///
/// Nothing runs until the first `resume_fiber`. Resuming with an error
/// before that returns the error without calling `fun`.
pub(crate) fn make_fiber<'a, T: 'a>(
    store: &mut StoreInner<T>,
    fun: impl FnOnce(&mut StoreInner<T>) -> FiberReturn + 'a,
) -> Result<StoreFiber<'a>> {
    let engine = store.engine().clone();
    let id = store.id();
    let stack = store.allocate_fiber_stack()?;
    let suspend = store.current_suspend_ptr();
    let store = &raw mut *store;
    let fiber = Fiber::new(stack, move |resume: FiberResume, suspend| {
        // Cancelled before we started? Just return.
        resume?;

        // SAFETY: per the contract of `resume_fiber` we have exclusive
        // access to the store until we return or suspend back.
        let store_ref = unsafe { &mut *store };
        let suspend_ptr = store_ref.current_suspend_ptr();
        // Install our suspension context for the rest of this fiber and put
        // back the previous value when done.
        let _reset = unsafe { Reset(suspend_ptr, *suspend_ptr) };
        unsafe { *suspend_ptr = suspend };

        // Nothing may unwind out of the fiber's entry point, so a panic which
        // escaped `fun` ends the call as a trap instead.
        let depth = store_ref.call_depth();
        match panic::catch_unwind(AssertUnwindSafe(|| fun(&mut *store_ref))) {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(&*payload);
                log::debug!("panic on fiber stack: {msg}");
                store_ref.restore_call_depth(depth);
                Err(anyhow::Error::from(Trap::HostPanic)
                    .context(format!("panic during asynchronous call: {msg}")))
            }
        }
    });
    let fiber = match fiber {
        Ok(fiber) => fiber,
        Err(e) => {
            // The stack was consumed by the failed constructor; keep the
            // live count honest.
            engine.allocator().forget_fiber_stack();
            return Err(e.into());
        }
    };
    log::trace!("created fiber for store {id:?}");
    Ok(StoreFiber {
        fiber: Some(fiber),
        engine,
        suspend,
        id,
    })
}
