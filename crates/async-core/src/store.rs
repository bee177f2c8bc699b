//! The `Store` type and the per-store state behind it.
//!
//! A [`Store`] owns the embedder's data `T`, the fuel meter, the epoch
//! deadline and every instance created within it. Guest code only ever runs
//! with exclusive access to its store: synchronously through
//! [`Func::call`](crate::Func::call), or on a fiber owned by a
//! [`CallFuture`](crate::CallFuture) which keeps the store mutably borrowed
//! until it is dropped.
//!
//! Internally the store is split in two. `StoreOpaque` holds everything
//! which does not depend on `T` and is what the fiber machinery works with;
//! `StoreInner<T>` wraps it together with the data, the epoch callback and
//! the pending host continuation, and derefs to it.

use crate::continuation::{self, PendingContinuation};
use crate::epoch::{EpochDeadline, UpdateDeadline};
use crate::fiber::{AsyncState, SuspendReason};
use crate::fuel::{FuelMeter, OutOfFuel};
use crate::func::catch_host_panic;
use crate::instance::InstanceData;
use crate::{Caller, Engine, Trap, Val};
use anyhow::{bail, ensure, Result};
use core::fmt;
use core::num::NonZeroU64;
use core::ops::{Deref, DerefMut};
use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};

/// A collection of guest instances and host-defined state.
///
/// All guest execution happens within the context of a store, and every
/// [`Instance`](crate::Instance) and [`Func`](crate::Func) is tied to the
/// store it was created in. The `T` type parameter is arbitrary embedder
/// data, reachable from host functions through
/// [`Caller::data`](crate::Caller::data).
///
/// Stores are not garbage collected: everything created within a store lives
/// until the store itself is dropped.
pub struct Store<T> {
    // Boxed so that the raw pointers captured by fibers stay valid if the
    // `Store` itself is moved between calls.
    inner: Box<StoreInner<T>>,
}

pub(crate) struct StoreInner<T> {
    inner: StoreOpaque,
    data: T,
    epoch_deadline_behavior: EpochDeadline<T>,
    /// The continuation the current fiber is suspended on, if any.
    pub(crate) pending: Option<PendingContinuation<T>>,
    pub(crate) instances: Vec<InstanceData<T>>,
}

pub(crate) struct StoreOpaque {
    engine: Engine,
    id: StoreId,
    fuel: FuelMeter,
    epoch_deadline: u64,
    call_depth: usize,
    pub(crate) async_state: AsyncState,
}

/// Unique identifier of a store, used to reject objects which are used with
/// the wrong store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StoreId(NonZeroU64);

impl StoreId {
    fn allocate() -> StoreId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        // Wrapping around would take centuries of allocating stores.
        StoreId(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }
}

impl<T> Store<T> {
    /// Creates a new [`Store`] to be associated with the given [`Engine`] and
    /// `data` provided.
    ///
    /// A new store starts with zero fuel, an epoch deadline of zero, and
    /// traps when either runs out.
    pub fn new(engine: &Engine, data: T) -> Store<T> {
        let id = StoreId::allocate();
        log::trace!("creating store {id:?}");
        Store {
            inner: Box::new(StoreInner {
                inner: StoreOpaque {
                    engine: engine.clone(),
                    id,
                    fuel: FuelMeter::new(),
                    epoch_deadline: 0,
                    call_depth: 0,
                    async_state: AsyncState::default(),
                },
                data,
                epoch_deadline_behavior: EpochDeadline::Trap,
                pending: None,
                instances: Vec::new(),
            }),
        }
    }

    /// Access the underlying data owned by this `Store`.
    pub fn data(&self) -> &T {
        &self.inner.data
    }

    /// Access the underlying data owned by this `Store`.
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.inner.data
    }

    /// Consumes this [`Store`], destroying it, and returns the underlying
    /// data.
    pub fn into_data(self) -> T {
        self.inner.data
    }

    /// Returns the underlying [`Engine`] this store is connected to.
    pub fn engine(&self) -> &Engine {
        self.inner.engine()
    }

    /// Returns the amount fuel in this [`Store`]. When fuel is enabled, it
    /// must be configured via [`Store::set_fuel`].
    ///
    /// # Errors
    ///
    /// This function will return an error if fuel consumption is not enabled
    /// via [`Config::consume_fuel`](crate::Config::consume_fuel).
    pub fn get_fuel(&self) -> Result<u64> {
        self.inner.get_fuel()
    }

    /// Set the fuel to this [`Store`] for guest code to consume while
    /// executing.
    ///
    /// By default a [`Store`] starts with 0 fuel (meaning guest code will
    /// immediately trap or yield). Most instructions consume 1 unit of fuel;
    /// `nop`, `drop`, `block`, and `loop` consume 0.
    ///
    /// # Errors
    ///
    /// This function will return an error if fuel consumption is not enabled
    /// via [`Config::consume_fuel`](crate::Config::consume_fuel).
    pub fn set_fuel(&mut self, fuel: u64) -> Result<()> {
        self.inner.set_fuel(fuel)
    }

    /// Returns the total amount of fuel consumed by guest code in this store
    /// so far, including fuel injected by async yields.
    ///
    /// # Errors
    ///
    /// This function will return an error if fuel consumption is not enabled
    /// via [`Config::consume_fuel`](crate::Config::consume_fuel).
    pub fn fuel_consumed(&self) -> Result<u64> {
        self.inner.fuel_consumed()
    }

    /// Configures a [`Store`] to yield execution of async guest code
    /// periodically.
    ///
    /// Guest code is suspended and control is handed back to the driver of
    /// the [`CallFuture`](crate::CallFuture) every `interval` units of fuel
    /// consumed. The total amount of fuel is unchanged: once it is all
    /// consumed the out-of-fuel policy applies as usual.
    ///
    /// # Errors
    ///
    /// This method will error if fuel is not enabled, if the store's engine
    /// lacks async support, or if `interval` is `Some(0)`.
    pub fn fuel_async_yield_interval(&mut self, interval: Option<u64>) -> Result<()> {
        self.inner.fuel_async_yield_interval(interval)
    }

    /// Configures this store to trap with [`Trap::OutOfFuel`] when guest
    /// code runs out of fuel. This is the default.
    pub fn out_of_fuel_trap(&mut self) -> Result<()> {
        self.inner.set_out_of_fuel(OutOfFuel::Trap)
    }

    /// Configures this store to suspend the current asynchronous call when
    /// guest code runs out of fuel.
    ///
    /// Each time the store runs dry the call is suspended with
    /// [`SuspendReason::OutOfFuel`], `quantum` units of fuel are injected,
    /// and the driver is expected to wait at least `backoff` before polling
    /// the call again. A call with a finite amount of work therefore always
    /// completes, in roughly `fuel / quantum` suspensions.
    ///
    /// # Errors
    ///
    /// This method will error if fuel is not enabled, if the store's engine
    /// lacks async support, or if `quantum` is zero.
    pub fn out_of_fuel_async_yield(&mut self, quantum: u64, backoff: Duration) -> Result<()> {
        let Some(quantum) = NonZeroU64::new(quantum) else {
            bail!("fuel quantum must be nonzero");
        };
        self.inner
            .set_out_of_fuel(OutOfFuel::Yield { quantum, backoff })
    }

    /// Returns the configured reaction to running out of fuel.
    pub fn out_of_fuel_policy(&self) -> OutOfFuel {
        self.inner.fuel.policy
    }

    /// Sets the epoch deadline to a certain number of ticks in the future.
    ///
    /// The deadline is always relative to the current epoch: after this
    /// method is invoked, the deadline is reached when
    /// [`Engine::increment_epoch()`] has been invoked at least
    /// `ticks_beyond_current` times.
    ///
    /// By default a store will trap immediately with an epoch deadline of 0
    /// (which has always "elapsed").
    pub fn set_epoch_deadline(&mut self, ticks_beyond_current: u64) {
        self.inner.set_epoch_deadline(ticks_beyond_current);
    }

    /// Configures epoch-deadline expiration to trap with
    /// [`Trap::Interrupt`]. This is the default.
    pub fn epoch_deadline_trap(&mut self) {
        self.inner.epoch_deadline_behavior = EpochDeadline::Trap;
    }

    /// Configures epoch-deadline expiration to yield to the driver of the
    /// current asynchronous call, then extend the deadline by `delta` ticks.
    ///
    /// # Errors
    ///
    /// This method will error if the store's engine lacks async support.
    pub fn epoch_deadline_async_yield_and_update(&mut self, delta: u64) -> Result<()> {
        ensure!(
            self.engine().config().async_support,
            "cannot use `epoch_deadline_async_yield_and_update` without enabling async support in the config"
        );
        self.inner.epoch_deadline_behavior = EpochDeadline::YieldAndUpdate(delta);
        Ok(())
    }

    /// Configures epoch-deadline expiration to invoke a custom callback
    /// function.
    ///
    /// The callback either returns an [`UpdateDeadline`] saying how far to
    /// move the deadline and whether to yield first, or an error which
    /// terminates the call.
    pub fn epoch_deadline_callback(
        &mut self,
        callback: impl FnMut(Caller<'_, T>) -> Result<UpdateDeadline> + Send + Sync + 'static,
    ) {
        self.inner.epoch_deadline_behavior = EpochDeadline::Callback(Box::new(callback));
    }

    pub(crate) fn inner(&self) -> &StoreInner<T> {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut StoreInner<T> {
        &mut self.inner
    }
}

impl<T: Default> Default for Store<T> {
    fn default() -> Store<T> {
        Store::new(&Engine::default(), T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id())
            .field("data", &self.inner.data)
            .finish_non_exhaustive()
    }
}

impl<T> StoreInner<T> {
    pub(crate) fn data(&self) -> &T {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Suspends the current fiber until `pending` completes, returning its
    /// results.
    pub(crate) fn suspend_on(&mut self, pending: PendingContinuation<T>) -> Result<Vec<Val>> {
        ensure!(
            self.on_fiber(),
            "cannot suspend on a host continuation outside of an asynchronous call"
        );
        debug_assert!(self.pending.is_none());
        self.pending = Some(pending);
        self.inner.suspend(SuspendReason::AwaitingContinuation)
    }

    /// Fuel checkpoint, run at function entry, loop back-edges and calls.
    pub(crate) fn fuel_check(&mut self) -> Result<()> {
        if self.engine.config().consume_fuel && self.fuel.exhausted() {
            self.out_of_gas()?;
        }
        Ok(())
    }

    /// Epoch checkpoint, run at function entry and loop back-edges.
    pub(crate) fn epoch_check(&mut self) -> Result<()> {
        if self.engine.config().epoch_interruption
            && EpochDeadline::<T>::reached(self.engine.current_epoch(), self.epoch_deadline)
        {
            self.new_epoch()?;
        }
        Ok(())
    }

    fn out_of_gas(&mut self) -> Result<()> {
        // Slices of the configured fuel come first.
        if self.fuel.refuel() {
            if self.fuel.yield_interval().is_some() {
                log::trace!("fuel slice consumed, yielding");
                self.async_yield(SuspendReason::OutOfFuel {
                    backoff: Duration::ZERO,
                })?;
            }
            return Ok(());
        }
        match self.fuel.policy {
            OutOfFuel::Trap => Err(Trap::OutOfFuel.into()),
            OutOfFuel::Yield { quantum, backoff } => {
                // Refill before suspending so the driver sees the new budget.
                self.fuel.inject(quantum.get());
                log::debug!("out of fuel, injected {quantum} and yielding for {backoff:?}");
                self.async_yield(SuspendReason::OutOfFuel { backoff })
            }
        }
    }

    fn new_epoch(&mut self) -> Result<()> {
        // Temporarily take the configured behavior to avoid mutably
        // borrowing multiple times.
        let mut behavior =
            core::mem::replace(&mut self.epoch_deadline_behavior, EpochDeadline::Trap);
        let result = self.apply_epoch_behavior(&mut behavior);
        self.epoch_deadline_behavior = behavior;
        result
    }

    fn apply_epoch_behavior(&mut self, behavior: &mut EpochDeadline<T>) -> Result<()> {
        let delta = match behavior {
            EpochDeadline::Trap => return Err(Trap::Interrupt.into()),
            EpochDeadline::YieldAndUpdate(delta) => {
                log::debug!("epoch deadline reached, yielding");
                self.async_yield(SuspendReason::EpochDeadline)?;
                *delta
            }
            EpochDeadline::Callback(callback) => {
                let update =
                    catch_host_panic("epoch deadline callback", || callback(Caller::new(self)))?;
                log::debug!("epoch deadline reached, callback returned {update:?}");
                let delta = update.delta();
                match update {
                    UpdateDeadline::Continue(_) => {}
                    UpdateDeadline::Yield(_) => {
                        ensure!(
                            self.engine.config().async_support,
                            "cannot use `UpdateDeadline::Yield` without enabling async support in the config"
                        );
                        self.async_yield(SuspendReason::EpochDeadline)?;
                    }
                    UpdateDeadline::YieldCustom(_, future) => {
                        ensure!(
                            self.engine.config().async_support,
                            "cannot use `UpdateDeadline::YieldCustom` without enabling async support in the config"
                        );
                        let continuation = continuation::from_future(async move {
                            future.await;
                            Ok(Vec::new())
                        });
                        self.suspend_on(PendingContinuation::new(
                            "epoch deadline callback",
                            continuation,
                            Box::new([]),
                        ))?;
                    }
                }
                delta
            }
        };
        self.set_epoch_deadline(delta);
        Ok(())
    }
}

impl<T> Deref for StoreInner<T> {
    type Target = StoreOpaque;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for StoreInner<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl StoreOpaque {
    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn id(&self) -> StoreId {
        self.id
    }

    fn ensure_fuel(&self) -> Result<()> {
        ensure!(
            self.engine.config().consume_fuel,
            "fuel is not configured in this store"
        );
        Ok(())
    }

    pub(crate) fn get_fuel(&self) -> Result<u64> {
        self.ensure_fuel()?;
        Ok(self.fuel.get())
    }

    pub(crate) fn set_fuel(&mut self, fuel: u64) -> Result<()> {
        self.ensure_fuel()?;
        self.fuel.set(fuel);
        Ok(())
    }

    pub(crate) fn fuel_consumed(&self) -> Result<u64> {
        self.ensure_fuel()?;
        Ok(self.fuel.consumed())
    }

    /// Charges guest execution against the fuel meter, if fuel is enabled.
    ///
    /// Exhaustion is only acted on at the next checkpoint.
    pub(crate) fn consume_fuel(&mut self, amount: u64) {
        if self.engine.config().consume_fuel {
            self.fuel.consume(amount);
        }
    }

    fn fuel_async_yield_interval(&mut self, interval: Option<u64>) -> Result<()> {
        self.ensure_fuel()?;
        ensure!(
            self.engine.config().async_support,
            "async support is not configured in this store"
        );
        let interval = match interval {
            Some(n) => match NonZeroU64::new(n) {
                Some(n) => Some(n),
                None => bail!("fuel_async_yield_interval must not be 0"),
            },
            None => None,
        };
        self.fuel.set_yield_interval(interval);
        Ok(())
    }

    fn set_out_of_fuel(&mut self, policy: OutOfFuel) -> Result<()> {
        self.ensure_fuel()?;
        if let OutOfFuel::Yield { .. } = policy {
            ensure!(
                self.engine.config().async_support,
                "async support is not configured in this store"
            );
        }
        self.fuel.policy = policy;
        Ok(())
    }

    pub(crate) fn set_epoch_deadline(&mut self, delta: u64) {
        self.epoch_deadline = self.engine.current_epoch().saturating_add(delta);
    }

    /// Enters a guest frame, trapping if the configured depth is exceeded.
    pub(crate) fn enter_call(&mut self) -> Result<()> {
        if self.call_depth >= self.engine.config().max_call_depth {
            return Err(Trap::StackOverflow.into());
        }
        self.call_depth += 1;
        Ok(())
    }

    pub(crate) fn exit_call(&mut self) {
        debug_assert!(self.call_depth > 0);
        self.call_depth -= 1;
    }

    pub(crate) fn call_depth(&self) -> usize {
        self.call_depth
    }

    /// Puts the call depth back after frames were abandoned by a panic.
    pub(crate) fn restore_call_depth(&mut self, depth: usize) {
        self.call_depth = depth;
    }
}

impl Drop for StoreOpaque {
    fn drop(&mut self) {
        self.flush_fiber_stack();
    }
}
