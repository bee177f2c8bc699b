use crate::call::CallFuture;
use crate::continuation::{HostContinuation, PendingContinuation};
use crate::store::{StoreId, StoreInner};
use crate::trap::panic_message;
use crate::values::typecheck;
use crate::{interp, Engine, FuncType, Store, Trap, Val};
use anyhow::{bail, ensure, Context as _, Result};
use core::fmt;
use core::panic::AssertUnwindSafe;
use std::panic;

/// A reference to a function defined within an [`Instance`](crate::Instance)
/// or imported into it.
///
/// A `Func` is only valid within the [`Store`] it came from. Using it with a
/// different store is an error.
#[derive(Copy, Clone, Debug)]
pub struct Func {
    pub(crate) store: StoreId,
    pub(crate) instance: usize,
    pub(crate) index: u32,
}

impl Func {
    /// Returns the signature of this function.
    ///
    /// # Panics
    ///
    /// Panics if `store` does not own this function.
    pub fn ty<T>(&self, store: &Store<T>) -> FuncType {
        assert_eq!(
            store.inner().id(),
            self.store,
            "object used with the wrong store"
        );
        store.inner().instances[self.instance]
            .module
            .func_type(self.index)
            .clone()
    }

    /// Invokes this function synchronously with the `params` given, writing
    /// the results into `results`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store's engine has async support enabled (use
    /// [`Func::call_async`] instead), if `params` or `results` do not match
    /// the signature, or if guest code traps.
    pub fn call<T>(&self, store: &mut Store<T>, params: &[Val], results: &mut [Val]) -> Result<()> {
        ensure!(
            !store.engine().config().async_support,
            "must use `call_async` when async support is enabled on the config"
        );
        let ty = self.checked_ty(store)?;
        typecheck("params", ty.params(), params)?;
        ensure!(
            results.len() == ty.results().len(),
            "expected {} results, got {}",
            ty.results().len(),
            results.len()
        );
        let values = interp::invoke(store.inner_mut(), *self, params.to_vec())?;
        results.copy_from_slice(&values);
        Ok(())
    }

    /// Starts an asynchronous invocation of this function.
    ///
    /// Nothing runs until the returned [`CallFuture`] is first polled. The
    /// store stays borrowed until the future is dropped; dropping it before
    /// completion cancels the call.
    ///
    /// Argument or configuration errors do not panic: the returned future
    /// completes on its first poll with the error as its outcome.
    pub fn call_async<'a, T>(&self, store: &'a mut Store<T>, params: &[Val]) -> CallFuture<'a, T> {
        match self.prepare_async(store, params) {
            Ok(params) => CallFuture::new(store, *self, params),
            Err(e) => CallFuture::failed(store, e),
        }
    }

    fn prepare_async<T>(&self, store: &Store<T>, params: &[Val]) -> Result<Vec<Val>> {
        ensure!(
            store.engine().config().async_support,
            "cannot use `call_async` without enabling async support in the config"
        );
        let ty = self.checked_ty(store)?;
        typecheck("params", ty.params(), params)?;
        Ok(params.to_vec())
    }

    fn checked_ty<T>(&self, store: &Store<T>) -> Result<FuncType> {
        if store.inner().id() != self.store {
            bail!("function used with the wrong store");
        }
        Ok(self.ty(store))
    }
}

/// A view of the store handed to host functions and continuations.
///
/// Guest code is paused for as long as a `Caller` is alive, so everything
/// here is safe to inspect or modify.
pub struct Caller<'a, T> {
    store: &'a mut StoreInner<T>,
}

impl<'a, T> Caller<'a, T> {
    pub(crate) fn new(store: &'a mut StoreInner<T>) -> Caller<'a, T> {
        Caller { store }
    }

    /// Returns the underlying data of this store.
    pub fn data(&self) -> &T {
        self.store.data()
    }

    /// Returns the underlying data of this store.
    pub fn data_mut(&mut self) -> &mut T {
        self.store.data_mut()
    }

    /// Returns the underlying [`Engine`] this store is connected to.
    pub fn engine(&self) -> &Engine {
        self.store.engine()
    }

    /// Same as [`Store::get_fuel`].
    pub fn get_fuel(&self) -> Result<u64> {
        self.store.get_fuel()
    }

    /// Same as [`Store::set_fuel`].
    pub fn set_fuel(&mut self, fuel: u64) -> Result<()> {
        self.store.set_fuel(fuel)
    }

    /// Same as [`Store::fuel_consumed`].
    pub fn fuel_consumed(&self) -> Result<u64> {
        self.store.fuel_consumed()
    }

    /// Same as [`Store::set_epoch_deadline`].
    pub fn set_epoch_deadline(&mut self, ticks_beyond_current: u64) {
        self.store.set_epoch_deadline(ticks_beyond_current);
    }
}

type SyncHostFn<T> = Box<dyn Fn(Caller<'_, T>, &[Val], &mut [Val]) -> Result<()> + Send + Sync>;
type AsyncHostFn<T> =
    Box<dyn Fn(Caller<'_, T>, &[Val]) -> Result<Box<dyn HostContinuation<T>>> + Send + Sync>;

/// A host function definition, as stored in a [`Linker`](crate::Linker) and
/// in the import table of each instance.
pub(crate) struct HostFunc<T> {
    name: String,
    ty: FuncType,
    kind: HostFuncKind<T>,
}

enum HostFuncKind<T> {
    Sync(SyncHostFn<T>),
    Async(AsyncHostFn<T>),
}

impl<T> HostFunc<T> {
    pub(crate) fn new_sync(name: String, ty: FuncType, func: SyncHostFn<T>) -> HostFunc<T> {
        HostFunc {
            name,
            ty,
            kind: HostFuncKind::Sync(func),
        }
    }

    pub(crate) fn new_async(name: String, ty: FuncType, func: AsyncHostFn<T>) -> HostFunc<T> {
        HostFunc {
            name,
            ty,
            kind: HostFuncKind::Async(func),
        }
    }

    pub(crate) fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub(crate) fn is_async(&self) -> bool {
        matches!(self.kind, HostFuncKind::Async(_))
    }

    /// Invokes the host function on behalf of guest code.
    ///
    /// For asynchronous functions this suspends the current fiber until the
    /// returned continuation completes.
    pub(crate) fn call(&self, store: &mut StoreInner<T>, params: &[Val]) -> Result<Vec<Val>> {
        typecheck("params", self.ty.params(), params)?;
        match &self.kind {
            HostFuncKind::Sync(func) => {
                let mut results = self.ty.result_slots();
                catch_host_panic(&self.name, || func(Caller::new(store), params, &mut results))?;
                typecheck("results", self.ty.results(), &results)
                    .with_context(|| format!("host function `{}` returned bad results", self.name))?;
                Ok(results)
            }
            HostFuncKind::Async(func) => {
                let continuation = catch_host_panic(&self.name, || func(Caller::new(store), params))?;
                log::trace!("host function `{}` returned a continuation", self.name);
                store.suspend_on(PendingContinuation::new(
                    self.name.clone(),
                    continuation,
                    self.ty.results().into(),
                ))
            }
        }
    }
}

impl<T> fmt::Debug for HostFunc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("async", &self.is_async())
            .finish_non_exhaustive()
    }
}

/// Runs host code, turning a panic into a [`Trap::HostPanic`] error.
pub(crate) fn catch_host_panic<R>(name: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(&*payload);
            log::debug!("host function `{name}` panicked: {msg}");
            Err(anyhow::Error::from(Trap::HostPanic)
                .context(format!("host function `{name}` panicked: {msg}")))
        }
    }
}
