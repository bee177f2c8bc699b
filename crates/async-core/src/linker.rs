use crate::continuation::{self, HostContinuation};
use crate::func::HostFunc;
use crate::{Caller, Engine, FuncType, Instance, Module, Store, Val};
use anyhow::{bail, ensure, Result};
use core::future::Future;
use std::collections::hash_map::{Entry, HashMap};
use std::sync::Arc;

/// Structure used to link guest modules with host functions.
///
/// A `Linker` holds named host function definitions which are matched
/// against a module's imports at instantiation time. Definitions are either
/// synchronous, returning their results directly, or asynchronous,
/// returning a [`HostContinuation`] that the caller's
/// [`CallFuture`](crate::CallFuture) polls until it produces the results.
///
/// Defining the same name twice is an error unless
/// [`Linker::allow_shadowing`] is enabled, in which case the later
/// definition wins.
pub struct Linker<T> {
    engine: Engine,
    map: HashMap<ImportKey, Arc<HostFunc<T>>>,
    allow_shadowing: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ImportKey {
    module: String,
    name: String,
}

impl<T> Clone for Linker<T> {
    fn clone(&self) -> Linker<T> {
        Linker {
            engine: self.engine.clone(),
            map: self.map.clone(),
            allow_shadowing: self.allow_shadowing,
        }
    }
}

impl<T> Linker<T> {
    /// Creates a new [`Linker`] with no definitions.
    pub fn new(engine: &Engine) -> Linker<T> {
        Linker {
            engine: engine.clone(),
            map: HashMap::new(),
            allow_shadowing: false,
        }
    }

    /// Returns the [`Engine`] this is connected to.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Configures whether this [`Linker`] will shadow previous duplicate
    /// definitions of the same name.
    ///
    /// By default a [`Linker`] will disallow duplicate definitions of the
    /// same name.
    pub fn allow_shadowing(&mut self, allow: bool) -> &mut Self {
        self.allow_shadowing = allow;
        self
    }

    /// Defines a synchronous host function.
    ///
    /// The closure receives the parameters, already checked against `ty`,
    /// and writes its results into pre-filled slots. Results are checked
    /// against `ty` once it returns.
    pub fn func_new(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: impl Fn(Caller<'_, T>, &[Val], &mut [Val]) -> Result<()> + Send + Sync + 'static,
    ) -> Result<&mut Self> {
        let host = HostFunc::new_sync(format!("{module}::{name}"), ty, Box::new(func));
        self.insert(module, name, host)?;
        Ok(self)
    }

    /// Defines an asynchronous host function.
    ///
    /// The closure runs once per call, on the guest's stack, and returns a
    /// [`HostContinuation`] which is then polled by the driver of the call
    /// until it yields the results. An error returned here, or a panic,
    /// ends the call without creating a continuation.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine does not have async support enabled,
    /// or on a duplicate definition.
    pub fn func_new_async(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: impl Fn(Caller<'_, T>, &[Val]) -> Result<Box<dyn HostContinuation<T>>>
            + Send
            + Sync
            + 'static,
    ) -> Result<&mut Self> {
        ensure!(
            self.engine.config().async_support,
            "cannot use `func_new_async` without enabling async support in the config"
        );
        let host = HostFunc::new_async(format!("{module}::{name}"), ty, Box::new(func));
        self.insert(module, name, host)?;
        Ok(self)
    }

    /// Defines an asynchronous host function whose work is a Rust future.
    ///
    /// This is a convenience over [`Linker::func_new_async`] using
    /// [`continuation::from_future`].
    pub fn func_wrap_async<F>(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: impl Fn(Caller<'_, T>, Vec<Val>) -> F + Send + Sync + 'static,
    ) -> Result<&mut Self>
    where
        F: Future<Output = Result<Vec<Val>>> + Send + 'static,
    {
        self.func_new_async(module, name, ty, move |caller, params| {
            Ok(continuation::from_future(func(caller, params.to_vec())))
        })
    }

    /// Returns the signature of the definition for `module::name`, if any.
    pub fn get_ty(&self, module: &str, name: &str) -> Option<&FuncType> {
        self.map.get(&ImportKey::new(module, name)).map(|f| f.ty())
    }

    fn insert(&mut self, module: &str, name: &str, host: HostFunc<T>) -> Result<()> {
        match self.map.entry(ImportKey::new(module, name)) {
            Entry::Occupied(_) if !self.allow_shadowing => {
                bail!("import of `{module}::{name}` defined twice")
            }
            Entry::Occupied(mut e) => {
                log::debug!("shadowing definition of `{module}::{name}`");
                e.insert(Arc::new(host));
            }
            Entry::Vacant(v) => {
                v.insert(Arc::new(host));
            }
        }
        Ok(())
    }

    fn resolve(&self, module: &Module) -> Result<Arc<[Arc<HostFunc<T>>]>> {
        module
            .imports()
            .map(|import| {
                let key = ImportKey::new(import.module(), import.name());
                let Some(def) = self.map.get(&key) else {
                    bail!(
                        "unknown import: `{}::{}` has not been defined",
                        import.module(),
                        import.name()
                    );
                };
                ensure!(
                    def.ty() == import.ty(),
                    "incompatible import type for `{}::{}`: expected {}, found {}",
                    import.module(),
                    import.name(),
                    import.ty(),
                    def.ty()
                );
                Ok(def.clone())
            })
            .collect()
    }

    fn check_store(&self, store: &Store<T>) -> Result<()> {
        ensure!(
            Engine::same(&self.engine, store.engine()),
            "cross-`Engine` instantiation is not currently supported"
        );
        Ok(())
    }

    /// Instantiates `module` in `store`, resolving its imports against the
    /// definitions in this linker, and runs its start function if it has
    /// one.
    ///
    /// # Errors
    ///
    /// Returns an error if an import is missing or has the wrong type, if
    /// the engine has async support enabled (use
    /// [`Linker::instantiate_async`] instead), or if the start function
    /// traps.
    pub fn instantiate(&self, store: &mut Store<T>, module: &Module) -> Result<Instance> {
        ensure!(
            !store.engine().config().async_support,
            "must use async instantiation when async support is enabled"
        );
        self.check_store(store)?;
        let imports = self.resolve(module)?;
        let instance = Instance::new_raw(store, module, imports);
        if let Some(start) = module.start() {
            instance.func(start).call(store, &[], &mut [])?;
        }
        Ok(instance)
    }

    /// Same as [`Linker::instantiate`], except the start function runs as an
    /// asynchronous call and may suspend.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine lacks async support, in addition to
    /// the errors of [`Linker::instantiate`].
    pub async fn instantiate_async(&self, store: &mut Store<T>, module: &Module) -> Result<Instance> {
        ensure!(
            store.engine().config().async_support,
            "must use sync instantiation when async support is disabled"
        );
        self.check_store(store)?;
        let imports = self.resolve(module)?;
        let instance = Instance::new_raw(store, module, imports);
        if let Some(start) = module.start() {
            instance.func(start).call_async(store, &[]).await?;
        }
        Ok(instance)
    }
}

impl ImportKey {
    fn new(module: &str, name: &str) -> ImportKey {
        ImportKey {
            module: module.to_string(),
            name: name.to_string(),
        }
    }
}
