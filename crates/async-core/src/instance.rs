use crate::func::HostFunc;
use crate::store::StoreId;
use crate::{Func, Module, Store};
use std::sync::Arc;

/// An instantiated module, living inside a [`Store`].
///
/// Created through [`Linker::instantiate`](crate::Linker::instantiate) or
/// [`Linker::instantiate_async`](crate::Linker::instantiate_async).
#[derive(Copy, Clone, Debug)]
pub struct Instance {
    store: StoreId,
    index: usize,
}

/// What a store keeps for each of its instances.
pub(crate) struct InstanceData<T> {
    pub(crate) module: Module,
    pub(crate) imports: Arc<[Arc<HostFunc<T>>]>,
}

impl<T> Clone for InstanceData<T> {
    fn clone(&self) -> Self {
        InstanceData {
            module: self.module.clone(),
            imports: self.imports.clone(),
        }
    }
}

impl Instance {
    /// Registers a new instance of `module` with `store`. The start
    /// function, if any, is left to the caller.
    pub(crate) fn new_raw<T>(
        store: &mut Store<T>,
        module: &Module,
        imports: Arc<[Arc<HostFunc<T>>]>,
    ) -> Instance {
        debug_assert_eq!(imports.len(), module.imports().len());
        let inner = store.inner_mut();
        inner.instances.push(InstanceData {
            module: module.clone(),
            imports,
        });
        Instance {
            store: inner.id(),
            index: inner.instances.len() - 1,
        }
    }

    pub(crate) fn func(&self, index: u32) -> Func {
        Func {
            store: self.store,
            instance: self.index,
            index,
        }
    }

    /// Looks up an exported function by name.
    ///
    /// # Panics
    ///
    /// Panics if `store` does not own this instance.
    pub fn get_func<T>(&self, store: &Store<T>, name: &str) -> Option<Func> {
        let index = self.module(store).export_index(name)?;
        Some(self.func(index))
    }

    /// Returns the module this instance was created from.
    ///
    /// # Panics
    ///
    /// Panics if `store` does not own this instance.
    pub fn module<'a, T>(&self, store: &'a Store<T>) -> &'a Module {
        assert_eq!(
            store.inner().id(),
            self.store,
            "object used with the wrong store"
        );
        &store.inner().instances[self.index].module
    }
}
