use crate::Config;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use wasmtime_fiber::FiberStack;

/// An `Engine` holds the configuration shared by every [`Store`] created
/// from it, along with the process-wide epoch counter.
///
/// Engines are cheap to clone (they are reference counted internally) and
/// may be shared across threads.
///
/// [`Store`]: crate::Store
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    epoch: AtomicU64,
    allocator: FiberStackAllocator,
}

impl Engine {
    /// Creates a new [`Engine`] with the specified compilation and
    /// configuration settings.
    ///
    /// # Errors
    ///
    /// This method can fail if the `config` is invalid.
    pub fn new(config: &Config) -> Result<Engine> {
        config.validate()?;
        Ok(Engine {
            inner: Arc::new(EngineInner {
                config: config.clone(),
                epoch: AtomicU64::new(0),
                allocator: FiberStackAllocator::new(config.async_stack_size),
            }),
        })
    }

    /// Returns the configuration settings that this engine is using.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Increments the epoch.
    ///
    /// When using epoch-based interruption, currently-executing guest code
    /// within this engine will trap or yield "soon" when the epoch deadline
    /// of its store is reached or exceeded; the check happens at the next
    /// function entry or loop back-edge.
    ///
    /// This method is safe to call from any thread and is intended to be
    /// driven by an external timer.
    pub fn increment_epoch(&self) {
        self.inner.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current epoch.
    pub fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Relaxed)
    }

    /// Number of asynchronous call stacks currently allocated from this
    /// engine, including stacks cached by live stores.
    ///
    /// Primarily useful for leak detection in tests.
    pub fn live_fiber_stacks(&self) -> usize {
        self.inner.allocator.live.load(Ordering::SeqCst)
    }

    /// Returns whether the engine `a` and `b` refer to the same
    /// configuration.
    pub fn same(a: &Engine, b: &Engine) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn allocator(&self) -> &FiberStackAllocator {
        &self.inner.allocator
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new(&Config::default()).unwrap()
    }
}

/// Hands out native stacks for asynchronous calls and keeps count of the
/// ones which have not been returned yet.
pub(crate) struct FiberStackAllocator {
    stack_size: usize,
    live: AtomicUsize,
}

impl FiberStackAllocator {
    fn new(stack_size: usize) -> FiberStackAllocator {
        FiberStackAllocator {
            stack_size,
            live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocate_fiber_stack(&self) -> Result<FiberStack> {
        let stack = FiberStack::new(self.stack_size, false)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        log::trace!("allocated fiber stack of {} bytes", self.stack_size);
        Ok(stack)
    }

    pub(crate) fn deallocate_fiber_stack(&self, stack: FiberStack) {
        drop(stack);
        self.forget_fiber_stack();
    }

    /// Accounts for a stack which was dropped somewhere else.
    pub(crate) fn forget_fiber_stack(&self) {
        let prev = self.live.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }
}
