use anyhow::{ensure, Result};
use core::fmt;

/// Default size of the native stack allocated for each asynchronous call.
pub const DEFAULT_ASYNC_STACK_SIZE: usize = 2 << 20;

/// Default limit on nested guest calls before `Trap::StackOverflow`.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Native stack reserved for every guest frame when sizing asynchronous
/// stacks: `async_stack_size` must be at least `max_call_depth` times this.
pub const STACK_PER_GUEST_FRAME: usize = 8 << 10;

/// Global configuration options used to create an [`Engine`](crate::Engine)
/// and customize its behavior.
///
/// This structure exposes a builder-like interface and is primarily
/// consumed by [`Engine::new()`](crate::Engine::new).
#[derive(Clone)]
pub struct Config {
    pub(crate) consume_fuel: bool,
    pub(crate) epoch_interruption: bool,
    pub(crate) async_support: bool,
    pub(crate) async_stack_size: usize,
    pub(crate) max_call_depth: usize,
}

impl Config {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub fn new() -> Config {
        Config {
            consume_fuel: false,
            epoch_interruption: false,
            async_support: false,
            async_stack_size: DEFAULT_ASYNC_STACK_SIZE,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    /// Configures whether execution of guest code will "consume fuel" to
    /// either halt or yield execution as desired.
    ///
    /// Every instruction executed consumes fuel (with a few zero-cost
    /// exceptions). When a store runs out of fuel it either traps or, if
    /// configured through
    /// [`Store::out_of_fuel_async_yield`](crate::Store::out_of_fuel_async_yield),
    /// suspends the current asynchronous call.
    ///
    /// By default this option is `false`.
    pub fn consume_fuel(&mut self, enable: bool) -> &mut Self {
        self.consume_fuel = enable;
        self
    }

    /// Enables epoch-based interruption.
    ///
    /// When enabled, guest code checks the engine's epoch counter at
    /// function entry and loop back-edges and compares it against the
    /// store's deadline. The counter is advanced with
    /// [`Engine::increment_epoch`](crate::Engine::increment_epoch), which is
    /// safe to call from any thread (for example a timer).
    ///
    /// Note that when this is enabled every store starts with a deadline of
    /// the current epoch, so guest code traps immediately until
    /// [`Store::set_epoch_deadline`](crate::Store::set_epoch_deadline) is
    /// called.
    ///
    /// By default this option is `false`.
    pub fn epoch_interruption(&mut self, enable: bool) -> &mut Self {
        self.epoch_interruption = enable;
        self
    }

    /// Whether or not to enable support for asynchronous calls.
    ///
    /// When enabled, guest calls must be made with
    /// [`Func::call_async`](crate::Func::call_async) and run on a separate
    /// native stack, which allows them to suspend on asynchronous host
    /// functions, fuel exhaustion and epoch deadlines. Synchronous entry
    /// points such as [`Func::call`](crate::Func::call) return an error on
    /// an async engine, and asynchronous host functions cannot be
    /// registered on a synchronous one.
    ///
    /// By default this option is `false`.
    pub fn async_support(&mut self, enable: bool) -> &mut Self {
        self.async_support = enable;
        self
    }

    /// Configures the size of the stacks used for asynchronous execution.
    ///
    /// The stack must be able to hold [`Config::max_call_depth`] guest
    /// frames of [`STACK_PER_GUEST_FRAME`] bytes each, otherwise
    /// [`Engine::new`](crate::Engine::new) fails. Host functions and
    /// continuations run on this stack too, so deep host code needs more.
    ///
    /// By default this option is 2 MiB.
    pub fn async_stack_size(&mut self, size: usize) -> &mut Self {
        self.async_stack_size = size;
        self
    }

    /// Configures how many guest frames may be live at once before a call
    /// traps with `Trap::StackOverflow`.
    ///
    /// With async support enabled, raising this may also require raising
    /// [`Config::async_stack_size`].
    ///
    /// By default this option is 256.
    pub fn max_call_depth(&mut self, depth: usize) -> &mut Self {
        self.max_call_depth = depth;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.max_call_depth > 0, "max_call_depth must be nonzero");
        if self.async_support {
            ensure!(
                self.async_stack_size > 0,
                "async_stack_size must be nonzero when async support is enabled"
            );
            let needed = self.max_call_depth.saturating_mul(STACK_PER_GUEST_FRAME);
            ensure!(
                self.async_stack_size >= needed,
                "async stack size of {} bytes cannot hold {} guest frames, \
                 at least {needed} bytes are required",
                self.async_stack_size,
                self.max_call_depth,
            );
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("consume_fuel", &self.consume_fuel)
            .field("epoch_interruption", &self.epoch_interruption)
            .field("async_support", &self.async_support)
            .field("async_stack_size", &self.async_stack_size)
            .field("max_call_depth", &self.max_call_depth)
            .finish()
    }
}
