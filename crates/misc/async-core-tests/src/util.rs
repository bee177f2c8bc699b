use std::sync::Once;

use anyhow::Result;
use wasmtime_async_core::{
    CallFuture, CallOutcome, CallStatus, Config, Engine, Func, Linker, Module, Store,
    SuspendReason, Val,
};

use super::{print_host, ready_host, Ctx};

pub fn init_logger() {
    static ONCE: Once = Once::new();
    ONCE.call_once(env_logger::init);
}

pub fn config() -> Config {
    init_logger();

    let mut config = Config::new();
    config.async_support(true);
    config
}

/// A linker with every host function of this crate defined.
pub fn linker(engine: &Engine) -> Result<Linker<Ctx>> {
    let mut linker = Linker::new(engine);
    print_host::add_to_linker(&mut linker)?;
    ready_host::add_to_linker(&mut linker)?;
    Ok(linker)
}

/// Instantiates `module` in `store` and returns its `main` export.
pub fn instantiate_main(store: &mut Store<Ctx>, module: &Module) -> Result<Func> {
    let linker = linker(store.engine())?;
    let instance = futures::executor::block_on(linker.instantiate_async(store, module))?;
    instance
        .get_func(store, "main")
        .ok_or_else(|| anyhow::anyhow!("module has no `main` export"))
}

/// Suspensions observed while driving a call to completion by hand.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollTrace {
    /// Polls which returned `false`.
    pub pending: usize,
    pub awaiting_continuation: usize,
    pub out_of_fuel: usize,
    pub epoch_deadline: usize,
}

impl PollTrace {
    fn record(&mut self, status: CallStatus) {
        self.pending += 1;
        match status {
            CallStatus::Suspended(SuspendReason::AwaitingContinuation) => {
                self.awaiting_continuation += 1
            }
            CallStatus::Suspended(SuspendReason::OutOfFuel { .. }) => self.out_of_fuel += 1,
            CallStatus::Suspended(SuspendReason::EpochDeadline) => self.epoch_deadline += 1,
            status => panic!("unexpected status after a pending poll: {status:?}"),
        }
    }
}

/// Polls `call` until it is done, calling `before_poll` ahead of every
/// poll, and returns what was observed on the way.
pub fn drive<T>(call: &mut CallFuture<'_, T>, mut before_poll: impl FnMut()) -> PollTrace {
    let mut trace = PollTrace::default();
    loop {
        before_poll();
        if call.poll() {
            return trace;
        }
        trace.record(call.status());
    }
}

/// Returns the values of a call which returned normally, failing on a trap
/// or error.
pub fn returned<T>(call: &CallFuture<'_, T>) -> Result<Vec<Val>> {
    match call.get_results()? {
        CallOutcome::Returned(vals) => Ok(vals.to_vec()),
        CallOutcome::Trap(e) => Err(anyhow::anyhow!("call trapped: {e:#}")),
        CallOutcome::Error(e) => Err(anyhow::anyhow!("call failed: {e:#}")),
    }
}
