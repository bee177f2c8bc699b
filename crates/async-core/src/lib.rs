//! Asynchronous execution of WebAssembly-style guest calls.
//!
//! This crate runs guest code on separate native stacks ("fibers") so that a
//! call can be suspended in the middle of execution and resumed later by an
//! external driver, without dedicating an OS thread to it. A call suspends
//! when:
//!
//! * guest code calls an asynchronous host function, which hands back a
//!   [`HostContinuation`] to be polled until it produces the results,
//! * the store runs out of fuel and is configured with
//!   [`Store::out_of_fuel_async_yield`], or
//! * the engine epoch passes the store's deadline and the store is
//!   configured to yield.
//!
//! The driver advances a call through the [`CallFuture`] returned by
//! [`Func::call_async`], either by calling [`CallFuture::poll`] in a loop or
//! by awaiting it on an executor.
//!
//! ```
//! use wasmtime_async_core::*;
//!
//! # fn main() -> Result<()> {
//! let mut config = Config::new();
//! config.async_support(true);
//! let engine = Engine::new(&config)?;
//!
//! let mut linker = Linker::<()>::new(&engine);
//! linker.func_new_async(
//!     "host",
//!     "answer",
//!     FuncType::new([], [ValType::I32]),
//!     |_caller, _params| {
//!         let mut polls = 0;
//!         Ok(continuation::poll_fn(move |_caller, _cx| {
//!             polls += 1;
//!             if polls < 3 {
//!                 std::task::Poll::Pending
//!             } else {
//!                 std::task::Poll::Ready(Ok(vec![Val::I32(42)]))
//!             }
//!         }))
//!     },
//! )?;
//!
//! let mut module = Module::builder();
//! let answer = module.import("host", "answer", FuncType::new([], [ValType::I32]));
//! let run = module.func(
//!     FuncType::new([], [ValType::I32]),
//!     [],
//!     [Instr::Call(answer), Instr::I32Const(1), Instr::I32Add],
//! );
//! module.export("run", run);
//! let module = module.build()?;
//!
//! let mut store = Store::new(&engine, ());
//! let instance = futures::executor::block_on(linker.instantiate_async(&mut store, &module))?;
//! let run = instance.get_func(&store, "run").unwrap();
//!
//! let mut call = run.call_async(&mut store, &[]);
//! while !call.poll() {}
//! match call.get_results()? {
//!     CallOutcome::Returned(vals) => assert_eq!(vals, [Val::I32(43)]),
//!     other => panic!("unexpected outcome: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

mod call;
mod config;
pub mod continuation;
mod engine;
mod epoch;
mod fiber;
mod fuel;
mod func;
mod instance;
mod interp;
mod linker;
mod module;
mod store;
mod trap;
mod values;

pub use crate::call::{CallFuture, CallOutcome, CallStatus};
pub use crate::config::{
    Config, DEFAULT_ASYNC_STACK_SIZE, DEFAULT_MAX_CALL_DEPTH, STACK_PER_GUEST_FRAME,
};
pub use crate::continuation::HostContinuation;
pub use crate::engine::Engine;
pub use crate::epoch::UpdateDeadline;
pub use crate::fiber::SuspendReason;
pub use crate::fuel::OutOfFuel;
pub use crate::func::{Caller, Func};
pub use crate::instance::Instance;
pub use crate::linker::Linker;
pub use crate::module::{Import, Instr, Module, ModuleBuilder};
pub use crate::store::Store;
pub use crate::trap::Trap;
pub use crate::values::{FuncType, Val, ValType};

pub use anyhow::{Error, Result};
