//! The `demo` subcommand: a guest loop calling an asynchronous host
//! function, driven by hand or on a tokio runtime.

use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;
use wasmtime_async_core::{
    continuation, CallStatus, Config, Engine, FuncType, Instr, Linker, Module, Store,
    SuspendReason, Val, ValType,
};

/// Runs a guest which calls an asynchronous host `print` function in a loop
#[derive(Parser)]
pub struct DemoCommand {
    /// Number of polls each call to `host::print` needs before it completes.
    #[arg(long, value_name = "N", default_value_t = 5)]
    polls: usize,

    /// Number of values the guest prints.
    #[arg(long, value_name = "N", default_value_t = 3)]
    iterations: i32,

    /// Iterations of busy work the guest does before each print.
    #[arg(long, value_name = "N", default_value_t = 20)]
    work: i32,

    /// Meter guest execution, starting with this much fuel.
    #[arg(long, value_name = "FUEL")]
    fuel: Option<u64>,

    /// Fuel injected each time the store runs out.
    #[arg(long, value_name = "FUEL", default_value_t = 10)]
    quantum: u64,

    /// Microseconds to wait before resuming a call which ran out of fuel.
    #[arg(long, value_name = "MICROS", default_value_t = 10_000)]
    backoff: u64,

    /// Advance the engine epoch every this many milliseconds, yielding
    /// whenever it moves.
    #[arg(long, value_name = "MILLIS")]
    epoch_tick: Option<u64>,

    /// Drive the call on a tokio runtime instead of polling it by hand.
    #[arg(long)]
    tokio: bool,
}

struct Host {
    polls: usize,
}

impl DemoCommand {
    /// Builds the guest, then runs its `main` export to completion.
    pub fn execute(self) -> Result<()> {
        super::init_logging()?;

        let mut config = Config::new();
        config
            .async_support(true)
            .consume_fuel(self.fuel.is_some())
            .epoch_interruption(self.epoch_tick.is_some());
        let engine = Engine::new(&config)?;

        let mut store = Store::new(&engine, Host { polls: self.polls });
        if let Some(fuel) = self.fuel {
            store.set_fuel(fuel)?;
            store.out_of_fuel_async_yield(self.quantum, Duration::from_micros(self.backoff))?;
        }
        if self.epoch_tick.is_some() {
            store.set_epoch_deadline(1);
            store.epoch_deadline_async_yield_and_update(1)?;
        }

        let mut linker = Linker::new(&engine);
        define_print(&mut linker)?;
        let module = self.guest()?;
        let instance = futures::executor::block_on(linker.instantiate_async(&mut store, &module))
            .context("failed to instantiate")?;
        let main = instance
            .get_func(&store, "main")
            .context("guest has no `main` export")?;

        let ticker = self.epoch_tick.map(|millis| Ticker::spawn(&engine, millis));

        println!("polling!");
        let mut call = main.call_async(&mut store, &[]);
        let result = if self.tokio {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            let result = runtime.block_on(&mut call);
            drop(call);
            result
        } else {
            while !call.poll() {
                println!("yield!");
                log::debug!("call status: {:?}", call.status());
                if let CallStatus::Suspended(SuspendReason::OutOfFuel { backoff }) = call.status() {
                    thread::sleep(backoff);
                }
            }
            call.into_results()
        };
        drop(ticker);
        result.context("running main failed")?;

        if self.fuel.is_some() {
            println!("fuel consumed: {}", store.fuel_consumed()?);
        }
        Ok(())
    }

    /// `main` runs `work` iterations of busy work, then prints the loop
    /// counter, `iterations` times.
    fn guest(&self) -> Result<Module> {
        let mut b = Module::builder();
        let print = b.import("host", "print", FuncType::new([ValType::I32], []));
        let main = b.func(
            FuncType::new([], []),
            [ValType::I32, ValType::I32],
            [Instr::Block(vec![Instr::Loop(vec![
                // while i < iterations
                Instr::LocalGet(0),
                Instr::I32Const(self.iterations),
                Instr::I32LtS,
                Instr::I32Eqz,
                Instr::BrIf(1),
                // for j in 0..work {}
                Instr::I32Const(0),
                Instr::LocalSet(1),
                Instr::Block(vec![Instr::Loop(vec![
                    Instr::LocalGet(1),
                    Instr::I32Const(self.work),
                    Instr::I32LtS,
                    Instr::I32Eqz,
                    Instr::BrIf(1),
                    Instr::LocalGet(1),
                    Instr::I32Const(1),
                    Instr::I32Add,
                    Instr::LocalSet(1),
                    Instr::Br(0),
                ])]),
                // print(i); i += 1
                Instr::LocalGet(0),
                Instr::Call(print),
                Instr::LocalGet(0),
                Instr::I32Const(1),
                Instr::I32Add,
                Instr::LocalSet(0),
                Instr::Br(0),
            ])])],
        );
        b.export("main", main);
        b.build()
    }
}

/// `host::print` echoes its argument on every poll and completes on the
/// configured poll.
fn define_print(linker: &mut Linker<Host>) -> Result<()> {
    linker.func_new_async(
        "host",
        "print",
        FuncType::new([ValType::I32], []),
        |caller, params| {
            let value = params[0].unwrap_i32();
            let ready_after = caller.data().polls;
            let mut polls = 0;
            Ok(continuation::poll_fn(move |_caller, cx| {
                println!("{value}");
                polls += 1;
                if polls < ready_after {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                } else {
                    Poll::Ready(Ok(Vec::<Val>::new()))
                }
            }))
        },
    )?;
    Ok(())
}

/// Advances an engine's epoch on a background thread until dropped.
struct Ticker {
    done: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    fn spawn(engine: &Engine, millis: u64) -> Ticker {
        let done = Arc::new(AtomicBool::new(false));
        let thread = {
            let engine = engine.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(millis));
                    engine.increment_epoch();
                }
            })
        };
        Ticker {
            done,
            thread: Some(thread),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
