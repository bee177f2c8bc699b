use std::time::Duration;

use anyhow::Result;
use async_core_tests::util::{self, drive, instantiate_main, returned};
use async_core_tests::{guest, Ctx};
use wasmtime_async_core::{
    CallOutcome, CallStatus, Config, Engine, FuncType, Linker, Store, Trap, Val, ValType,
};

/// Runs `print_once` on a synchronous engine with a synchronous
/// `host::print`.
fn print_once_sync(x: i32) -> Result<(Vec<Val>, Vec<i32>)> {
    util::init_logger();
    let engine = Engine::new(&Config::new())?;
    let mut linker = Linker::<Ctx>::new(&engine);
    linker.func_new(
        "host",
        "print",
        FuncType::new([ValType::I32], []),
        |mut caller, params, _results| {
            caller.data_mut().printed.push(params[0].unwrap_i32());
            Ok(())
        },
    )?;
    let mut store = Store::new(&engine, Ctx::default());
    let instance = linker.instantiate(&mut store, &guest::print_once()?)?;
    let main = instance.get_func(&store, "main").unwrap();
    let mut results = [Val::I32(0)];
    main.call(&mut store, &[Val::I32(x)], &mut results)?;
    Ok((results.to_vec(), store.into_data().printed))
}

#[test]
fn async_print_takes_five_polls() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(5));
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(21)]);
    assert_eq!(call.status(), CallStatus::Created);
    let trace = drive(&mut call, || {});
    assert_eq!(trace.pending, 5);
    assert_eq!(trace.awaiting_continuation, 5);
    assert_eq!(call.status(), CallStatus::Completed);
    let results = returned(&call)?;
    drop(call);

    let (sync_results, sync_printed) = print_once_sync(21)?;
    assert_eq!(results, [Val::I32(42)]);
    assert_eq!(results, sync_results);
    assert_eq!(store.data().printed, sync_printed);
    assert_eq!(store.data().cleanups(), 1);
    Ok(())
}

#[test]
fn continuation_polls_add_to_call_polls() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let module = guest::print_once()?;

    // The same guest with a host function that completes immediately.
    let mut linker = Linker::<Ctx>::new(&engine);
    linker.func_new(
        "host",
        "print",
        FuncType::new([ValType::I32], []),
        |_, _, _| Ok(()),
    )?;
    let mut store = Store::new(&engine, Ctx::default());
    let instance = futures::executor::block_on(linker.instantiate_async(&mut store, &module))?;
    let main = instance.get_func(&store, "main").unwrap();
    let mut call = main.call_async(&mut store, &[Val::I32(1)]);
    let baseline = drive(&mut call, || {}).pending;
    assert_eq!(baseline, 0);
    drop(call);

    for n in [1, 2, 7, 20] {
        let mut store = Store::new(&engine, Ctx::new(n));
        let main = instantiate_main(&mut store, &module)?;
        let mut call = main.call_async(&mut store, &[Val::I32(3)]);
        let trace = drive(&mut call, || {});
        assert!(trace.pending >= baseline + n, "{n} polls: {trace:?}");
        assert_eq!(returned(&call)?, [Val::I32(6)]);
        drop(call);
        assert_eq!(store.data().cleanups(), 1, "{n} polls");
    }
    Ok(())
}

#[test]
fn every_print_suspends_the_call() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(3));
    let main = instantiate_main(&mut store, &guest::print_loop(4)?)?;

    let mut call = main.call_async(&mut store, &[]);
    let trace = drive(&mut call, || {});
    assert_eq!(trace.awaiting_continuation, 4 * 3);
    assert!(returned(&call)?.is_empty());
    drop(call);
    assert_eq!(store.data().printed, [0, 1, 2, 3]);
    assert_eq!(store.data().cleanups(), 4);
    Ok(())
}

#[test]
fn results_are_unavailable_until_done() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(2));
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(5)]);
    let err = call.get_results().unwrap_err();
    assert!(err.to_string().contains("not completed"), "{err}");

    assert!(!call.poll());
    assert!(call.get_results().is_err());
    assert!(!call.poll());
    assert!(call.get_results().is_err());
    assert!(call.poll());
    assert!(matches!(call.get_results()?, CallOutcome::Returned([Val::I32(10)])));
    Ok(())
}

#[test]
fn into_results_before_done_is_an_error() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::default());
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(5)]);
    assert!(!call.poll());
    assert!(call.into_results().is_err());
    assert_eq!(store.data().cleanups(), 1);
    Ok(())
}

#[test]
fn done_is_sticky() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(1));
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(8)]);
    drive(&mut call, || {});
    let first = returned(&call)?;
    for _ in 0..3 {
        assert!(call.poll());
        assert!(call.is_done());
        assert_eq!(returned(&call)?, first);
    }
    assert_eq!(call.into_results()?, [Val::I32(16)]);
    assert_eq!(store.data().printed, [8]);
    Ok(())
}

/// Stores configured in every way a call can be metered or suspended.
fn trap_configs() -> Result<Vec<(&'static str, Store<Ctx>)>> {
    let plain = Engine::new(&util::config())?;
    let fuel = Engine::new(util::config().consume_fuel(true))?;
    let epoch = Engine::new(util::config().epoch_interruption(true))?;
    let both = Engine::new(util::config().consume_fuel(true).epoch_interruption(true))?;

    let mut stores = Vec::new();
    stores.push(("plain", Store::new(&plain, Ctx::new(1))));

    let mut store = Store::new(&fuel, Ctx::new(1));
    store.set_fuel(100)?;
    stores.push(("fuel trap", store));

    let mut store = Store::new(&fuel, Ctx::new(1));
    store.set_fuel(100)?;
    store.out_of_fuel_async_yield(10, Duration::from_micros(10_000))?;
    stores.push(("fuel yield", store));

    let mut store = Store::new(&epoch, Ctx::new(1));
    store.set_epoch_deadline(10);
    stores.push(("epoch trap", store));

    let mut store = Store::new(&epoch, Ctx::new(1));
    store.set_epoch_deadline(10);
    store.epoch_deadline_async_yield_and_update(1)?;
    stores.push(("epoch yield", store));

    let mut store = Store::new(&both, Ctx::new(1));
    store.set_fuel(1_000)?;
    store.out_of_fuel_async_yield(1, Duration::ZERO)?;
    store.set_epoch_deadline(10);
    store.epoch_deadline_async_yield_and_update(1)?;
    stores.push(("fuel and epoch yield", store));
    Ok(stores)
}

#[test]
fn unreachable_traps_on_the_first_poll() -> Result<()> {
    let module = guest::unreachable()?;
    for (name, mut store) in trap_configs()? {
        let main = instantiate_main(&mut store, &module)?;
        let mut call = main.call_async(&mut store, &[]);
        assert!(call.poll(), "{name}");
        let outcome = call.get_results()?;
        assert_eq!(outcome.trap(), Some(Trap::UnreachableCodeReached), "{name}");
        assert!(call.poll(), "{name}");
        assert_eq!(call.get_results()?.trap(), Some(Trap::UnreachableCodeReached), "{name}");
    }
    Ok(())
}

#[test]
fn trap_after_async_host_call() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(2));
    let main = instantiate_main(&mut store, &guest::print_then_trap()?)?;

    let mut call = main.call_async(&mut store, &[]);
    let trace = drive(&mut call, || {});
    assert_eq!(trace.awaiting_continuation, 2);
    let outcome = call.get_results()?;
    assert!(matches!(outcome, CallOutcome::Trap(_)), "{outcome:?}");
    assert_eq!(outcome.trap(), Some(Trap::UnreachableCodeReached));
    drop(call);
    assert_eq!(store.data().printed, [1]);
    assert_eq!(store.data().cleanups(), 1);
    Ok(())
}
