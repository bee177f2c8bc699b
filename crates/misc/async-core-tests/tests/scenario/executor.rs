use std::time::{Duration, Instant};

use anyhow::Result;
use async_core_tests::util::{self, instantiate_main};
use async_core_tests::{guest, ready_host, Ctx};
use wasmtime_async_core::{CallStatus, Engine, Store, SuspendReason, UpdateDeadline, Val};

#[tokio::test]
async fn await_async_host_call() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(5));
    let module = guest::print_loop(3)?;
    let instance = util::linker(&engine)?
        .instantiate_async(&mut store, &module)
        .await?;
    let main = instance.get_func(&store, "main").unwrap();

    let results = main.call_async(&mut store, &[]).await?;
    assert!(results.is_empty());
    assert_eq!(store.data().printed, [0, 1, 2]);
    assert_eq!(store.data().cleanups(), 3);
    Ok(())
}

#[tokio::test]
async fn await_through_fuel_yields() -> Result<()> {
    let engine = Engine::new(util::config().consume_fuel(true))?;
    let mut store = Store::new(&engine, Ctx::default());
    store.set_fuel(10)?;
    store.out_of_fuel_async_yield(10, Duration::from_micros(10_000))?;
    let main = instantiate_main(&mut store, &guest::spin()?)?;

    let results = main.call_async(&mut store, &[Val::I32(100)]).await?;
    assert_eq!(results, [Val::I32(guest::spin_result(100))]);
    Ok(())
}

#[tokio::test]
async fn driver_honors_backoff() -> Result<()> {
    let engine = Engine::new(util::config().consume_fuel(true))?;
    let mut store = Store::new(&engine, Ctx::default());
    let backoff = Duration::from_millis(1);
    store.set_fuel(100)?;
    store.out_of_fuel_async_yield(100, backoff)?;
    let main = instantiate_main(&mut store, &guest::spin()?)?;

    let start = Instant::now();
    let mut call = main.call_async(&mut store, &[Val::I32(100)]);
    let mut yields = 0;
    while !call.poll() {
        if let CallStatus::Suspended(SuspendReason::OutOfFuel { backoff }) = call.status() {
            yields += 1;
            tokio::time::sleep(backoff).await;
        }
    }
    assert!(yields > 0);
    assert!(start.elapsed() >= backoff * yields);
    assert_eq!(call.into_results()?, [Val::I32(guest::spin_result(100))]);
    Ok(())
}

#[tokio::test]
async fn continuation_wakes_the_task() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::default());
    let wakers = store.data().wakers.clone();
    ready_host::set_ready(&wakers, false);
    let main = instantiate_main(&mut store, &guest::wait_ready()?)?;

    let signal = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ready_host::set_ready(&wakers, true);
    });
    let results = main.call_async(&mut store, &[]).await?;
    signal.await?;
    assert_eq!(results, [Val::I32(7)]);
    Ok(())
}

#[tokio::test]
async fn calls_on_separate_stores_interleave() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let module = guest::print_once()?;
    let mut a = Store::new(&engine, Ctx::new(3));
    let mut b = Store::new(&engine, Ctx::new(7));
    let main_a = instantiate_main(&mut a, &module)?;
    let main_b = instantiate_main(&mut b, &module)?;

    let (ra, rb) = futures::future::try_join(
        main_a.call_async(&mut a, &[Val::I32(1)]),
        main_b.call_async(&mut b, &[Val::I32(2)]),
    )
    .await?;
    assert_eq!(ra, [Val::I32(2)]);
    assert_eq!(rb, [Val::I32(4)]);
    assert_eq!(a.data().printed, [1]);
    assert_eq!(b.data().printed, [2]);
    assert_eq!(engine.live_fiber_stacks(), 2);
    drop((a, b));
    assert_eq!(engine.live_fiber_stacks(), 0);
    Ok(())
}

#[tokio::test]
async fn epoch_callback_awaits_a_timer() -> Result<()> {
    let engine = Engine::new(util::config().epoch_interruption(true))?;
    let mut store = Store::new(&engine, Ctx::default());
    store.epoch_deadline_callback(|_caller| {
        Ok(UpdateDeadline::YieldCustom(
            u64::MAX,
            Box::pin(tokio::time::sleep(Duration::from_millis(5))),
        ))
    });
    let main = instantiate_main(&mut store, &guest::spin()?)?;

    let start = Instant::now();
    let results = main.call_async(&mut store, &[Val::I32(10)]).await?;
    assert!(start.elapsed() >= Duration::from_millis(5));
    assert_eq!(results, [Val::I32(55)]);
    Ok(())
}

#[tokio::test]
async fn dropped_future_is_cancelled() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::default());
    ready_host::set_ready(&store.data().wakers, false);
    let main = instantiate_main(&mut store, &guest::wait_ready()?)?;

    let timeout =
        tokio::time::timeout(Duration::from_millis(10), main.call_async(&mut store, &[])).await;
    assert!(timeout.is_err());
    assert_eq!(engine.live_fiber_stacks(), 1);
    drop(store);
    assert_eq!(engine.live_fiber_stacks(), 0);
    Ok(())
}

#[test]
fn block_on_drives_the_call() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(4));
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let results = futures::executor::block_on(main.call_async(&mut store, &[Val::I32(50)]))?;
    assert_eq!(results, [Val::I32(100)]);
    assert_eq!(store.data().printed, [50]);
    Ok(())
}
