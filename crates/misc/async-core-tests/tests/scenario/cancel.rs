use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use async_core_tests::util::{self, drive, instantiate_main, returned};
use async_core_tests::{guest, Ctx};
use wasmtime_async_core::{CallStatus, Engine, Store, SuspendReason, UpdateDeadline, Val};

/// Drops `store` and checks that no native stack outlives it.
fn assert_released(engine: &Engine, store: Store<Ctx>) {
    assert!(engine.live_fiber_stacks() <= 1);
    drop(store);
    assert_eq!(engine.live_fiber_stacks(), 0);
}

#[test]
fn cancel_before_first_poll() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::default());
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let call = main.call_async(&mut store, &[Val::I32(1)]);
    assert_eq!(call.status(), CallStatus::Created);
    drop(call);
    assert!(store.data().printed.is_empty());
    assert_eq!(store.data().cleanups(), 0);
    assert_released(&engine, store);
    Ok(())
}

#[test]
fn cancel_while_awaiting_continuation() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(100));
    let main = instantiate_main(&mut store, &guest::print_once()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(1)]);
    for _ in 0..3 {
        assert!(!call.poll());
    }
    assert_eq!(
        call.status(),
        CallStatus::Suspended(SuspendReason::AwaitingContinuation)
    );
    assert_eq!(engine.live_fiber_stacks(), 1);
    drop(call);
    assert!(store.data().printed.is_empty());
    assert_eq!(store.data().cleanups(), 1);

    // The store is usable again once the call is gone.
    store.data_mut().print_polls = 1;
    let mut call = main.call_async(&mut store, &[Val::I32(2)]);
    drive(&mut call, || {});
    assert_eq!(returned(&call)?, [Val::I32(4)]);
    drop(call);
    assert_eq!(store.data().printed, [2]);
    assert_eq!(store.data().cleanups(), 2);
    assert_released(&engine, store);
    Ok(())
}

#[test]
fn cancel_in_nested_frame() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(10));
    let main = instantiate_main(&mut store, &guest::print_then_trap()?)?;

    for _ in 0..4 {
        let mut call = main.call_async(&mut store, &[]);
        assert!(!call.poll());
        assert!(!call.poll());
    }
    assert_eq!(store.data().cleanups(), 4);
    assert!(store.data().printed.is_empty());
    assert_released(&engine, store);
    Ok(())
}

#[test]
fn cancel_while_out_of_fuel() -> Result<()> {
    let engine = Engine::new(util::config().consume_fuel(true))?;
    let mut store = Store::new(&engine, Ctx::default());
    store.set_fuel(50)?;
    store.out_of_fuel_async_yield(10, Duration::from_millis(10))?;
    let main = instantiate_main(&mut store, &guest::spin()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(1_000)]);
    assert!(!call.poll());
    assert!(matches!(
        call.status(),
        CallStatus::Suspended(SuspendReason::OutOfFuel { .. })
    ));
    drop(call);

    // Fuel is not refunded, but the next call starts afresh.
    store.set_fuel(10_000)?;
    let mut call = main.call_async(&mut store, &[Val::I32(10)]);
    let trace = drive(&mut call, || {});
    assert_eq!(trace.pending, 0);
    assert_eq!(returned(&call)?, [Val::I32(55)]);
    drop(call);
    assert_released(&engine, store);
    Ok(())
}

#[test]
fn cancel_at_epoch_deadline() -> Result<()> {
    let engine = Engine::new(util::config().epoch_interruption(true))?;
    let mut store = Store::new(&engine, Ctx::default());
    store.set_epoch_deadline(1);
    store.epoch_deadline_async_yield_and_update(1)?;
    let main = instantiate_main(&mut store, &guest::forever()?)?;

    let mut call = main.call_async(&mut store, &[]);
    engine.increment_epoch();
    assert!(!call.poll());
    assert_eq!(
        call.status(),
        CallStatus::Suspended(SuspendReason::EpochDeadline)
    );
    drop(call);
    assert_eq!(store.data().cleanups(), 0);
    assert_released(&engine, store);
    Ok(())
}

/// A future which never completes and counts how often it was polled and
/// dropped.
struct Stalled {
    polls: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

impl Future for Stalled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Poll::Pending
    }
}

impl Drop for Stalled {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn cancel_while_awaiting_epoch_future() -> Result<()> {
    let engine = Engine::new(util::config().epoch_interruption(true))?;
    let mut store = Store::new(&engine, Ctx::default());
    let polls = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let polls = polls.clone();
        let drops = drops.clone();
        store.epoch_deadline_callback(move |_caller| {
            let stalled = Stalled {
                polls: polls.clone(),
                drops: drops.clone(),
            };
            Ok(UpdateDeadline::YieldCustom(1, Box::pin(stalled)))
        });
    }
    let main = instantiate_main(&mut store, &guest::spin()?)?;

    let mut call = main.call_async(&mut store, &[Val::I32(10)]);
    for _ in 0..3 {
        assert!(!call.poll());
    }
    assert_eq!(
        call.status(),
        CallStatus::Suspended(SuspendReason::AwaitingContinuation)
    );
    assert_eq!(polls.load(Ordering::SeqCst), 2);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(call);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_released(&engine, store);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn dropping_a_completed_call_cleans_up_once() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::new(2));
    let main = instantiate_main(&mut store, &guest::print_loop(3)?)?;

    let mut call = main.call_async(&mut store, &[]);
    drive(&mut call, || {});
    assert!(call.is_done());
    drop(call);
    assert_eq!(store.data().cleanups(), 3);
    assert_released(&engine, store);
    Ok(())
}

#[test]
fn stacks_are_released_per_store() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut a = Store::new(&engine, Ctx::new(50));
    let mut b = Store::new(&engine, Ctx::new(50));
    let module = guest::print_once()?;
    let main_a = instantiate_main(&mut a, &module)?;
    let main_b = instantiate_main(&mut b, &module)?;

    let mut call_a = main_a.call_async(&mut a, &[Val::I32(1)]);
    let mut call_b = main_b.call_async(&mut b, &[Val::I32(2)]);
    assert!(!call_a.poll());
    assert!(!call_b.poll());
    assert_eq!(engine.live_fiber_stacks(), 2);
    drop(call_a);
    drop(call_b);
    assert_eq!(a.data().cleanups() + b.data().cleanups(), 2);
    drop(a);
    assert_eq!(engine.live_fiber_stacks(), 1);
    drop(b);
    assert_eq!(engine.live_fiber_stacks(), 0);
    Ok(())
}
