use std::ops::DerefMut;
use std::sync::Mutex;
use std::task::{Poll, Waker};

use anyhow::Result;
use futures::future;
use wasmtime_async_core::{FuncType, Linker};

use super::Ctx;

/// Defines `host::when-ready: () -> ()`, which completes once
/// [`set_ready`] has been called with `true` on the store's
/// [`Ctx::wakers`].
pub fn add_to_linker(linker: &mut Linker<Ctx>) -> Result<()> {
    linker.func_wrap_async(
        "host",
        "when-ready",
        FuncType::new([], []),
        |caller, _params| {
            let wakers = caller.data().wakers.clone();
            async move {
                future::poll_fn(move |cx| {
                    let mut wakers = wakers.lock().unwrap();
                    if let Some(wakers) = wakers.deref_mut() {
                        wakers.push(cx.waker().clone());
                        Poll::Pending
                    } else {
                        Poll::Ready(())
                    }
                })
                .await;
                Ok(Vec::new())
            }
        },
    )?;
    Ok(())
}

pub fn set_ready(wakers: &Mutex<Option<Vec<Waker>>>, ready: bool) {
    let mut wakers = wakers.lock().unwrap();
    if ready {
        if let Some(wakers) = wakers.take() {
            for waker in wakers {
                waker.wake();
            }
        }
    } else if wakers.is_none() {
        *wakers = Some(Vec::new());
    }
}
