use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use wasmtime_async_core::{Caller, FuncType, HostContinuation, Linker, Val, ValType};

use super::Ctx;

/// Defines `host::print: (i32) -> ()`.
///
/// Every call returns a continuation which is done on its
/// [`Ctx::print_polls`]th poll, at which point the argument is appended to
/// [`Ctx::printed`].
pub fn add_to_linker(linker: &mut Linker<Ctx>) -> Result<()> {
    linker.func_new_async(
        "host",
        "print",
        FuncType::new([ValType::I32], []),
        |caller, params| {
            let print: Box<dyn HostContinuation<Ctx>> = Box::new(Print {
                value: params[0].unwrap_i32(),
                polls: 0,
                ready_after: caller.data().print_polls,
                cleanups: caller.data().cleanups.clone(),
            });
            Ok(print)
        },
    )?;
    Ok(())
}

struct Print {
    value: i32,
    polls: usize,
    ready_after: usize,
    cleanups: Arc<AtomicUsize>,
}

impl HostContinuation<Ctx> for Print {
    fn poll(&mut self, mut caller: Caller<'_, Ctx>, cx: &mut Context<'_>) -> Poll<Result<Vec<Val>>> {
        self.polls += 1;
        if self.polls < self.ready_after {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        caller.data_mut().printed.push(self.value);
        Poll::Ready(Ok(Vec::new()))
    }
}

impl Drop for Print {
    fn drop(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
