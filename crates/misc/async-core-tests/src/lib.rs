use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

pub mod guest;
pub mod print_host;
pub mod ready_host;
pub mod util;

/// Store data shared by the host functions in this crate.
pub struct Ctx {
    /// Values passed to `host::print`, in completion order.
    pub printed: Vec<i32>,
    /// How many polls a `host::print` continuation needs before it is done.
    pub print_polls: usize,
    /// Bumped every time a continuation created here is dropped.
    pub cleanups: Arc<AtomicUsize>,
    /// `None` once `host::when-ready` may complete; otherwise the wakers of
    /// the continuations waiting for it.
    pub wakers: Arc<Mutex<Option<Vec<Waker>>>>,
}

impl Ctx {
    pub fn new(print_polls: usize) -> Ctx {
        Ctx {
            printed: Vec::new(),
            print_polls,
            cleanups: Arc::new(AtomicUsize::new(0)),
            wakers: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl Default for Ctx {
    fn default() -> Ctx {
        Ctx::new(5)
    }
}
