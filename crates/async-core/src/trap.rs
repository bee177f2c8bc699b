use core::fmt;

/// Description of a trap which can happen while guest code executes.
///
/// Traps are carried inside [`anyhow::Error`] values and can be recovered
/// with `error.downcast_ref::<Trap>()`. Additional context, such as the
/// message of a panicking host function, is attached with
/// [`anyhow::Context`] and does not interfere with the downcast.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Trap {
    /// The guest call stack exceeded `Config::max_call_depth`.
    StackOverflow,

    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,

    /// An integer division by zero.
    IntegerDivisionByZero,

    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,

    /// Execution was interrupted because the epoch deadline was reached.
    Interrupt,

    /// When fuel is enabled, the guest ran out of fuel and the store is not
    /// configured to yield.
    OutOfFuel,

    /// A host function, or the continuation it returned, panicked.
    HostPanic,

    /// The continuation of an asynchronous host function reported an error.
    HostError,
}

impl Trap {
    /// Returns `true` for traps which signal that a metered resource (fuel
    /// or stack) ran out rather than a fault in the guest itself.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Trap::OutOfFuel | Trap::StackOverflow)
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Trap::*;

        let desc = match self {
            StackOverflow => "call stack exhausted",
            IntegerOverflow => "integer overflow",
            IntegerDivisionByZero => "integer divide by zero",
            UnreachableCodeReached => "wasm `unreachable` instruction executed",
            Interrupt => "interrupt",
            OutOfFuel => "all fuel consumed by WebAssembly",
            HostPanic => "host function panicked",
            HostError => "host function failed",
        };
        write!(f, "wasm trap: {desc}")
    }
}

impl std::error::Error for Trap {}

/// Renders the payload of a caught panic for use as error context.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
