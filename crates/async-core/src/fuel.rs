//! Fuel accounting for a store.
//!
//! Fuel is tracked the same way generated code would see it: an "injected"
//! counter which starts at the negated amount of active fuel and counts up
//! as guest code runs, plus a reserve holding whatever did not fit in the
//! active slice. Guest code is out of fuel once the injected counter turns
//! positive.

use core::num::NonZeroU64;
use core::time::Duration;

/// What a store does once its fuel is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutOfFuel {
    /// Terminate the call with [`Trap::OutOfFuel`](crate::Trap::OutOfFuel).
    Trap,
    /// Suspend the asynchronous call, inject `quantum` units of fuel, and
    /// let the driver resume it once at least `backoff` has elapsed.
    Yield {
        /// Fuel injected every time the store runs dry.
        quantum: NonZeroU64,
        /// Advisory delay before the call is resumed.
        backoff: Duration,
    },
}

/// The fuel state of one store.
#[derive(Debug)]
pub(crate) struct FuelMeter {
    injected: i64,
    reserve: u64,
    yield_interval: Option<NonZeroU64>,
    consumed: u64,
    pub(crate) policy: OutOfFuel,
}

impl FuelMeter {
    pub(crate) fn new() -> FuelMeter {
        FuelMeter {
            injected: 0,
            reserve: 0,
            yield_interval: None,
            consumed: 0,
            policy: OutOfFuel::Trap,
        }
    }

    /// Remaining fuel, active slice plus reserve.
    pub(crate) fn get(&self) -> u64 {
        self.reserve.saturating_add_signed(-self.injected)
    }

    /// Replaces the remaining fuel with `fuel`, split between the active
    /// slice and the reserve according to the yield interval.
    pub(crate) fn set(&mut self, fuel: u64) {
        let slice = self
            .yield_interval
            .map_or(fuel, |interval| fuel.min(interval.get()))
            .min(i64::MAX as u64);
        self.reserve = fuel - slice;
        // Guest code counts upwards towards zero.
        self.injected = -(slice as i64);
    }

    /// Total fuel charged to this meter so far.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    pub(crate) fn yield_interval(&self) -> Option<NonZeroU64> {
        self.yield_interval
    }

    pub(crate) fn set_yield_interval(&mut self, interval: Option<NonZeroU64>) {
        self.yield_interval = interval;
        self.set(self.get());
    }

    /// Charges `amount` units of fuel.
    pub(crate) fn consume(&mut self, amount: u64) {
        self.consumed = self.consumed.saturating_add(amount);
        let amount = i64::try_from(amount).unwrap_or(i64::MAX);
        self.injected = self.injected.saturating_add(amount);
    }

    /// Whether guest code has run past the end of its active fuel.
    pub(crate) fn exhausted(&self) -> bool {
        self.injected > 0
    }

    /// Moves the next slice of fuel out of the reserve, charging any
    /// overshoot of the current slice against it. Returns `false` if
    /// nothing is left.
    pub(crate) fn refuel(&mut self) -> bool {
        match self.get() {
            0 => false,
            fuel => {
                self.set(fuel);
                true
            }
        }
    }

    /// Adds `amount` units on top of whatever is left, charging any
    /// overshoot of the previous slice against the new fuel.
    pub(crate) fn inject(&mut self, amount: u64) {
        let total = i128::from(self.reserve) - i128::from(self.injected) + i128::from(amount);
        self.set(u64::try_from(total.max(0)).unwrap_or(u64::MAX));
    }
}
