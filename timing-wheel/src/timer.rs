//! The schedulable unit of deferred work.
//!
//! A [`Timer`] is a period, a [`Repeat`] policy and an opaque token.  The
//! token is handed back to a [`TimerHandler`] each time the timer fires; it
//! is usually an index into some arena owned by the caller, so a timer never
//! holds a reference back into the thing that registered it.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Repeat
// ---------------------------------------------------------------------------

/// What happens to a timer after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Fire exactly once, then go idle.
    Never,
    /// Fire, then rearm this many more times.
    Times(u32),
    /// Rearm after every fire until cancelled or the wheel stops.
    Forever,
}

impl From<i64> for Repeat {
    /// Maps a signed repeat count: `0` fires once, `N > 0` rearms `N` more
    /// times, and any negative count rearms indefinitely.
    fn from(count: i64) -> Self {
        match count {
            0 => Repeat::Never,
            n if n < 0 => Repeat::Forever,
            n => Repeat::Times(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// A unit of deferred work scheduled on a [`crate::TimingWheel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer<T> {
    /// Value passed to the handler on every fire.
    pub token: T,
    /// Delay before the first fire, and between subsequent fires.
    pub period: Duration,
    /// Remaining repeat policy; updated in place as the timer rearms.
    pub repeat: Repeat,
}

impl<T> Timer<T> {
    /// A timer that fires once after `delay`.
    pub fn once(token: T, delay: Duration) -> Self {
        Self {
            token,
            period: delay,
            repeat: Repeat::Never,
        }
    }

    /// A timer that fires every `period`, rearming according to `repeat`.
    pub fn periodic(token: T, period: Duration, repeat: impl Into<Repeat>) -> Self {
        Self {
            token,
            period,
            repeat: repeat.into(),
        }
    }

    /// Consume one repetition after a fire.
    ///
    /// Returns `true` when the timer must be reinserted.
    pub(crate) fn after_fire(&mut self) -> bool {
        match self.repeat {
            Repeat::Never | Repeat::Times(0) => false,
            Repeat::Times(n) => {
                self.repeat = if n <= 1 { Repeat::Never } else { Repeat::Times(n - 1) };
                true
            }
            Repeat::Forever => true,
        }
    }
}

// ---------------------------------------------------------------------------
// TimerId
// ---------------------------------------------------------------------------

/// Handle to a pending timer.
///
/// Ids are generation-checked: once the timer fires for the last time or is
/// cancelled, its id stops matching and every operation on it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

// ---------------------------------------------------------------------------
// TimerHandler
// ---------------------------------------------------------------------------

/// Callback contract invoked synchronously for every fired timer.
///
/// Implementations must not block: a slow handler delays every later timer
/// in the same tick and the advancement of the wheel itself.
pub trait TimerHandler<T> {
    fn on_timer(&mut self, token: &T);
}

impl<T, F> TimerHandler<T> for F
where
    F: FnMut(&T),
{
    fn on_timer(&mut self, token: &T) {
        self(token)
    }
}
