//! The timing wheel and its run loop.
//!
//! # Placement
//!
//! A timer with period `d` on a wheel with tick interval `i` needs
//! `ticks = floor(d / i)` ticks.  With the cursor at `pos` it is appended to
//! bucket `(pos + ticks - 1) % size`, which the tick loop captures exactly
//! `ticks` ticks later.  `ticks == 0` fires inline inside
//! [`TimingWheel::add_timer`].  Delays above `size * i` cannot be represented
//! and are rejected with [`WheelError::Overflow`].
//!
//! # Rearming
//!
//! After a fire the timer's [`Repeat`] decides: `Never` releases the slot
//! (the id goes stale), `Times(n)` reinserts and counts down, `Forever`
//! reinserts unchanged.  A rearm always lands at least one tick ahead, so a
//! sub-interval period cannot spin inside a single tick.
//!
//! [`Repeat`]: crate::Repeat

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

use crate::timer::{Timer, TimerHandler, TimerId};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by wheel construction and timer registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WheelError {
    /// The requested delay is longer than one full revolution.
    #[error("timer delay {delay:?} overflows the wheel capacity of {capacity:?}")]
    Overflow { delay: Duration, capacity: Duration },
    #[error("tick interval must be non-zero")]
    ZeroInterval,
    #[error("wheel must have at least one bucket")]
    NoBuckets,
}

// ---------------------------------------------------------------------------
// Slot storage
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    timer: Option<Timer<T>>,
}

// ---------------------------------------------------------------------------
// StopHandle
// ---------------------------------------------------------------------------

/// Cloneable handle that stops a running [`TimingWheel::start`] loop.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// Request the loop to stop.
    ///
    /// Returns `true` when the wheel had already been stopped.
    pub fn stop(&self) -> bool {
        self.0.send_replace(true)
    }
}

// ---------------------------------------------------------------------------
// TimingWheel
// ---------------------------------------------------------------------------

/// Fixed-size circular array of timer buckets advanced by a periodic tick.
///
/// If you make a one second interval for a whole day (86 400 buckets) you pay
/// for the empty buckets up front, so size the wheel to the longest delay you
/// actually schedule.
#[derive(Debug)]
pub struct TimingWheel<T> {
    interval: Duration,
    buckets: Vec<Vec<TimerId>>,
    pos: usize,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    pending: usize,
    stop: Arc<watch::Sender<bool>>,
}

impl<T> TimingWheel<T> {
    /// Build a wheel of `wheel_size` buckets, one per `interval`.
    pub fn new(interval: Duration, wheel_size: usize) -> Result<Self, WheelError> {
        if interval.is_zero() {
            return Err(WheelError::ZeroInterval);
        }
        if wheel_size == 0 {
            return Err(WheelError::NoBuckets);
        }
        let (stop, _) = watch::channel(false);
        Ok(Self {
            interval,
            buckets: (0..wheel_size).map(|_| Vec::new()).collect(),
            pos: 0,
            slots: Vec::new(),
            free: Vec::new(),
            pending: 0,
            stop: Arc::new(stop),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of buckets.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket index the cursor currently points at.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Longest delay a timer may request.
    pub fn capacity(&self) -> Duration {
        let size = u32::try_from(self.buckets.len()).unwrap_or(u32::MAX);
        self.interval.saturating_mul(size)
    }

    /// Number of timers currently scheduled.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// `true` while `id` still refers to a scheduled timer.
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.slots
            .get(id.slot as usize)
            .is_some_and(|s| s.generation == id.generation && s.timer.is_some())
    }

    /// Schedule `timer`.
    ///
    /// A zero-tick delay fires `handler` before this call returns and is then
    /// rearmed like any other fired timer.  The returned id may therefore
    /// already be stale for a one-shot timer.
    pub fn add_timer<H>(&mut self, timer: Timer<T>, handler: &mut H) -> Result<TimerId, WheelError>
    where
        H: TimerHandler<T>,
    {
        let ticks = match self.ticks_for(timer.period) {
            Ok(ticks) => ticks,
            Err(err) => {
                log::error!("[wheel] rejecting timer: {err}");
                return Err(err);
            }
        };
        let id = self.store(timer);
        if ticks == 0 {
            self.fire(id, handler);
        } else {
            self.place(id, ticks);
        }
        Ok(id)
    }

    /// Remove a pending timer, returning it if `id` was still live.
    pub fn cancel(&mut self, id: TimerId) -> Option<Timer<T>> {
        if !self.is_pending(id) {
            return None;
        }
        self.release(id.slot)
    }

    /// Advance the wheel by one tick.
    ///
    /// Captures the bucket under the cursor, advances the cursor, then fires
    /// the captured timers in the order they were inserted.
    pub fn tick<H>(&mut self, handler: &mut H)
    where
        H: TimerHandler<T>,
    {
        let pos = self.pos;
        let mut expired = std::mem::take(&mut self.buckets[pos]);
        self.pos = (pos + 1) % self.buckets.len();

        for id in &expired {
            self.fire(*id, handler);
        }

        // Hand the allocation back unless a full-revolution rearm refilled it.
        expired.clear();
        if self.buckets[pos].is_empty() {
            self.buckets[pos] = expired;
        }
    }

    /// Handle that can stop [`start`](Self::start) from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Stop the run loop.  Returns `true` when it was already stopped.
    pub fn stop(&self) -> bool {
        self.stop.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Tick every `interval` until stopped.
    ///
    /// A stopped wheel stays stopped: calling `start` afterwards returns
    /// immediately.
    pub async fn start<H>(&mut self, handler: &mut H)
    where
        H: TimerHandler<T>,
    {
        let mut stopped = self.stop.subscribe();
        if *stopped.borrow_and_update() {
            log::debug!("[wheel] start requested on a stopped wheel");
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        log::debug!(
            "[wheel] started: interval={:?} size={}",
            self.interval,
            self.buckets.len()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(handler),
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("[wheel] stopped at pos={}", self.pos);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ticks_for(&self, delay: Duration) -> Result<usize, WheelError> {
        let capacity = self.capacity();
        if delay > capacity {
            return Err(WheelError::Overflow { delay, capacity });
        }
        Ok(ticks_between(delay, self.interval))
    }

    fn store(&mut self, timer: Timer<T>) -> TimerId {
        self.pending += 1;
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.timer = Some(timer);
                TimerId {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    timer: Some(timer),
                });
                TimerId {
                    slot,
                    generation: 0,
                }
            }
        }
    }

    fn place(&mut self, id: TimerId, ticks: usize) {
        let bucket = (self.pos + ticks.max(1) - 1) % self.buckets.len();
        self.buckets[bucket].push(id);
    }

    fn release(&mut self, slot: u32) -> Option<Timer<T>> {
        let entry = self.slots.get_mut(slot as usize)?;
        let timer = entry.timer.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        self.pending -= 1;
        Some(timer)
    }

    /// Invoke the handler for `id` and apply its rearm policy.
    ///
    /// Stale ids (cancelled, or slot reused) are skipped silently.
    fn fire<H>(&mut self, id: TimerId, handler: &mut H)
    where
        H: TimerHandler<T>,
    {
        let interval = self.interval;
        let rearm = match self.slots.get_mut(id.slot as usize) {
            Some(slot) if slot.generation == id.generation => match slot.timer.as_mut() {
                Some(timer) => {
                    handler.on_timer(&timer.token);
                    timer
                        .after_fire()
                        .then(|| ticks_between(timer.period, interval))
                }
                None => return,
            },
            _ => return,
        };

        match rearm {
            Some(ticks) => self.place(id, ticks),
            None => {
                self.release(id.slot);
            }
        }
    }
}

fn ticks_between(delay: Duration, interval: Duration) -> usize {
    usize::try_from(delay.as_nanos() / interval.as_nanos()).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::Repeat;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn wheel(size: usize) -> TimingWheel<u32> {
        TimingWheel::new(ms(1), size).unwrap()
    }

    #[test]
    fn rejects_bad_geometry() {
        assert_eq!(
            TimingWheel::<u32>::new(Duration::ZERO, 8).unwrap_err(),
            WheelError::ZeroInterval
        );
        assert_eq!(
            TimingWheel::<u32>::new(ms(1), 0).unwrap_err(),
            WheelError::NoBuckets
        );
    }

    #[test]
    fn placement_lands_ticks_ahead() {
        let mut w = wheel(8);
        let id = w.add_timer(Timer::once(1, ms(3)), &mut |_: &u32| {}).unwrap();
        assert!(w.buckets[2].contains(&id));
    }

    #[test]
    fn placement_wraps_around_the_cursor() {
        let mut w = wheel(8);
        for _ in 0..6 {
            w.tick(&mut |_: &u32| {});
        }
        assert_eq!(w.position(), 6);
        let id = w.add_timer(Timer::once(1, ms(4)), &mut |_: &u32| {}).unwrap();
        // 6 + 4 - 1 = 9 -> bucket 1
        assert!(w.buckets[1].contains(&id));
    }

    #[test]
    fn cancelled_id_is_inert() {
        let mut w = wheel(8);
        let mut fired = 0;
        let id = w.add_timer(Timer::once(1, ms(2)), &mut |_: &u32| {}).unwrap();
        assert!(w.cancel(id).is_some());
        assert!(w.cancel(id).is_none());
        assert!(!w.is_pending(id));
        for _ in 0..8 {
            w.tick(&mut |_: &u32| fired += 1);
        }
        assert_eq!(fired, 0);
        assert!(w.is_empty());
    }

    #[test]
    fn recycled_slot_does_not_fire_stale_entry() {
        let mut w = wheel(8);
        let stale = w.add_timer(Timer::once(1, ms(2)), &mut |_: &u32| {}).unwrap();
        w.cancel(stale);
        // Reuses the same slot with a new generation, in a later bucket.
        let fresh = w.add_timer(Timer::once(2, ms(5)), &mut |_: &u32| {}).unwrap();
        assert_eq!(fresh.slot, stale.slot);
        assert_ne!(fresh.generation, stale.generation);

        let mut fired = Vec::new();
        for _ in 0..5 {
            w.tick(&mut |t: &u32| fired.push(*t));
        }
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn full_revolution_delay_fires_after_size_ticks() {
        let mut w = wheel(4);
        let mut fired_at = None;
        w.add_timer(Timer::once(7, ms(4)), &mut |_: &u32| {}).unwrap();
        for tick in 1..=4 {
            w.tick(&mut |_: &u32| fired_at = Some(tick));
        }
        assert_eq!(fired_at, Some(4));
    }

    #[test]
    fn full_revolution_period_rearms_into_captured_bucket() {
        let mut w = wheel(4);
        let mut fires = 0;
        w.add_timer(
            Timer::periodic(1, ms(4), Repeat::Times(1)),
            &mut |_: &u32| {},
        )
        .unwrap();
        for _ in 0..8 {
            w.tick(&mut |_: &u32| fires += 1);
        }
        assert_eq!(fires, 2);
        assert!(w.is_empty());
    }

    #[test]
    fn sub_interval_forever_timer_rearms_one_tick_ahead() {
        let mut w = TimingWheel::new(ms(10), 4).unwrap();
        let mut fires = 0;
        // Fires inline once, then once per tick.
        w.add_timer(
            Timer::periodic(0u32, ms(3), Repeat::Forever),
            &mut |_: &u32| fires += 1,
        )
        .unwrap();
        assert_eq!(fires, 1);
        for _ in 0..3 {
            w.tick(&mut |_: &u32| fires += 1);
        }
        assert_eq!(fires, 4);
        assert_eq!(w.len(), 1);
    }
}
