//! Integration tests for the timing wheel.
//!
//! The synchronous tests drive [`TimingWheel::tick`] by hand so every fire
//! can be pinned to an exact tick.  The async tests run the real
//! [`TimingWheel::start`] loop on tokio's paused clock.

use std::cell::RefCell;
use std::time::Duration;

use timing_wheel::{Repeat, Timer, TimingWheel, WheelError};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Tick `wheel` `n` times, returning the tokens fired on each tick.
fn run_ticks(wheel: &mut TimingWheel<&'static str>, n: usize) -> Vec<Vec<&'static str>> {
    (0..n)
        .map(|_| {
            let mut fired = Vec::new();
            wheel.tick(&mut |t: &&'static str| fired.push(*t));
            fired
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[test]
fn delay_three_fires_once_after_three_ticks() {
    let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
    assert_eq!(wheel.position(), 0);
    wheel
        .add_timer(Timer::once("t", ms(3)), &mut |_: &&str| {})
        .unwrap();

    let ticks = run_ticks(&mut wheel, 3);
    assert!(ticks[0].is_empty());
    assert!(ticks[1].is_empty());
    assert_eq!(ticks[2], vec!["t"]);
    assert_eq!(wheel.position(), 3);

    // Nothing else ever fires.
    let later = run_ticks(&mut wheel, 16);
    assert!(later.iter().all(Vec::is_empty));
    assert!(wheel.is_empty());
}

#[test]
fn fires_on_floor_of_delay_over_interval() {
    for delay_ms in [10u64, 15, 19, 20, 29, 70] {
        let mut wheel = TimingWheel::new(ms(10), 8).unwrap();
        wheel
            .add_timer(Timer::once("x", ms(delay_ms)), &mut |_: &&str| {})
            .unwrap();
        let expected_tick = (delay_ms / 10) as usize;
        let ticks = run_ticks(&mut wheel, 8);
        for (i, fired) in ticks.iter().enumerate() {
            if i + 1 == expected_tick {
                assert_eq!(fired, &vec!["x"], "delay {delay_ms}ms");
            } else {
                assert!(fired.is_empty(), "delay {delay_ms}ms fired early/late on tick {}", i + 1);
            }
        }
    }
}

#[test]
fn zero_delay_fires_inline() {
    let mut wheel = TimingWheel::new(ms(10), 8).unwrap();
    let mut fired = 0;
    let id = wheel
        .add_timer(Timer::once("now", ms(9)), &mut |_: &&str| fired += 1)
        .unwrap();
    assert_eq!(fired, 1);
    // One-shot timers go idle after firing.
    assert!(!wheel.is_pending(id));
    assert!(wheel.is_empty());
}

#[test]
fn zero_delay_periodic_fires_inline_then_rearms() {
    let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
    let mut inline = 0;
    let id = wheel
        .add_timer(
            Timer::periodic("p", Duration::ZERO, Repeat::Times(2)),
            &mut |_: &&str| inline += 1,
        )
        .unwrap();
    assert_eq!(inline, 1);
    assert!(wheel.is_pending(id));

    let ticks = run_ticks(&mut wheel, 4);
    assert_eq!(ticks.iter().map(Vec::len).sum::<usize>(), 2);
    assert!(!wheel.is_pending(id));
}

#[test]
fn same_bucket_fires_in_insertion_order() {
    let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
    for token in ["a", "b", "c"] {
        wheel
            .add_timer(Timer::once(token, ms(2)), &mut |_: &&str| {})
            .unwrap();
    }
    let ticks = run_ticks(&mut wheel, 2);
    assert_eq!(ticks[1], vec!["a", "b", "c"]);
}

#[test]
fn buckets_fire_in_wheel_order() {
    let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
    wheel
        .add_timer(Timer::once("late", ms(5)), &mut |_: &&str| {})
        .unwrap();
    wheel
        .add_timer(Timer::once("early", ms(1)), &mut |_: &&str| {})
        .unwrap();
    let order: Vec<_> = run_ticks(&mut wheel, 5).into_iter().flatten().collect();
    assert_eq!(order, vec!["early", "late"]);
}

// ---------------------------------------------------------------------------
// Repeat policy
// ---------------------------------------------------------------------------

#[test]
fn periodic_with_n_repeats_fires_n_plus_one_times() {
    for n in 0..5u32 {
        let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
        let id = wheel
            .add_timer(Timer::periodic("p", ms(2), Repeat::Times(n)), &mut |_: &&str| {})
            .unwrap();
        let total: usize = run_ticks(&mut wheel, 64).iter().map(Vec::len).sum();
        assert_eq!(total, n as usize + 1, "repeat count {n}");
        assert!(!wheel.is_pending(id));
    }
}

#[test]
fn zero_times_fires_exactly_once() {
    let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
    let id = wheel
        .add_timer(Timer::periodic(1u8, ms(2), Repeat::Times(0)), &mut |_: &u8| {})
        .unwrap();
    let mut fired = 0;
    for _ in 0..8 {
        wheel.tick(&mut |_: &u8| fired += 1);
    }
    assert_eq!(fired, 1);
    assert!(!wheel.is_pending(id));
    assert!(wheel.is_empty());
}

#[test]
fn negative_repeat_count_fires_until_cancelled() {
    let mut wheel = TimingWheel::new(ms(1), 8).unwrap();
    let id = wheel
        .add_timer(Timer::periodic("keepalive", ms(3), -1), &mut |_: &&str| {})
        .unwrap();

    let fired: usize = run_ticks(&mut wheel, 30).iter().map(Vec::len).sum();
    assert_eq!(fired, 10);
    assert!(wheel.is_pending(id));

    assert!(wheel.cancel(id).is_some());
    let after: usize = run_ticks(&mut wheel, 30).iter().map(Vec::len).sum();
    assert_eq!(after, 0);
}

#[test]
fn periodic_keeps_its_spacing_across_wraps() {
    let mut wheel = TimingWheel::new(ms(1), 5).unwrap();
    wheel
        .add_timer(Timer::periodic("p", ms(3), Repeat::Forever), &mut |_: &&str| {})
        .unwrap();
    let ticks = run_ticks(&mut wheel, 12);
    let fired_on: Vec<usize> = ticks
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.is_empty())
        .map(|(i, _)| i + 1)
        .collect();
    assert_eq!(fired_on, vec![3, 6, 9, 12]);
}

// ---------------------------------------------------------------------------
// Overflow
// ---------------------------------------------------------------------------

#[test]
fn delay_beyond_capacity_is_rejected() {
    let mut wheel = TimingWheel::new(ms(10), 8).unwrap();
    assert_eq!(wheel.capacity(), ms(80));

    for delay in [ms(81), ms(90), ms(1_000), Duration::from_secs(3600)] {
        let err = wheel
            .add_timer(Timer::once("big", delay), &mut |_: &&str| {})
            .unwrap_err();
        assert_eq!(
            err,
            WheelError::Overflow {
                delay,
                capacity: ms(80)
            }
        );
    }
    assert!(wheel.is_empty());

    // Exactly one revolution is still representable.
    assert!(wheel
        .add_timer(Timer::once("edge", ms(80)), &mut |_: &&str| {})
        .is_ok());
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

#[test]
fn stop_is_idempotent() {
    let wheel = TimingWheel::<()>::new(ms(1), 4).unwrap();
    let handle = wheel.stop_handle();
    assert!(!wheel.is_stopped());
    assert!(!handle.stop());
    assert!(handle.stop());
    assert!(wheel.stop());
    assert!(wheel.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn start_ticks_until_stopped() {
    let mut wheel = TimingWheel::new(ms(10), 8).unwrap();
    let fired = RefCell::new(Vec::new());
    wheel
        .add_timer(Timer::once("two", ms(20)), &mut |_: &&str| {})
        .unwrap();
    wheel
        .add_timer(Timer::periodic("every", ms(10), -1), &mut |_: &&str| {})
        .unwrap();

    let stop = wheel.stop_handle();
    let mut handler = |t: &&'static str| fired.borrow_mut().push(*t);
    tokio::join!(wheel.start(&mut handler), async {
        tokio::time::sleep(ms(35)).await;
        assert!(!stop.stop());
    });

    assert_eq!(wheel.position(), 3);
    assert_eq!(
        fired.into_inner(),
        vec!["every", "two", "every", "every"]
    );
}

#[tokio::test(start_paused = true)]
async fn start_after_stop_returns_immediately() {
    let mut wheel = TimingWheel::new(ms(10), 8).unwrap();
    let mut fired = 0;
    wheel
        .add_timer(Timer::periodic((), ms(10), -1), &mut |_: &()| {})
        .unwrap();
    assert!(!wheel.stop());
    wheel.start(&mut |_: &()| fired += 1).await;
    assert_eq!(fired, 0);
    assert_eq!(wheel.position(), 0);
}
