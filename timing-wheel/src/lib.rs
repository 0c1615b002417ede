//! `timing-wheel` — a bucketed, tick-advanced scheduler for many delayed
//! callbacks with constant work per tick.
//!
//! # Architecture
//!
//! ```text
//!            pos
//!             │
//!  ┌────┬────┬▼───┬────┬────┬────┬────┬────┐
//!  │ b0 │ b1 │ b2 │ b3 │ b4 │ b5 │ b6 │ b7 │   buckets (Vec<TimerId>)
//!  └────┴────┴────┴────┴────┴────┴────┴────┘
//!                   │
//!                   ▼
//!             ┌───────────┐
//!             │   slots   │  generation-checked timer storage
//!             └───────────┘
//! ```
//!
//! Every tick captures the bucket under the cursor, advances the cursor and
//! fires the captured timers in insertion order.  Buckets only hold
//! [`TimerId`]s; the timers themselves live in a slot table whose generation
//! counters make cancelled or recycled ids inert.
//!
//! A wheel is confined to one worker: [`TimingWheel::add_timer`] and
//! [`TimingWheel::tick`] both take `&mut self`, and [`TimingWheel::start`]
//! holds that borrow for as long as the loop runs.  Only [`StopHandle`]
//! crosses tasks.
//!
//! - [`timer`] — the schedulable unit and its repeat policy
//! - [`wheel`] — the wheel itself, its run loop and stop handle

pub mod timer;
pub mod wheel;

pub use timer::{Repeat, Timer, TimerHandler, TimerId};
pub use wheel::{StopHandle, TimingWheel, WheelError};
