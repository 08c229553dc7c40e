// Copyright 2018-2025 the Deno authors. MIT license.

//! Timer scheduling core for a JavaScript runtime event loop.
//!
//! Implements the native half of `setTimeout` / `setInterval` /
//! `setImmediate` (with `clear*`, `ref`/`unref`, `refresh`, `_destroyed`)
//! plus a generic scheduled-timer facility for runtime subsystems: DNS
//! resolution, database connection timeouts, GC runloop timers, file
//! watchers. The JavaScript engine and the native event loop stay behind the
//! [`JsEngine`] and [`EventLoopDriver`] seams, so the whole core runs under
//! tests on a manual clock.
//!
//! One [`TimerScheduler`] exists per event loop. Any thread may schedule or
//! cancel timers; only the event-loop thread dispatches callbacks, via
//! [`TimerScheduler::drain_timers`], [`TimerScheduler::drain_immediates`],
//! and [`TimerScheduler::fire_imminent`], and feeds the loop's wait with
//! [`TimerScheduler::get_timeout`].

mod host;
mod ids;
mod js_timers;
mod runloop;
mod scheduler;
mod store;
pub mod testing;
mod time;
mod timer;

pub use host::EventLoopDriver;
pub use host::JsEngine;
pub use host::NoopDriver;
pub use ids::parse_canonical_id;
pub use ids::TimerId;
pub use ids::TimerKind;
pub use js_timers::IllegalConstructor;
pub use js_timers::ImmediateObject;
pub use js_timers::JsTimer;
pub use js_timers::TimeoutObject;
pub use runloop::RunloopTimer;
pub use scheduler::TimerScheduler;
pub use scheduler::TimersOptions;
pub use time::Clock;
pub use time::MonotonicClock;
pub use time::Time;
pub use timer::EventLoopTimer;
pub use timer::FireDecision;
pub use timer::ScheduledTimer;
pub use timer::SubsystemTimer;
pub use timer::TimerState;
