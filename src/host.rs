// Copyright 2018-2025 the Deno authors. MIT license.

//! The seams between the timer core and its host runtime.
//!
//! [`JsEngine`] is the only interface the core has to the JavaScript engine,
//! and [`EventLoopDriver`] the only one to the native event loop. Everything
//! else in the crate is engine and platform agnostic, which is what makes the
//! scheduler drivable from tests on a manual clock.

use std::time::Duration;

use crate::ids::TimerId;

/// Bridge to the JavaScript engine embedding the scheduler.
///
/// `Value` is an engine value (the callback function, the bound arguments).
/// `Wrapper` is a strong handle to the engine object wrapping a timer;
/// cloning takes another strong reference and dropping releases it, so the
/// core "drops the strong handle" by dropping its `Wrapper`.
pub trait JsEngine: 'static {
  type Value;
  type Wrapper: Clone + Send + 'static;

  /// `ToNumber` coercion, used on the `delay` argument of `setTimeout` and
  /// `setInterval`.
  fn coerce_to_double(&self, value: &Self::Value) -> f64;

  /// Stashes the callback on the wrapper's cached slot.
  fn set_cached_callback(&self, wrapper: &Self::Wrapper, callback: Self::Value);

  /// Stashes the bound arguments on the wrapper's cached slot.
  fn set_cached_arguments(
    &self,
    wrapper: &Self::Wrapper,
    arguments: Self::Value,
  );

  /// Runs the callback stored on `wrapper` with its stored arguments. The
  /// engine catches exceptions and reports unhandled ones; they never unwind
  /// into the scheduler.
  fn invoke_timeout_callback(&self, wrapper: &Self::Wrapper);

  /// False once script execution has been terminated (shutdown or a fatal
  /// error). Due timers stop dispatching and are cancelled instead.
  fn is_script_runnable(&self) -> bool;

  /// Callback dispatch is bracketed by these, so the engine can run its
  /// per-iteration bookkeeping (microtask checkpoints and the like).
  fn enter_event_loop(&self) {}
  fn exit_event_loop(&self) {}

  // Inspector notifications. `TimerId::async_id` is the 64-bit correlation
  // value on the protocol.
  fn did_schedule_async_call(&self, _id: TimerId, _single_shot: bool) {}
  fn will_dispatch_async_call(&self, _id: TimerId) {}
  fn did_dispatch_async_call(&self, _id: TimerId) {}
  fn did_cancel_async_call(&self, _id: TimerId) {}
}

/// Bridge to the native event loop (libuv or an equivalent).
///
/// `ref_loop`/`unref_loop` track whether any referenced JS timer should keep
/// the process alive; calls are already edge-filtered, one per transition of
/// the keep-alive count through zero. The scheduler mutex is never held when
/// a driver method runs, but a timer's own state lock may be (keep-alive
/// flips and cancellations happen under it), so implementations must not
/// call back into the timers from here.
pub trait EventLoopDriver: Send + Sync {
  fn ref_loop(&self);
  fn unref_loop(&self);

  /// Platforms that drive timers through a dedicated native timer handle
  /// (the Windows design) re-aim that handle whenever the store's earliest
  /// deadline may have moved; `due_in` is the time until the earliest
  /// pending timer. Loops that instead query
  /// [`TimerScheduler::get_timeout`](crate::TimerScheduler::get_timeout)
  /// before waiting can ignore this.
  fn refresh_deadline(&self, _due_in: Duration) {}
}

/// Driver for embeddings with no keep-alive notion, such as tests and loops
/// that poll `get_timeout` unconditionally.
#[derive(Debug, Default)]
pub struct NoopDriver;

impl EventLoopDriver for NoopDriver {
  fn ref_loop(&self) {}
  fn unref_loop(&self) {}
}
