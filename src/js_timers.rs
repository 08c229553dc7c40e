// Copyright 2018-2025 the Deno authors. MIT license.

//! The JS-visible timers: `setTimeout`, `setInterval`, `setImmediate` and
//! their wrapper objects.
//!
//! [`TimeoutObject`] and [`ImmediateObject`] are the native halves of the
//! script-facing wrappers; the engine side stays behind [`JsEngine`]. Both
//! embed the shared [`TimerObjectInternals`] state: identity, interval,
//! lifetime flags, and the strong handle to the wrapper.
//!
//! Reference counting is `Arc`: the store entry is the scheduler's reference
//! while a timer is scheduled, the embedder's `Arc` stands for the JS
//! wrapper, and the drain loop's popped handle spans the callback. The
//! strong handle in the other direction (native to wrapper) is dropped
//! deterministically on fire, cancel, or finalize to break the cycle with
//! callbacks that capture the timer.

use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::host::JsEngine;
use crate::ids::parse_canonical_id;
use crate::ids::TimerId;
use crate::ids::TimerKind;
use crate::scheduler::TimerScheduler;
use crate::time::Time;
use crate::timer::EventLoopTimer;
use crate::timer::FireDecision;
use crate::timer::ScheduledTimer;
use crate::timer::TimerState;

/// Script-side `new Timeout(...)` or `new Immediate(...)`. Returned by the
/// [`TimeoutObject::construct_from_script`] and
/// [`ImmediateObject::construct_from_script`] constructor traps; bindings
/// surface it as a `TypeError`.
#[derive(Debug, thiserror::Error)]
#[error("Illegal constructor")]
pub struct IllegalConstructor;

/// ToInt32 on an already-ToNumber'd delay. Non-finite and out-of-range
/// values fall back to 1 ms unless overflow saturation is on.
pub(crate) fn coerce_interval(raw: f64, saturate_overflow: bool) -> i32 {
  if !raw.is_finite() || raw < i32::MIN as f64 || raw > i32::MAX as f64 {
    return if saturate_overflow { i32::MAX } else { 1 };
  }
  raw as i32
}

/// What `setTimeout` hands back: usually a timeout, but the bare zero-delay
/// form is rewritten to an immediate.
pub enum JsTimer<E: JsEngine> {
  Timeout(Arc<TimeoutObject<E>>),
  Immediate(Arc<ImmediateObject<E>>),
}

impl<E: JsEngine> Clone for JsTimer<E> {
  fn clone(&self) -> Self {
    match self {
      JsTimer::Timeout(t) => JsTimer::Timeout(t.clone()),
      JsTimer::Immediate(t) => JsTimer::Immediate(t.clone()),
    }
  }
}

impl<E: JsEngine> JsTimer<E> {
  pub fn id(&self) -> TimerId {
    match self {
      JsTimer::Timeout(t) => t.id(),
      JsTimer::Immediate(t) => t.id(),
    }
  }

  pub fn clear(&self) {
    match self {
      JsTimer::Timeout(t) => t.clear(),
      JsTimer::Immediate(t) => t.clear(),
    }
  }

  pub fn as_timeout(&self) -> Option<&Arc<TimeoutObject<E>>> {
    match self {
      JsTimer::Timeout(t) => Some(t),
      JsTimer::Immediate(_) => None,
    }
  }

  pub fn as_immediate(&self) -> Option<&Arc<ImmediateObject<E>>> {
    match self {
      JsTimer::Timeout(_) => None,
      JsTimer::Immediate(t) => Some(t),
    }
  }
}

/// Weak form of [`JsTimer`] held by the ID maps, so a map entry never
/// extends a timer's lifetime.
pub(crate) enum WeakJsTimer<E: JsEngine> {
  Timeout(Weak<TimeoutObject<E>>),
  Immediate(Weak<ImmediateObject<E>>),
}

impl<E: JsEngine> WeakJsTimer<E> {
  pub(crate) fn upgrade(&self) -> Option<JsTimer<E>> {
    match self {
      WeakJsTimer::Timeout(w) => w.upgrade().map(JsTimer::Timeout),
      WeakJsTimer::Immediate(w) => w.upgrade().map(JsTimer::Immediate),
    }
  }
}

struct InternalsState<E: JsEngine> {
  interval_ms: i32,
  has_cleared_timer: bool,
  /// Latch, not a refcount: flips adjust the scheduler's keep-alive count by
  /// exactly one and double-flips are no-ops.
  is_keeping_event_loop_alive: bool,
  has_accessed_primitive: bool,
  has_js_ref: bool,
  in_callback: bool,
  /// The strong handle to the JS wrapper. `None` once dropped.
  wrapper: Option<E::Wrapper>,
}

/// State shared by [`TimeoutObject`] and [`ImmediateObject`].
pub struct TimerObjectInternals<E: JsEngine> {
  id: TimerId,
  scheduler: Weak<TimerScheduler<E>>,
  state: Mutex<InternalsState<E>>,
}

impl<E: JsEngine> TimerObjectInternals<E> {
  fn new(
    id: TimerId,
    scheduler: Weak<TimerScheduler<E>>,
    wrapper: E::Wrapper,
    interval_ms: i32,
  ) -> TimerObjectInternals<E> {
    TimerObjectInternals {
      id,
      scheduler,
      state: Mutex::new(InternalsState {
        interval_ms,
        has_cleared_timer: false,
        is_keeping_event_loop_alive: false,
        has_accessed_primitive: false,
        has_js_ref: true,
        in_callback: false,
        wrapper: Some(wrapper),
      }),
    }
  }

  fn set_keeping_alive(
    &self,
    scheduler: &TimerScheduler<E>,
    state: &mut InternalsState<E>,
    enable: bool,
  ) {
    if state.is_keeping_event_loop_alive == enable {
      return;
    }
    state.is_keeping_event_loop_alive = enable;
    scheduler.increment_timer_ref(if enable { 1 } else { -1 });
  }

  /// Last-reference teardown: unbind the ID map entry and release any
  /// keep-alive still engaged.
  fn deinit(&mut self) {
    let Some(scheduler) = self.scheduler.upgrade() else {
      return;
    };
    let state = self.state.get_mut();
    if state.has_accessed_primitive {
      scheduler.unregister_id(self.id);
    }
    if state.is_keeping_event_loop_alive {
      state.is_keeping_event_loop_alive = false;
      scheduler.increment_timer_ref(-1);
    }
  }
}

/// Native half of a `setTimeout` or `setInterval` wrapper.
pub struct TimeoutObject<E: JsEngine> {
  weak_self: Weak<TimeoutObject<E>>,
  timer: EventLoopTimer,
  internals: TimerObjectInternals<E>,
}

impl<E: JsEngine> TimeoutObject<E> {
  fn create(
    scheduler: &TimerScheduler<E>,
    engine: &E,
    id: TimerId,
    interval_ms: i32,
    wrapper: E::Wrapper,
    callback: E::Value,
    arguments: Option<E::Value>,
  ) -> Arc<TimeoutObject<E>> {
    engine.set_cached_callback(&wrapper, callback);
    if let Some(arguments) = arguments {
      engine.set_cached_arguments(&wrapper, arguments);
    }
    let timeout = Arc::new_cyclic(|weak_self| TimeoutObject {
      weak_self: weak_self.clone(),
      timer: EventLoopTimer::new(),
      internals: TimerObjectInternals::new(
        id,
        scheduler.weak_self(),
        wrapper,
        interval_ms,
      ),
    });
    timeout.reschedule_at(scheduler, scheduler.now());
    engine.did_schedule_async_call(id, id.kind != TimerKind::Interval);
    timeout
  }

  /// The constructor trap bindings install on the script-visible `Timeout`
  /// class. Always fails: wrappers only come from `setTimeout` and
  /// `setInterval`.
  pub fn construct_from_script() -> Result<Arc<Self>, IllegalConstructor> {
    Err(IllegalConstructor)
  }

  pub fn id(&self) -> TimerId {
    self.internals.id
  }

  pub fn event_loop_timer(&self) -> &EventLoopTimer {
    &self.timer
  }

  /// This timer under its store tag. `None` only mid-destruction, when no
  /// caller can be scheduling it anyway.
  fn scheduled(&self) -> Option<ScheduledTimer<E>> {
    self.weak_self.upgrade().map(ScheduledTimer::Timeout)
  }

  /// Aims the timer `interval` ms past `now` and (re)inserts it. Undoes a
  /// previous clear.
  fn reschedule_at(&self, scheduler: &TimerScheduler<E>, now: Time) {
    let Some(scheduled) = self.scheduled() else {
      return;
    };
    let interval_ms = self.internals.state.lock().interval_ms;
    let new_time = now.add_ms(interval_ms as u64);
    scheduler.update(&scheduled, new_time);
    let mut state = self.internals.state.lock();
    state.has_cleared_timer = false;
    if state.has_js_ref {
      self.internals.set_keeping_alive(scheduler, &mut state, true);
    }
  }

  /// `timeout.refresh()`: restart the countdown from now, reviving the timer
  /// if it already fired or was cleared. Inside its own callback this flips
  /// `Fired` back to `Active` and the rearm path picks it up.
  pub fn refresh(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let now = scheduler.now();
    self.reschedule_at(&scheduler, now);
  }

  pub(crate) fn fire(&self, _now: Time, engine: &E) -> FireDecision {
    // Snapshot identity up front; the callback may release the last wrapper
    // reference and finalize us before this function returns.
    let id = self.internals.id;
    let is_interval = id.kind == TimerKind::Interval;
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return FireDecision::Disarm;
    };

    let mut state = self.internals.state.lock();
    if self.timer.state() == TimerState::Cancelled
      || state.has_cleared_timer
      || !engine.is_script_runnable()
    {
      state.has_cleared_timer = true;
      state.wrapper = None;
      self.internals.set_keeping_alive(&scheduler, &mut state, false);
      drop(state);
      engine.did_cancel_async_call(id);
      return FireDecision::Disarm;
    }

    // Sampled before the callback runs so interval drift is bounded by the
    // callback's duration instead of compounding across ticks.
    let interval_ms = state.interval_ms;
    let time_before_call = scheduler.now().add_ms(interval_ms as u64);

    // Intervals hold their wrapper for the next tick; one-shot timers drop
    // the strong handle now and keep only a local for the call itself.
    let wrapper = if is_interval {
      state.wrapper.clone()
    } else {
      state.wrapper.take()
    };
    let Some(wrapper) = wrapper else {
      // Wrapper already finalized; nothing left to call.
      state.has_cleared_timer = true;
      self.internals.set_keeping_alive(&scheduler, &mut state, false);
      return FireDecision::Disarm;
    };

    state.in_callback = true;
    drop(state);

    engine.enter_event_loop();
    engine.will_dispatch_async_call(id);
    engine.invoke_timeout_callback(&wrapper);
    engine.did_dispatch_async_call(id);

    enum Outcome {
      Rearm,
      StayScheduled,
      Done,
    }
    let outcome = {
      let mut state = self.internals.state.lock();
      state.in_callback = false;
      match (is_interval, self.timer.state()) {
        // Still Fired: a normal interval tick. Active: the callback called
        // refresh(); either way the next tick starts from the pre-callback
        // sample.
        (true, TimerState::Fired | TimerState::Active) => Outcome::Rearm,
        // refresh() from a one-shot callback rescheduled us; stay alive.
        (false, TimerState::Active) => Outcome::StayScheduled,
        _ => Outcome::Done,
      }
    };
    match outcome {
      Outcome::Rearm => {
        if let Some(scheduled) = self.scheduled() {
          scheduler.update(&scheduled, time_before_call);
        }
      }
      Outcome::StayScheduled => {
        // A one-shot revived by refresh() gets its strong handle back so the
        // next fire has a callback to run.
        let mut state = self.internals.state.lock();
        if state.wrapper.is_none() {
          state.wrapper = Some(wrapper);
        }
      }
      Outcome::Done => {
        let mut state = self.internals.state.lock();
        self.internals.set_keeping_alive(&scheduler, &mut state, false);
        state.wrapper = None;
      }
    }
    engine.exit_event_loop();
    FireDecision::Disarm
  }

  /// `clearTimeout` / `clearInterval` / `Symbol.dispose`. Idempotent; during
  /// a callback it completes the current invocation but prevents the rearm.
  pub fn clear(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let mut state = self.internals.state.lock();
    self.internals.set_keeping_alive(&scheduler, &mut state, false);
    state.has_cleared_timer = true;
    match self.scheduled() {
      Some(scheduled) if self.timer.state() == TimerState::Active => {
        // Drops the store's reference.
        scheduler.remove(&scheduled);
      }
      _ => self.timer.set_state(TimerState::Cancelled),
    }
    state.wrapper = None;
  }

  /// `timeout.ref()`. Engages keep-alive only while the timer is live; a
  /// mid-callback `ref()` is healed by the rearm path.
  pub fn ref_timer(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let mut state = self.internals.state.lock();
    if state.has_js_ref {
      return;
    }
    state.has_js_ref = true;
    if !state.has_cleared_timer && self.timer.state() == TimerState::Active {
      self.internals.set_keeping_alive(&scheduler, &mut state, true);
    }
  }

  /// `timeout.unref()`: keep firing, stop keeping the event loop alive.
  pub fn unref_timer(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let mut state = self.internals.state.lock();
    if state.has_js_ref {
      state.has_js_ref = false;
      self.internals.set_keeping_alive(&scheduler, &mut state, false);
    }
  }

  pub fn has_ref(&self) -> bool {
    self.internals.state.lock().has_js_ref
  }

  /// The `_destroyed` property: cleared, or finished and not currently
  /// inside its own callback (during which it is transiently not destroyed).
  pub fn is_destroyed(&self) -> bool {
    let state = self.internals.state.lock();
    state.has_cleared_timer
      || (!state.in_callback
        && matches!(
          self.timer.state(),
          TimerState::Fired | TimerState::Cancelled
        ))
  }

  /// `Symbol.toPrimitive`: the numeric id. The first coercion registers the
  /// `id -> timer` binding so `clearTimeout(Number(timer))` can find it;
  /// timers that are never coerced never pay for the map insertion.
  pub fn to_primitive(&self) -> i32 {
    let mut state = self.internals.state.lock();
    if !state.has_accessed_primitive {
      state.has_accessed_primitive = true;
      if let Some(scheduler) = self.internals.scheduler.upgrade() {
        scheduler.register_id(
          self.internals.id,
          WeakJsTimer::Timeout(self.weak_self.clone()),
        );
      }
    }
    self.internals.id.id
  }

  /// The engine's GC finalizer for the wrapper: drop the strong handle.
  /// Idempotent. The embedding drops its `Arc` afterwards, which runs the
  /// last-reference teardown.
  pub fn finalize(&self) {
    self.internals.state.lock().wrapper = None;
  }
}

impl<E: JsEngine> Drop for TimeoutObject<E> {
  fn drop(&mut self) {
    self.internals.deinit();
  }
}

/// Native half of a `setImmediate` wrapper. Lives on the immediate-task
/// queue, never in the time-ordered store.
pub struct ImmediateObject<E: JsEngine> {
  weak_self: Weak<ImmediateObject<E>>,
  timer: EventLoopTimer,
  internals: TimerObjectInternals<E>,
}

impl<E: JsEngine> ImmediateObject<E> {
  fn create(
    scheduler: &TimerScheduler<E>,
    engine: &E,
    id: TimerId,
    wrapper: E::Wrapper,
    callback: E::Value,
    arguments: Option<E::Value>,
  ) -> Arc<ImmediateObject<E>> {
    engine.set_cached_callback(&wrapper, callback);
    if let Some(arguments) = arguments {
      engine.set_cached_arguments(&wrapper, arguments);
    }
    let immediate = Arc::new_cyclic(|weak_self| ImmediateObject {
      weak_self: weak_self.clone(),
      timer: EventLoopTimer::new(),
      internals: TimerObjectInternals::new(
        id,
        scheduler.weak_self(),
        wrapper,
        0,
      ),
    });
    {
      let mut state = immediate.internals.state.lock();
      immediate
        .internals
        .set_keeping_alive(scheduler, &mut state, true);
    }
    scheduler.enqueue_immediate(immediate.clone());
    engine.did_schedule_async_call(id, true);
    immediate
  }

  /// The constructor trap bindings install on the script-visible `Immediate`
  /// class. Always fails: wrappers only come from `setImmediate`.
  pub fn construct_from_script() -> Result<Arc<Self>, IllegalConstructor> {
    Err(IllegalConstructor)
  }

  pub fn id(&self) -> TimerId {
    self.internals.id
  }

  pub fn event_loop_timer(&self) -> &EventLoopTimer {
    &self.timer
  }

  /// One task off the immediate queue. Cleared entries just release their
  /// resources.
  pub(crate) fn run_immediate_task(&self, engine: &E) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let id = self.internals.id;
    let mut state = self.internals.state.lock();
    if state.has_cleared_timer || !engine.is_script_runnable() {
      state.wrapper = None;
      self.internals.set_keeping_alive(&scheduler, &mut state, false);
      return;
    }
    self.timer.set_state(TimerState::Fired);
    let Some(wrapper) = state.wrapper.take() else {
      self.internals.set_keeping_alive(&scheduler, &mut state, false);
      return;
    };
    state.in_callback = true;
    drop(state);

    engine.enter_event_loop();
    engine.will_dispatch_async_call(id);
    engine.invoke_timeout_callback(&wrapper);
    engine.did_dispatch_async_call(id);

    let mut state = self.internals.state.lock();
    state.in_callback = false;
    self.internals.set_keeping_alive(&scheduler, &mut state, false);
    drop(state);
    engine.exit_event_loop();
  }

  /// `clearImmediate`. The entry stays on its queue; the drain skips it.
  pub fn clear(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let mut state = self.internals.state.lock();
    self.internals.set_keeping_alive(&scheduler, &mut state, false);
    state.has_cleared_timer = true;
  }

  pub fn ref_timer(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let mut state = self.internals.state.lock();
    if state.has_js_ref {
      return;
    }
    state.has_js_ref = true;
    if !state.has_cleared_timer && self.timer.state() == TimerState::Pending {
      self.internals.set_keeping_alive(&scheduler, &mut state, true);
    }
  }

  pub fn unref_timer(&self) {
    let Some(scheduler) = self.internals.scheduler.upgrade() else {
      return;
    };
    let mut state = self.internals.state.lock();
    if state.has_js_ref {
      state.has_js_ref = false;
      self.internals.set_keeping_alive(&scheduler, &mut state, false);
    }
  }

  pub fn has_ref(&self) -> bool {
    self.internals.state.lock().has_js_ref
  }

  pub fn is_destroyed(&self) -> bool {
    let state = self.internals.state.lock();
    state.has_cleared_timer
      || (!state.in_callback
        && matches!(
          self.timer.state(),
          TimerState::Fired | TimerState::Cancelled
        ))
  }

  pub fn to_primitive(&self) -> i32 {
    let mut state = self.internals.state.lock();
    if !state.has_accessed_primitive {
      state.has_accessed_primitive = true;
      if let Some(scheduler) = self.internals.scheduler.upgrade() {
        scheduler.register_id(
          self.internals.id,
          WeakJsTimer::Immediate(self.weak_self.clone()),
        );
      }
    }
    self.internals.id.id
  }

  pub fn finalize(&self) {
    self.internals.state.lock().wrapper = None;
  }
}

impl<E: JsEngine> Drop for ImmediateObject<E> {
  fn drop(&mut self) {
    self.internals.deinit();
  }
}

// The JS API surface. Bindings call these from the `setTimeout` family of
// globals; delays arrive as engine values and are coerced here.
impl<E: JsEngine> TimerScheduler<E> {
  /// `setTimeout(cb, delay, ...args)`.
  ///
  /// The bare zero-delay form with no extra arguments schedules an immediate
  /// instead of a 1 ms timer, skipping the time-ordered store.
  pub fn set_timeout(
    &self,
    engine: &E,
    wrapper: E::Wrapper,
    callback: E::Value,
    delay: E::Value,
    arguments: Option<E::Value>,
  ) -> JsTimer<E> {
    let raw = engine.coerce_to_double(&delay);
    let countdown =
      coerce_interval(raw, self.options().saturate_timeout_overflow);
    if countdown == 0 && arguments.is_none() {
      let id = TimerId::new(self.next_id(), TimerKind::Immediate);
      return JsTimer::Immediate(ImmediateObject::create(
        self, engine, id, wrapper, callback, None,
      ));
    }
    let id = TimerId::new(self.next_id(), TimerKind::Timeout);
    JsTimer::Timeout(TimeoutObject::create(
      self,
      engine,
      id,
      countdown.max(1),
      wrapper,
      callback,
      arguments,
    ))
  }

  /// `setInterval(cb, delay, ...args)`. The delay is clamped to at least
  /// 1 ms; there is no saturation option.
  pub fn set_interval(
    &self,
    engine: &E,
    wrapper: E::Wrapper,
    callback: E::Value,
    delay: E::Value,
    arguments: Option<E::Value>,
  ) -> Arc<TimeoutObject<E>> {
    let raw = engine.coerce_to_double(&delay);
    let interval_ms = coerce_interval(raw, false).max(1);
    let id = TimerId::new(self.next_id(), TimerKind::Interval);
    TimeoutObject::create(
      self,
      engine,
      id,
      interval_ms,
      wrapper,
      callback,
      arguments,
    )
  }

  /// `setImmediate(cb, ...args)`.
  pub fn set_immediate(
    &self,
    engine: &E,
    wrapper: E::Wrapper,
    callback: E::Value,
    arguments: Option<E::Value>,
  ) -> Arc<ImmediateObject<E>> {
    let id = TimerId::new(self.next_id(), TimerKind::Immediate);
    ImmediateObject::create(self, engine, id, wrapper, callback, arguments)
  }

  /// `clearTimeout(id)` for a numeric id. Tries the timeout map, then the
  /// interval map; a miss is a silent no-op. Callers holding the timer
  /// object clear it directly instead.
  pub fn clear_timeout(&self, id: i32) {
    if let Some(timer) =
      self.lookup_js_timer(&[TimerKind::Timeout, TimerKind::Interval], id)
    {
      timer.clear();
    }
  }

  /// `clearInterval(id)`. Same lookup as `clear_timeout`; the two are
  /// interchangeable for timeouts and intervals.
  pub fn clear_interval(&self, id: i32) {
    self.clear_timeout(id);
  }

  /// `clearImmediate(id)`. Only consults the immediate map; timeout and
  /// interval ids cannot be cleared through here.
  pub fn clear_immediate(&self, id: i32) {
    if let Some(timer) = self.lookup_js_timer(&[TimerKind::Immediate], id) {
      timer.clear();
    }
  }

  /// `clearTimeout` with a string id. Anything but the canonical decimal
  /// form of an assigned id is a silent no-op.
  pub fn clear_timeout_str(&self, id: &str) {
    if let Some(id) = parse_canonical_id(id) {
      self.clear_timeout(id);
    }
  }

  pub fn clear_interval_str(&self, id: &str) {
    if let Some(id) = parse_canonical_id(id) {
      self.clear_interval(id);
    }
  }

  pub fn clear_immediate_str(&self, id: &str) {
    if let Some(id) = parse_canonical_id(id) {
      self.clear_immediate(id);
    }
  }
}
