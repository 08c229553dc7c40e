// Copyright 2018-2025 the Deno authors. MIT license.

//! The thread-safe scheduler fronting the timer store.
//!
//! One `TimerScheduler` exists per event loop. Any thread may insert, remove,
//! update, or cancel; only the event-loop thread drains timers, drains
//! immediates, queries `get_timeout`, and touches the keep-alive count.
//!
//! Store mutation happens under the scheduler mutex. Callbacks never run
//! with it held, so a callback is free to schedule and cancel timers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use log::debug;
use log::trace;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::host::EventLoopDriver;
use crate::host::JsEngine;
use crate::ids::TimerId;
use crate::ids::TimerKind;
use crate::js_timers::ImmediateObject;
use crate::js_timers::JsTimer;
use crate::js_timers::WeakJsTimer;
use crate::runloop::RunloopTimer;
use crate::store::TimerStore;
use crate::time::Clock;
use crate::time::Time;
use crate::timer::FireDecision;
use crate::timer::ScheduledTimer;
use crate::timer::TimerState;

/// Shrink an ID map once its unused capacity holds this many bytes of
/// entries. Keeps `clear*` cheap (no per-remove rehash) while bounding the
/// slack left behind by a burst of timers.
const ID_MAP_SHRINK_SLACK_BYTES: usize = 256 * 1024;

/// Behavior toggles for the JS-facing surface, typically sourced from
/// runtime flags.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimersOptions {
  /// Saturate `setTimeout` delays that overflow an `i32` to `i32::MAX` ms
  /// instead of the default 1 ms fallback.
  pub saturate_timeout_overflow: bool,
}

struct SchedulerInner<E: JsEngine> {
  store: TimerStore<E>,
  /// Drained separately from the store, in insertion order.
  immediates: VecDeque<Arc<ImmediateObject<E>>>,
  /// The zero-delay runloop timer published for the loop's fast path.
  imminent: Option<Arc<RunloopTimer<E>>>,
  /// Lazy `id -> timer` bindings, one map per kind. Entries appear only once
  /// a timer has been coerced to a primitive.
  id_maps: [HashMap<i32, WeakJsTimer<E>>; TimerKind::COUNT],
}

impl<E: JsEngine> SchedulerInner<E> {
  /// Target of the earliest pending timer, if any.
  fn earliest(&self) -> Option<Time> {
    self.store.peek().map(|head| head.event_loop_timer().next())
  }
}

/// Thread-safe mediator between timer owners on any thread and the
/// event-loop thread's dispatch.
pub struct TimerScheduler<E: JsEngine> {
  weak_self: Weak<TimerScheduler<E>>,
  inner: Mutex<SchedulerInner<E>>,
  /// Mirrors whether `inner.imminent` is occupied so the loop's fast path
  /// can skip the lock when nothing is imminent.
  has_imminent: AtomicBool,
  /// JS timers currently keeping the event loop alive. Mutated only on the
  /// event-loop thread; `i32` so the non-negativity assertion is checkable.
  active_timer_count: AtomicI32,
  /// Post-incremented id source. Ids start at 1 and wrap; handed out from
  /// the event-loop thread only.
  next_id: AtomicI32,
  clock: Arc<dyn Clock>,
  driver: Arc<dyn EventLoopDriver>,
  options: TimersOptions,
}

impl<E: JsEngine> TimerScheduler<E> {
  pub fn new(
    clock: Arc<dyn Clock>,
    driver: Arc<dyn EventLoopDriver>,
    options: TimersOptions,
  ) -> Arc<TimerScheduler<E>> {
    Arc::new_cyclic(|weak_self| TimerScheduler {
      weak_self: weak_self.clone(),
      inner: Mutex::new(SchedulerInner {
        store: TimerStore::new(),
        immediates: VecDeque::new(),
        imminent: None,
        id_maps: Default::default(),
      }),
      has_imminent: AtomicBool::new(false),
      active_timer_count: AtomicI32::new(0),
      next_id: AtomicI32::new(1),
      clock,
      driver,
      options,
    })
  }

  pub(crate) fn weak_self(&self) -> Weak<TimerScheduler<E>> {
    self.weak_self.clone()
  }

  pub fn options(&self) -> &TimersOptions {
    &self.options
  }

  /// The clock the scheduler runs on.
  pub fn now(&self) -> Time {
    self.clock.now()
  }

  pub fn next_id(&self) -> i32 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Number of JS timers currently keeping the event loop alive. Not the
  /// store population: unreferenced timers still fire but do not count.
  pub fn active_timer_count(&self) -> i32 {
    self.active_timer_count.load(Ordering::Relaxed)
  }

  /// Schedules a pending timer to fire at `at`. The timer becomes `Active`
  /// and the store holds a reference until it is popped or removed.
  pub fn insert(&self, timer: &ScheduledTimer<E>, at: Time) {
    let elt = timer.event_loop_timer();
    let earliest = {
      let mut inner = self.inner.lock();
      debug_assert!(elt.state() != TimerState::Active, "timer already stored");
      elt.set_next(at);
      inner.store.insert(at.truncated_to_ms(), timer.clone());
      elt.set_state(TimerState::Active);
      inner.earliest()
    };
    self.notify_driver(earliest);
  }

  /// Unschedules `timer`, leaving it `Cancelled`. A no-op on the store if the
  /// drain loop got there first.
  pub fn remove(&self, timer: &ScheduledTimer<E>) {
    let elt = timer.event_loop_timer();
    let earliest = {
      let mut inner = self.inner.lock();
      if elt.state() == TimerState::Active {
        inner.store.remove(elt.next().truncated_to_ms(), timer);
      }
      elt.set_state(TimerState::Cancelled);
      inner.earliest()
    };
    self.notify_driver(earliest);
  }

  /// Re-aims `timer` at `new_time`, unlinking it first if it is currently
  /// stored. This is the one way a live timer moves between buckets.
  pub fn update(&self, timer: &ScheduledTimer<E>, new_time: Time) {
    let elt = timer.event_loop_timer();
    let earliest = {
      let mut inner = self.inner.lock();
      if elt.state() == TimerState::Active {
        inner.store.remove(elt.next().truncated_to_ms(), timer);
      }
      elt.set_next(new_time);
      inner.store.insert(new_time.truncated_to_ms(), timer.clone());
      elt.set_state(TimerState::Active);
      inner.earliest()
    };
    self.notify_driver(earliest);
  }

  /// Hands the dedicated-handle driver the store's current minimum, not the
  /// timer just touched: scheduling a late timer must not push the handle
  /// past an earlier one, and removing the earliest must re-aim the handle.
  fn notify_driver(&self, earliest: Option<Time>) {
    if let Some(at) = earliest {
      self.driver.refresh_deadline(at.duration_since(self.clock.now()));
    }
  }

  /// Adjusts the keep-alive count; transitions through zero ref or unref the
  /// native loop. Event-loop thread only.
  pub fn increment_timer_ref(&self, delta: i32) {
    let prev = self.active_timer_count.fetch_add(delta, Ordering::Relaxed);
    let current = prev + delta;
    debug_assert!(current >= 0, "keep-alive count went negative");
    if prev <= 0 && current > 0 {
      self.driver.ref_loop();
    } else if prev > 0 && current <= 0 {
      self.driver.unref_loop();
    }
  }

  /// How long the native loop may block waiting for timers.
  ///
  /// `None` means "do not block on timers": either no referenced timer is
  /// pending or the store is empty. Due runloop-tag timers found at the head
  /// are popped and fired right here, ahead of the wait, so a backlog of due
  /// JS timers cannot starve them.
  pub fn get_timeout(&self, engine: &E) -> Option<Duration> {
    if self.active_timer_count.load(Ordering::Relaxed) == 0 {
      return None;
    }
    let mut sampled: Option<Time> = None;
    loop {
      enum Step<E: JsEngine> {
        Empty,
        Wait(Duration),
        FireInline(ScheduledTimer<E>, Time),
      }
      let step = {
        let mut inner = self.inner.lock();
        match inner.store.peek() {
          None => Step::Empty,
          Some(head) => {
            let next = head.event_loop_timer().next();
            let now = *sampled.get_or_insert_with(|| self.clock.now());
            if next > now {
              Step::Wait(next.duration_since(now))
            } else if head.is_runloop() {
              let timer = inner.store.pop_min().unwrap();
              timer.event_loop_timer().set_state(TimerState::Fired);
              Step::FireInline(timer, now)
            } else {
              Step::Wait(Duration::ZERO)
            }
          }
        }
      };
      match step {
        Step::Empty => return None,
        Step::Wait(d) => return Some(d),
        Step::FireInline(timer, now) => {
          match timer.fire(now, engine) {
            FireDecision::Disarm => {}
            FireDecision::Rearm(at) => self.update(&timer, at),
          }
        }
      }
    }
  }

  /// Pops and dispatches every due timer. Event-loop thread only.
  ///
  /// The clock is sampled at most once per drain, lazily; every timer
  /// dispatched in one cycle sees the same `now`, and a timer becoming due
  /// mid-drain (an interval rearm, say) waits for the next cycle.
  pub fn drain_timers(&self, engine: &E) {
    let mut sampled: Option<Time> = None;
    loop {
      let (timer, now) = {
        let mut inner = self.inner.lock();
        let Some(head) = inner.store.peek() else {
          return;
        };
        let next = head.event_loop_timer().next();
        let now = *sampled.get_or_insert_with(|| self.clock.now());
        if next > now {
          return;
        }
        let timer = inner.store.pop_min().unwrap();
        timer.event_loop_timer().set_state(TimerState::Fired);
        (timer, now)
      };
      match timer.fire(now, engine) {
        FireDecision::Disarm => {}
        FireDecision::Rearm(at) => self.update(&timer, at),
      }
    }
  }

  /// Runs the immediate tasks queued before this call. Tasks enqueued by the
  /// tasks themselves run on the next drain, i.e. the next loop iteration.
  pub fn drain_immediates(&self, engine: &E) {
    let batch = std::mem::take(&mut self.inner.lock().immediates);
    if !batch.is_empty() {
      trace!("draining {} immediate task(s)", batch.len());
    }
    for immediate in batch {
      immediate.run_immediate_task(engine);
    }
  }

  pub(crate) fn enqueue_immediate(&self, immediate: Arc<ImmediateObject<E>>) {
    self.inner.lock().immediates.push_back(immediate);
  }

  // The imminent slot. A zero-delay runloop timer bypasses the store; the
  // loop checks `fire_imminent` on its fast path instead.

  pub(crate) fn publish_imminent(&self, timer: Arc<RunloopTimer<E>>) {
    let mut inner = self.inner.lock();
    inner.imminent = Some(timer);
    self.has_imminent.store(true, Ordering::Release);
  }

  pub(crate) fn retract_imminent(&self, timer: &RunloopTimer<E>) {
    let mut inner = self.inner.lock();
    if let Some(current) = &inner.imminent {
      if std::ptr::eq(Arc::as_ptr(current), timer) {
        inner.imminent = None;
        self.has_imminent.store(false, Ordering::Release);
      }
    }
  }

  /// Fires the published zero-delay runloop timer, if any. Costs a single
  /// atomic load when nothing is imminent. Returns whether a timer ran.
  pub fn fire_imminent(&self, engine: &E) -> bool {
    if !self.has_imminent.load(Ordering::Acquire) {
      return false;
    }
    let timer = {
      let mut inner = self.inner.lock();
      let timer = inner.imminent.take();
      self.has_imminent.store(false, Ordering::Release);
      timer
    };
    let Some(timer) = timer else {
      return false;
    };
    let scheduled = ScheduledTimer::Runloop(timer);
    match scheduled.fire(self.clock.now(), engine) {
      FireDecision::Disarm => {}
      FireDecision::Rearm(at) => self.update(&scheduled, at),
    }
    true
  }

  // Lazy id maps, populated on first primitive coercion so the common
  // never-coerced timer pays for no hash insertion.

  pub(crate) fn register_id(&self, id: TimerId, timer: WeakJsTimer<E>) {
    let mut inner = self.inner.lock();
    inner.id_maps[id.kind.index()].insert(id.id, timer);
  }

  pub(crate) fn unregister_id(&self, id: TimerId) {
    let mut inner = self.inner.lock();
    let map = &mut inner.id_maps[id.kind.index()];
    map.remove(&id.id);
    let entry_size = size_of::<(i32, WeakJsTimer<E>)>();
    if (map.capacity() - map.len()) * entry_size > ID_MAP_SHRINK_SLACK_BYTES {
      map.shrink_to_fit();
    }
  }

  /// First live binding for `id` across `kinds`, in order. `clearTimeout`
  /// and `clearInterval` consult the timeout then the interval map;
  /// `clearImmediate` only its own.
  pub(crate) fn lookup_js_timer(
    &self,
    kinds: &[TimerKind],
    id: i32,
  ) -> Option<JsTimer<E>> {
    let inner = self.inner.lock();
    kinds
      .iter()
      .filter_map(|kind| inner.id_maps[kind.index()].get(&id))
      .find_map(WeakJsTimer::upgrade)
  }
}

impl<E: JsEngine> Drop for TimerScheduler<E> {
  fn drop(&mut self) {
    // Nothing may be destroyed while Active; cancel whatever is still
    // scheduled before the store goes away.
    let inner = self.inner.get_mut();
    if inner.store.len() > 0 {
      debug!(
        "scheduler dropped with {} timer(s) scheduled",
        inner.store.len()
      );
    }
    for timer in inner.store.take_all() {
      timer.event_loop_timer().set_state(TimerState::Cancelled);
    }
  }
}
