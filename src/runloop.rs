// Copyright 2018-2025 the Deno authors. MIT license.

//! Host-runloop timers.
//!
//! A lower-level timer fronting the host runtime's internal runloop (the GC
//! scheduler is the main customer). It differs from the JS-visible timers in
//! two ways: a zero-delay update publishes the timer on the scheduler's
//! imminent slot, which the event loop checks lock-free ahead of the store,
//! and its own mutex lets other threads cancel and query it.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;

use crate::host::JsEngine;
use crate::scheduler::TimerScheduler;
use crate::time::Time;
use crate::timer::EventLoopTimer;
use crate::timer::FireDecision;
use crate::timer::ScheduledTimer;
use crate::timer::TimerState;

struct RunloopTimerInner {
  /// Rearm period; `None` for one-shot.
  repeat: Option<Duration>,
  /// Whether this timer currently occupies the scheduler's imminent slot.
  imminent: bool,
}

/// A timer owned by the host runloop, dispatched through the event loop's
/// store or its imminent fast path.
pub struct RunloopTimer<E: JsEngine> {
  weak_self: Weak<RunloopTimer<E>>,
  timer: EventLoopTimer,
  scheduler: Weak<TimerScheduler<E>>,
  inner: Mutex<RunloopTimerInner>,
  /// The external firing function.
  fire_fn: Box<dyn Fn(&E) + Send + Sync>,
}

impl<E: JsEngine> RunloopTimer<E> {
  pub fn new(
    scheduler: &Arc<TimerScheduler<E>>,
    fire_fn: impl Fn(&E) + Send + Sync + 'static,
  ) -> Arc<RunloopTimer<E>> {
    Arc::new_cyclic(|weak_self| RunloopTimer {
      weak_self: weak_self.clone(),
      timer: EventLoopTimer::new(),
      scheduler: Arc::downgrade(scheduler),
      inner: Mutex::new(RunloopTimerInner {
        repeat: None,
        imminent: false,
      }),
      fire_fn: Box::new(fire_fn),
    })
  }

  pub fn event_loop_timer(&self) -> &EventLoopTimer {
    &self.timer
  }

  fn scheduled(&self) -> Option<ScheduledTimer<E>> {
    self.weak_self.upgrade().map(ScheduledTimer::Runloop)
  }

  /// (Re)arms the timer. A zero delay publishes it on the imminent fast
  /// path; any other delay goes through the store and retracts a previous
  /// imminent publication.
  pub fn update(&self, delay: Duration, repeat: Option<Duration>) {
    let Some(scheduler) = self.scheduler.upgrade() else {
      return;
    };
    let Some(this) = self.weak_self.upgrade() else {
      return;
    };
    self.inner.lock().repeat = repeat;
    if delay.is_zero() {
      if self.timer.state() == TimerState::Active {
        scheduler.remove(&ScheduledTimer::Runloop(this.clone()));
      }
      self.timer.set_next(scheduler.now());
      self.timer.set_state(TimerState::Pending);
      self.inner.lock().imminent = true;
      scheduler.publish_imminent(this);
    } else {
      self.retract_imminence(&scheduler);
      scheduler
        .update(&ScheduledTimer::Runloop(this), scheduler.now() + delay);
    }
  }

  /// Disarms without firing. Safe from any thread, idempotent.
  pub fn cancel(&self) {
    let Some(scheduler) = self.scheduler.upgrade() else {
      return;
    };
    self.retract_imminence(&scheduler);
    match self.scheduled() {
      Some(scheduled) if self.timer.state() == TimerState::Active => {
        scheduler.remove(&scheduled);
      }
      _ => self.timer.set_state(TimerState::Cancelled),
    }
  }

  /// Remaining delay, `Some(0.0)` when imminent, `None` when disarmed.
  pub fn seconds_until_timer(&self) -> Option<f64> {
    let scheduler = self.scheduler.upgrade()?;
    let inner = self.inner.lock();
    if inner.imminent {
      return Some(0.0);
    }
    if self.timer.state() == TimerState::Active {
      let remaining = self.timer.next().duration_since(scheduler.now());
      return Some(remaining.as_secs_f64());
    }
    None
  }

  pub(crate) fn fire(&self, _now: Time, engine: &E) -> FireDecision {
    self.timer.set_state(TimerState::Fired);
    let Some(scheduler) = self.scheduler.upgrade() else {
      return FireDecision::Disarm;
    };
    // Fired through the store while also published imminent: retract, the
    // slot's entry must not run a second time.
    self.retract_imminence(&scheduler);
    (self.fire_fn)(engine);
    match self.inner.lock().repeat {
      Some(period) => FireDecision::Rearm(scheduler.now() + period),
      None => FireDecision::Disarm,
    }
  }

  /// Clears the local flag and, if it was set, the scheduler's slot. The own
  /// lock is released before the scheduler call.
  fn retract_imminence(&self, scheduler: &TimerScheduler<E>) {
    let was_imminent = {
      let mut inner = self.inner.lock();
      std::mem::replace(&mut inner.imminent, false)
    };
    if was_imminent {
      scheduler.retract_imminent(self);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::TimersOptions;
  use crate::testing::CountingDriver;
  use crate::testing::TestClock;
  use crate::testing::TestEngine;
  use std::sync::atomic::AtomicU32;
  use std::sync::atomic::Ordering;

  fn fixture() -> (
    Arc<TimerScheduler<TestEngine>>,
    Arc<TestClock>,
    TestEngine,
    Arc<AtomicU32>,
  ) {
    let clock = Arc::new(TestClock::new());
    let scheduler = TimerScheduler::new(
      clock.clone(),
      Arc::new(CountingDriver::default()),
      TimersOptions::default(),
    );
    (scheduler, clock, TestEngine::new(), Arc::new(AtomicU32::new(0)))
  }

  fn counting_timer(
    scheduler: &Arc<TimerScheduler<TestEngine>>,
    fired: &Arc<AtomicU32>,
  ) -> Arc<RunloopTimer<TestEngine>> {
    let fired = fired.clone();
    RunloopTimer::new(scheduler, move |_| {
      fired.fetch_add(1, Ordering::Relaxed);
    })
  }

  #[test]
  fn zero_delay_rides_the_imminent_fast_path() {
    let (scheduler, _clock, engine, fired) = fixture();
    let timer = counting_timer(&scheduler, &fired);
    assert!(!scheduler.fire_imminent(&engine));

    timer.update(Duration::ZERO, None);
    assert_eq!(timer.seconds_until_timer(), Some(0.0));
    assert!(scheduler.fire_imminent(&engine));
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(timer.event_loop_timer().state(), TimerState::Fired);
    // The slot is consumed.
    assert!(!scheduler.fire_imminent(&engine));
    assert_eq!(timer.seconds_until_timer(), None);
  }

  #[test]
  fn nonzero_update_retracts_imminence_and_uses_the_store() {
    let (scheduler, clock, engine, fired) = fixture();
    let timer = counting_timer(&scheduler, &fired);
    timer.update(Duration::ZERO, None);
    timer.update(Duration::from_millis(20), None);
    // No longer imminent; it now waits in the store.
    assert!(!scheduler.fire_imminent(&engine));
    assert_eq!(timer.event_loop_timer().state(), TimerState::Active);
    let remaining = timer.seconds_until_timer().unwrap();
    assert!((remaining - 0.02).abs() < 1e-9);

    clock.advance(Duration::from_millis(20));
    scheduler.drain_timers(&engine);
    assert_eq!(fired.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn repeating_timer_rearms_after_each_fire() {
    let (scheduler, clock, engine, fired) = fixture();
    let timer = counting_timer(&scheduler, &fired);
    timer.update(
      Duration::from_millis(10),
      Some(Duration::from_millis(10)),
    );
    for expected in 1..=3 {
      clock.advance(Duration::from_millis(10));
      scheduler.drain_timers(&engine);
      assert_eq!(fired.load(Ordering::Relaxed), expected);
      assert_eq!(timer.event_loop_timer().state(), TimerState::Active);
    }
    timer.cancel();
    assert_eq!(timer.event_loop_timer().state(), TimerState::Cancelled);
    assert_eq!(timer.seconds_until_timer(), None);
  }

  #[test]
  fn cancel_is_idempotent_and_stops_firing() {
    let (scheduler, clock, engine, fired) = fixture();
    let timer = counting_timer(&scheduler, &fired);
    timer.update(Duration::from_millis(10), None);
    timer.cancel();
    timer.cancel();
    clock.advance(Duration::from_millis(20));
    scheduler.drain_timers(&engine);
    assert_eq!(fired.load(Ordering::Relaxed), 0);
  }

  #[test]
  fn get_timeout_fires_due_runloop_timers_inline() {
    let (scheduler, clock, engine, fired) = fixture();
    let timer = counting_timer(&scheduler, &fired);
    timer.update(Duration::from_millis(5), None);
    // Keep-alive comes from JS timers; fake one so the query looks at the
    // store at all.
    scheduler.increment_timer_ref(1);
    clock.advance(Duration::from_millis(10));
    // The due runloop timer fires during the pre-wait query itself, leaving
    // no due work behind.
    assert_eq!(scheduler.get_timeout(&engine), None);
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    scheduler.increment_timer_ref(-1);
  }
}
