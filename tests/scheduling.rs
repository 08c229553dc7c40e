// Copyright 2018-2025 the Deno authors. MIT license.

//! End-to-end scheduling behavior, driven through the public surface on a
//! manual clock.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use web_timers::testing::function;
use web_timers::testing::CountingDriver;
use web_timers::testing::InspectorEvent;
use web_timers::testing::TestClock;
use web_timers::testing::TestEngine;
use web_timers::testing::TestValue;
use web_timers::testing::TestWrapper;
use web_timers::Clock;
use web_timers::EventLoopTimer;
use web_timers::FireDecision;
use web_timers::JsTimer;
use web_timers::ScheduledTimer;
use web_timers::SubsystemTimer;
use web_timers::Time;
use web_timers::TimeoutObject;
use web_timers::TimerKind;
use web_timers::TimerScheduler;
use web_timers::TimerState;
use web_timers::TimersOptions;

struct Fixture {
  scheduler: Arc<TimerScheduler<TestEngine>>,
  clock: Arc<TestClock>,
  driver: Arc<CountingDriver>,
  engine: TestEngine,
  log: Arc<Mutex<Vec<&'static str>>>,
}

fn fixture() -> Fixture {
  fixture_with(TimersOptions::default())
}

fn fixture_with(options: TimersOptions) -> Fixture {
  let clock = Arc::new(TestClock::new());
  let driver = Arc::new(CountingDriver::default());
  let scheduler = TimerScheduler::new(clock.clone(), driver.clone(), options);
  Fixture {
    scheduler,
    clock,
    driver,
    engine: TestEngine::new(),
    log: Arc::new(Mutex::new(Vec::new())),
  }
}

impl Fixture {
  fn set_timeout(&self, label: &'static str, delay: f64) -> JsTimer<TestEngine> {
    let log = self.log.clone();
    self.scheduler.set_timeout(
      &self.engine,
      TestWrapper::default(),
      function(move |_| log.lock().push(label)),
      TestValue::Number(delay),
      None,
    )
  }

  fn set_immediate(&self, label: &'static str) -> Arc<web_timers::ImmediateObject<TestEngine>> {
    let log = self.log.clone();
    self.scheduler.set_immediate(
      &self.engine,
      TestWrapper::default(),
      function(move |_| log.lock().push(label)),
      None,
    )
  }

  /// Advances in 1 ms steps, draining after each, like a busy loop would.
  fn run_for_ms(&self, ms: u64) {
    for _ in 0..ms {
      self.clock.advance(Duration::from_millis(1));
      self.scheduler.drain_timers(&self.engine);
    }
  }

  fn log(&self) -> Vec<&'static str> {
    self.log.lock().clone()
  }
}

// Two timeouts scheduled for the same instant fire in insertion order.
#[test]
fn same_deadline_fires_in_insertion_order() {
  let f = fixture();
  f.set_timeout("a", 10.0);
  f.set_timeout("b", 10.0);
  f.run_for_ms(10);
  assert_eq!(f.log(), vec!["a", "b"]);
}

// An interval that clears itself on its third call runs exactly three times.
#[test]
fn interval_clearing_itself_stops_after_three_calls() {
  let f = fixture();
  let calls = Arc::new(AtomicU32::new(0));
  let slot: Arc<Mutex<Option<Arc<TimeoutObject<TestEngine>>>>> =
    Arc::new(Mutex::new(None));
  let interval = {
    let calls = calls.clone();
    let slot = slot.clone();
    f.scheduler.set_interval(
      &f.engine,
      TestWrapper::default(),
      function(move |_| {
        if calls.fetch_add(1, Ordering::Relaxed) + 1 == 3 {
          slot.lock().as_ref().unwrap().clear();
        }
      }),
      TestValue::Number(5.0),
      None,
    )
  };
  *slot.lock() = Some(interval.clone());

  f.run_for_ms(50);
  assert_eq!(calls.load(Ordering::Relaxed), 3);
  assert!(interval.is_destroyed());
  assert_eq!(f.scheduler.active_timer_count(), 0);
}

// A cleared timeout never runs and returns keep-alive to its prior level.
#[test]
fn cleared_timeout_never_fires() {
  let f = fixture();
  assert_eq!(f.scheduler.active_timer_count(), 0);
  let timer = f.set_timeout("never", 20.0);
  assert_eq!(f.scheduler.active_timer_count(), 1);
  f.run_for_ms(5);
  timer.clear();
  assert_eq!(f.scheduler.active_timer_count(), 0);
  f.run_for_ms(30);
  assert_eq!(f.log(), Vec::<&str>::new());
}

// Immediates drain ahead of the timer store, and the bare zero-delay
// setTimeout is rewritten to an immediate, keeping insertion order.
#[test]
fn immediates_drain_first_in_insertion_order() {
  let f = fixture();
  f.set_immediate("a");
  f.set_immediate("b");
  let c = f.set_timeout("c", 0.0);
  assert!(c.as_immediate().is_some());

  f.scheduler.drain_immediates(&f.engine);
  f.scheduler.drain_timers(&f.engine);
  assert_eq!(f.log(), vec!["a", "b", "c"]);
  // Nothing was ever in the time-ordered store.
  assert_eq!(f.scheduler.get_timeout(&f.engine), None);
}

// An immediate scheduled from an immediate waits for the next drain.
#[test]
fn immediate_scheduled_during_drain_runs_next_iteration() {
  let f = fixture();
  let log = f.log.clone();
  let scheduler = f.scheduler.clone();
  f.scheduler.set_immediate(
    &f.engine,
    TestWrapper::default(),
    function(move |engine| {
      log.lock().push("outer");
      let log = log.clone();
      scheduler.set_immediate(
        engine,
        TestWrapper::default(),
        function(move |_| log.lock().push("inner")),
        None,
      );
    }),
    None,
  );
  f.scheduler.drain_immediates(&f.engine);
  assert_eq!(f.log(), vec!["outer"]);
  f.scheduler.drain_immediates(&f.engine);
  assert_eq!(f.log(), vec!["outer", "inner"]);
}

// An unreferenced timer no longer blocks the loop but still fires if the
// loop happens to wait.
#[test]
fn unreferenced_timer_fires_without_keeping_the_loop_alive() {
  let f = fixture();
  let timer = f.set_timeout("cb", 50.0);
  let timeout = timer.as_timeout().unwrap();
  timeout.unref_timer();
  assert!(!timeout.has_ref());
  // The loop would be free to exit: no referenced timer is pending.
  assert_eq!(f.scheduler.get_timeout(&f.engine), None);
  assert_eq!(f.driver.unref_calls(), 1);

  f.run_for_ms(50);
  assert_eq!(f.log(), vec!["cb"]);
}

// String ids work only in canonical form.
#[test]
fn string_clear_requires_canonical_form() {
  let f = fixture();
  let timer = f.set_timeout("a", 20.0);
  let timeout = timer.as_timeout().unwrap();
  let id = timeout.to_primitive();

  // Non-canonical spellings miss.
  f.scheduler.clear_timeout_str(&format!(" {id}"));
  f.scheduler.clear_timeout_str(&format!("0{id}"));
  f.scheduler.clear_timeout_str(&format!("{id} "));
  assert_eq!(timeout.event_loop_timer().state(), TimerState::Active);

  f.scheduler.clear_timeout_str(&id.to_string());
  assert!(timeout.is_destroyed());
  f.run_for_ms(30);
  assert_eq!(f.log(), Vec::<&str>::new());
}

// Ids are only reachable through clear* after a primitive coercion, and only
// through the maps of their own kind family.
#[test]
fn clear_by_id_respects_kind_maps() {
  let f = fixture();
  let timer = f.set_timeout("t", 20.0);
  let timeout = timer.as_timeout().unwrap();

  // Never coerced: the id map has no entry to find.
  f.scheduler.clear_timeout(timeout.id().id);
  assert_eq!(timeout.event_loop_timer().state(), TimerState::Active);

  let id = timeout.to_primitive();
  // An immediate id namespace is separate.
  f.scheduler.clear_immediate(id);
  assert_eq!(timeout.event_loop_timer().state(), TimerState::Active);
  // clearInterval reaches timeouts (shared lookup family).
  f.scheduler.clear_interval(id);
  assert!(timeout.is_destroyed());
}

// refresh() during the callback reschedules from the pre-callback sample;
// ticks stay a full interval apart and never accelerate.
#[test]
fn refresh_during_interval_callback_resets_the_countdown() {
  let f = fixture();
  let starts: Arc<Mutex<Vec<Time>>> = Arc::new(Mutex::new(Vec::new()));
  let slot: Arc<Mutex<Option<Arc<TimeoutObject<TestEngine>>>>> =
    Arc::new(Mutex::new(None));
  let interval = {
    let starts = starts.clone();
    let slot = slot.clone();
    let clock = f.clock.clone();
    f.scheduler.set_interval(
      &f.engine,
      TestWrapper::default(),
      function(move |_| {
        starts.lock().push(clock.now());
        // A slow callback; refresh() must not push the next tick out past
        // the pre-callback sample.
        clock.advance(Duration::from_millis(4));
        slot.lock().as_ref().unwrap().refresh();
      }),
      TestValue::Number(10.0),
      None,
    )
  };
  *slot.lock() = Some(interval.clone());

  f.run_for_ms(35);
  let starts = starts.lock().clone();
  assert!(!starts.is_empty());
  for pair in starts.windows(2) {
    let gap = pair[1].duration_since(pair[0]);
    assert!(gap >= Duration::from_millis(10), "gap {gap:?}");
  }
  // The next fire is a full interval past the last callback's start.
  assert_eq!(
    interval.event_loop_timer().next(),
    starts.last().unwrap().add_ms(10)
  );
  interval.clear();
}

// A one-shot that refreshes itself from its own callback runs again.
#[test]
fn one_shot_refresh_inside_callback_fires_again() {
  let f = fixture();
  let calls = Arc::new(AtomicU32::new(0));
  let slot: Arc<Mutex<Option<JsTimer<TestEngine>>>> =
    Arc::new(Mutex::new(None));
  let timer = {
    let calls = calls.clone();
    let slot = slot.clone();
    f.scheduler.set_timeout(
      &f.engine,
      TestWrapper::default(),
      function(move |_| {
        if calls.fetch_add(1, Ordering::Relaxed) == 0 {
          let guard = slot.lock();
          if let Some(timeout) =
            guard.as_ref().and_then(|timer| timer.as_timeout())
          {
            timeout.refresh();
          }
        }
      }),
      TestValue::Number(10.0),
      None,
    )
  };
  *slot.lock() = Some(timer.clone());

  f.run_for_ms(40);
  assert_eq!(calls.load(Ordering::Relaxed), 2);
  assert!(timer.as_timeout().unwrap().is_destroyed());
}

// Interval ticks never drift closer than the interval even when the
// callback itself is slow.
#[test]
fn interval_gap_is_bounded_below_by_the_interval() {
  let f = fixture();
  let starts: Arc<Mutex<Vec<Time>>> = Arc::new(Mutex::new(Vec::new()));
  let interval = {
    let starts = starts.clone();
    let clock = f.clock.clone();
    f.scheduler.set_interval(
      &f.engine,
      TestWrapper::default(),
      function(move |_| {
        starts.lock().push(clock.now());
        clock.advance(Duration::from_millis(3));
      }),
      TestValue::Number(5.0),
      None,
    )
  };

  f.run_for_ms(60);
  let starts = starts.lock().clone();
  assert!(starts.len() >= 5);
  for pair in starts.windows(2) {
    assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(5));
  }
  interval.clear();
}

// Overflowing delays: 1 ms by default, i32::MAX ms with saturation on.
#[test]
fn overflowing_delay_clamps_or_saturates() {
  let f = fixture();
  let timer = f.set_timeout("soon", f64::INFINITY);
  assert_eq!(
    timer.as_timeout().unwrap().event_loop_timer().next(),
    f.clock.now().add_ms(1)
  );
  timer.clear();

  let saturating = fixture_with(TimersOptions {
    saturate_timeout_overflow: true,
  });
  let timer = saturating.set_timeout("later", f64::INFINITY);
  assert_eq!(
    timer.as_timeout().unwrap().event_loop_timer().next(),
    saturating.clock.now().add_ms(i32::MAX as u64)
  );
  timer.clear();
}

// The engine's GC finalizer drops the strong handle; a timer that fires
// afterwards has nothing to call and cancels itself.
#[test]
fn finalized_wrapper_turns_the_fire_into_a_cancel() {
  let f = fixture();
  let timer = f.set_timeout("gone", 10.0);
  let timeout = timer.as_timeout().unwrap().clone();
  timeout.finalize();
  drop(timer);

  f.run_for_ms(15);
  assert_eq!(f.log(), Vec::<&str>::new());
  assert!(timeout.is_destroyed());
  assert_eq!(f.scheduler.active_timer_count(), 0);
}

// Once script execution stops, due timers cancel instead of dispatching.
#[test]
fn terminated_script_cancels_due_timers() {
  let f = fixture();
  let timer = f.set_timeout("cb", 10.0);
  f.engine.set_runnable(false);
  f.run_for_ms(15);
  assert_eq!(f.log(), Vec::<&str>::new());
  let id = timer.id();
  assert!(f
    .engine
    .events()
    .contains(&InspectorEvent::Cancelled(id)));
}

// The inspector sees schedule, dispatch bracketing, and the async id ties
// them together.
#[test]
fn inspector_sees_the_timer_lifecycle() {
  let f = fixture();
  let timer = f.set_timeout("cb", 10.0);
  let id = timer.id();
  assert_eq!(id.kind, TimerKind::Timeout);
  f.run_for_ms(10);
  assert_eq!(
    f.engine.events(),
    vec![
      InspectorEvent::Scheduled(id, true),
      InspectorEvent::WillDispatch(id),
      InspectorEvent::DidDispatch(id),
    ]
  );
}

// Timers scheduled from other threads land in the one store and dispatch on
// the draining thread.
#[test]
fn cross_thread_scheduling_dispatches_on_the_drain_thread() {
  struct Tick {
    timer: EventLoopTimer,
    fired: Arc<AtomicU32>,
  }

  impl SubsystemTimer<TestEngine> for Tick {
    fn event_loop_timer(&self) -> &EventLoopTimer {
      &self.timer
    }

    fn fire(&self, _now: Time, _engine: &TestEngine) -> FireDecision {
      self.fired.fetch_add(1, Ordering::Relaxed);
      FireDecision::Disarm
    }
  }

  let f = fixture();
  let fired = Arc::new(AtomicU32::new(0));
  let threads: Vec<_> = (0..4)
    .map(|i| {
      let scheduler = f.scheduler.clone();
      let fired = fired.clone();
      std::thread::spawn(move || {
        for j in 0..8 {
          let timer = ScheduledTimer::Subsystem(Arc::new(Tick {
            timer: EventLoopTimer::new(),
            fired: fired.clone(),
          }));
          scheduler.insert(&timer, Time::ZERO.add_ms(i * 8 + j + 1));
        }
      })
    })
    .collect();
  for thread in threads {
    thread.join().unwrap();
  }

  f.run_for_ms(40);
  assert_eq!(fired.load(Ordering::Relaxed), 32);
}
