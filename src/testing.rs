// Copyright 2018-2025 the Deno authors. MIT license.

//! Test doubles for the engine, clock, and native-loop seams.
//!
//! Public so embedders can drive the scheduler deterministically in their
//! own tests: a manually advanced clock, an engine whose callbacks are plain
//! closures and which records inspector traffic, and a driver that counts
//! keep-alive edges.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::host::EventLoopDriver;
use crate::host::JsEngine;
use crate::ids::TimerId;
use crate::time::Clock;
use crate::time::Time;

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct TestClock {
  now: Mutex<Time>,
}

impl TestClock {
  /// Starts at [`Time::ZERO`].
  pub fn new() -> TestClock {
    TestClock {
      now: Mutex::new(Time::ZERO),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock();
    *now = *now + by;
  }

  pub fn set(&self, to: Time) {
    *self.now.lock() = to;
  }
}

impl Default for TestClock {
  fn default() -> TestClock {
    TestClock::new()
  }
}

impl Clock for TestClock {
  fn now(&self) -> Time {
    *self.now.lock()
  }
}

pub type TestCallback = Arc<dyn Fn(&TestEngine) + Send + Sync>;

/// Engine values for tests: numbers coerce, functions run.
#[derive(Clone)]
pub enum TestValue {
  Number(f64),
  Function(TestCallback),
}

/// Wraps a closure as a [`TestValue::Function`].
pub fn function(
  f: impl Fn(&TestEngine) + Send + Sync + 'static,
) -> TestValue {
  TestValue::Function(Arc::new(f))
}

#[derive(Default)]
struct TestWrapperSlots {
  callback: Mutex<Option<TestCallback>>,
  arguments: Mutex<Option<TestValue>>,
}

/// Stands in for the engine object wrapping a timer; the cached slots live
/// here like they would on the real wrapper.
#[derive(Clone, Default)]
pub struct TestWrapper(Arc<TestWrapperSlots>);

/// Inspector traffic recorded by [`TestEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InspectorEvent {
  Scheduled(TimerId, bool),
  WillDispatch(TimerId),
  DidDispatch(TimerId),
  Cancelled(TimerId),
}

/// An engine whose callbacks are Rust closures.
pub struct TestEngine {
  runnable: AtomicBool,
  events: Mutex<Vec<InspectorEvent>>,
}

impl TestEngine {
  pub fn new() -> TestEngine {
    TestEngine {
      runnable: AtomicBool::new(true),
      events: Mutex::new(Vec::new()),
    }
  }

  /// Simulates script-execution termination.
  pub fn set_runnable(&self, runnable: bool) {
    self.runnable.store(runnable, Ordering::Relaxed);
  }

  pub fn events(&self) -> Vec<InspectorEvent> {
    self.events.lock().clone()
  }

  fn record(&self, event: InspectorEvent) {
    self.events.lock().push(event);
  }
}

impl Default for TestEngine {
  fn default() -> TestEngine {
    TestEngine::new()
  }
}

impl JsEngine for TestEngine {
  type Value = TestValue;
  type Wrapper = TestWrapper;

  fn coerce_to_double(&self, value: &TestValue) -> f64 {
    match value {
      TestValue::Number(n) => *n,
      TestValue::Function(_) => f64::NAN,
    }
  }

  fn set_cached_callback(&self, wrapper: &TestWrapper, callback: TestValue) {
    if let TestValue::Function(f) = callback {
      *wrapper.0.callback.lock() = Some(f);
    }
  }

  fn set_cached_arguments(
    &self,
    wrapper: &TestWrapper,
    arguments: TestValue,
  ) {
    *wrapper.0.arguments.lock() = Some(arguments);
  }

  fn invoke_timeout_callback(&self, wrapper: &TestWrapper) {
    let callback = wrapper.0.callback.lock().clone();
    if let Some(callback) = callback {
      callback(self);
    }
  }

  fn is_script_runnable(&self) -> bool {
    self.runnable.load(Ordering::Relaxed)
  }

  fn did_schedule_async_call(&self, id: TimerId, single_shot: bool) {
    self.record(InspectorEvent::Scheduled(id, single_shot));
  }

  fn will_dispatch_async_call(&self, id: TimerId) {
    self.record(InspectorEvent::WillDispatch(id));
  }

  fn did_dispatch_async_call(&self, id: TimerId) {
    self.record(InspectorEvent::DidDispatch(id));
  }

  fn did_cancel_async_call(&self, id: TimerId) {
    self.record(InspectorEvent::Cancelled(id));
  }
}

/// Driver that counts keep-alive edges and remembers the last deadline
/// refresh.
#[derive(Debug, Default)]
pub struct CountingDriver {
  ref_calls: AtomicU32,
  unref_calls: AtomicU32,
  last_deadline: Mutex<Option<Duration>>,
}

impl CountingDriver {
  pub fn ref_calls(&self) -> u32 {
    self.ref_calls.load(Ordering::Relaxed)
  }

  pub fn unref_calls(&self) -> u32 {
    self.unref_calls.load(Ordering::Relaxed)
  }

  pub fn last_deadline(&self) -> Option<Duration> {
    *self.last_deadline.lock()
  }
}

impl EventLoopDriver for CountingDriver {
  fn ref_loop(&self) {
    self.ref_calls.fetch_add(1, Ordering::Relaxed);
  }

  fn unref_loop(&self) {
    self.unref_calls.fetch_add(1, Ordering::Relaxed);
  }

  fn refresh_deadline(&self, due_in: Duration) {
    *self.last_deadline.lock() = Some(due_in);
  }
}
