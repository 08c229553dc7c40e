// Copyright 2018-2025 the Deno authors. MIT license.

//! The generic scheduled-timer record and its tag dispatch.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::JsEngine;
use crate::js_timers::ImmediateObject;
use crate::js_timers::TimeoutObject;
use crate::runloop::RunloopTimer;
use crate::time::Time;

/// Lifecycle of a scheduled timer.
///
/// `Pending` is the initial state. `Active` means "present in exactly one
/// store bucket". `Cancelled` and `Fired` are terminal with respect to bucket
/// membership; an interval or a `refresh()` call can bring a `Fired` timer
/// back to `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
  Pending,
  Active,
  Cancelled,
  Fired,
}

/// What the drain loop does with a timer after dispatching it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireDecision {
  Disarm,
  Rearm(Time),
}

#[derive(Clone, Copy, Debug)]
struct Schedule {
  next: Time,
  state: TimerState,
}

/// The record the store orders timers by: the next fire time and the state
/// machine. Embedded by value in each concrete owner.
#[derive(Debug)]
pub struct EventLoopTimer {
  sched: Mutex<Schedule>,
}

impl EventLoopTimer {
  pub fn new() -> EventLoopTimer {
    EventLoopTimer {
      sched: Mutex::new(Schedule {
        next: Time::ZERO,
        state: TimerState::Pending,
      }),
    }
  }

  pub fn state(&self) -> TimerState {
    self.sched.lock().state
  }

  pub fn next(&self) -> Time {
    self.sched.lock().next
  }

  pub(crate) fn set_state(&self, state: TimerState) {
    self.sched.lock().state = state;
  }

  pub(crate) fn set_next(&self, next: Time) {
    self.sched.lock().next = next;
  }
}

impl Default for EventLoopTimer {
  fn default() -> EventLoopTimer {
    EventLoopTimer::new()
  }
}

impl Drop for EventLoopTimer {
  fn drop(&mut self) {
    // An Active timer is owned by a store bucket; destroying it now would
    // leave the bucket holding a dangling entry.
    debug_assert!(
      self.sched.get_mut().state != TimerState::Active,
      "timer destroyed while scheduled"
    );
  }
}

/// A timer owned by a runtime subsystem other than the JS-visible timers and
/// the host runloop: DNS resolution, database connection timeouts, file
/// watchers, test runners. Implementors embed an [`EventLoopTimer`] and ride
/// the [`ScheduledTimer::Subsystem`] tag.
pub trait SubsystemTimer<E: JsEngine>: Send + Sync {
  fn event_loop_timer(&self) -> &EventLoopTimer;

  /// Dispatched by the drain loop once the timer is due. The scheduler mutex
  /// is not held, and the record is already marked `Fired`; returning
  /// `Rearm` re-activates it.
  fn fire(&self, now: Time, engine: &E) -> FireDecision;
}

/// The tag discriminating who owns a scheduled timer.
///
/// Dispatch is a closed-world match rather than virtual calls: the scheduler
/// knows the complete set of timer-producing subsystems. In-crate owners are
/// enum variants; external subsystems share the `Subsystem` arm through the
/// [`SubsystemTimer`] trait. New in-crate tags extend the enum and add a
/// dispatch arm.
pub enum ScheduledTimer<E: JsEngine> {
  Timeout(Arc<TimeoutObject<E>>),
  Immediate(Arc<ImmediateObject<E>>),
  Runloop(Arc<RunloopTimer<E>>),
  Subsystem(Arc<dyn SubsystemTimer<E>>),
}

impl<E: JsEngine> Clone for ScheduledTimer<E> {
  fn clone(&self) -> Self {
    match self {
      ScheduledTimer::Timeout(t) => ScheduledTimer::Timeout(t.clone()),
      ScheduledTimer::Immediate(t) => ScheduledTimer::Immediate(t.clone()),
      ScheduledTimer::Runloop(t) => ScheduledTimer::Runloop(t.clone()),
      ScheduledTimer::Subsystem(t) => ScheduledTimer::Subsystem(t.clone()),
    }
  }
}

impl<E: JsEngine> ScheduledTimer<E> {
  /// The schedule record embedded in the owner this tag points back to.
  pub fn event_loop_timer(&self) -> &EventLoopTimer {
    match self {
      ScheduledTimer::Timeout(t) => t.event_loop_timer(),
      ScheduledTimer::Immediate(t) => t.event_loop_timer(),
      ScheduledTimer::Runloop(t) => t.event_loop_timer(),
      ScheduledTimer::Subsystem(t) => t.event_loop_timer(),
    }
  }

  pub(crate) fn fire(&self, now: Time, engine: &E) -> FireDecision {
    match self {
      ScheduledTimer::Timeout(t) => t.fire(now, engine),
      // Immediates normally drain from the immediate-task queue; dispatching
      // one here runs the same task.
      ScheduledTimer::Immediate(t) => {
        t.run_immediate_task(engine);
        FireDecision::Disarm
      }
      ScheduledTimer::Runloop(t) => t.fire(now, engine),
      ScheduledTimer::Subsystem(t) => t.fire(now, engine),
    }
  }

  /// The low-overhead tag `get_timeout` fires inline ahead of the loop wait.
  pub(crate) fn is_runloop(&self) -> bool {
    matches!(self, ScheduledTimer::Runloop(_))
  }

  /// Identity, not equality: true when both tags point at the same owner.
  pub(crate) fn same(&self, other: &ScheduledTimer<E>) -> bool {
    match (self, other) {
      (ScheduledTimer::Timeout(a), ScheduledTimer::Timeout(b)) => {
        Arc::ptr_eq(a, b)
      }
      (ScheduledTimer::Immediate(a), ScheduledTimer::Immediate(b)) => {
        Arc::ptr_eq(a, b)
      }
      (ScheduledTimer::Runloop(a), ScheduledTimer::Runloop(b)) => {
        Arc::ptr_eq(a, b)
      }
      (ScheduledTimer::Subsystem(a), ScheduledTimer::Subsystem(b)) => {
        Arc::ptr_eq(a, b)
      }
      _ => false,
    }
  }
}
