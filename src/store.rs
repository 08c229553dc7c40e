// Copyright 2018-2025 the Deno authors. MIT license.

//! The time-ordered timer store.
//!
//! An ordered array of buckets, one per distinct millisecond-truncated fire
//! instant, each holding a FIFO of the timers due at that instant. Binary
//! search locates buckets; the array trades asymptotics for small constants
//! and locality, which holds up well because the population of distinct
//! instants stays small compared to the timer population.

use std::collections::VecDeque;

use crate::host::JsEngine;
use crate::time::Time;
use crate::timer::ScheduledTimer;

struct TimerBucket<E: JsEngine> {
  /// Absolute fire instant, millisecond truncated.
  instant: Time,
  /// Insertion order is fire order.
  timers: VecDeque<ScheduledTimer<E>>,
}

pub(crate) struct TimerStore<E: JsEngine> {
  /// Strictly ascending by instant; every bucket is non-empty.
  buckets: Vec<TimerBucket<E>>,
  len: usize,
}

impl<E: JsEngine> TimerStore<E> {
  pub fn new() -> TimerStore<E> {
    TimerStore {
      buckets: Vec::new(),
      len: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  /// Appends `timer` to the tail of the bucket at `instant`, creating the
  /// bucket in place when it is the first timer for that instant.
  pub fn insert(&mut self, instant: Time, timer: ScheduledTimer<E>) {
    debug_assert_eq!(instant, instant.truncated_to_ms());
    match self.buckets.binary_search_by(|b| b.instant.cmp(&instant)) {
      Ok(i) => self.buckets[i].timers.push_back(timer),
      Err(i) => self.buckets.insert(
        i,
        TimerBucket {
          instant,
          timers: VecDeque::from([timer]),
        },
      ),
    }
    self.len += 1;
  }

  /// Unlinks `timer` from the bucket at `instant`, dropping the bucket if it
  /// empties. Silently a no-op when the timer is not present: a cancellation
  /// can race the drain loop, which pops entries before dispatching them.
  pub fn remove(&mut self, instant: Time, timer: &ScheduledTimer<E>) {
    let Ok(i) = self.buckets.binary_search_by(|b| b.instant.cmp(&instant))
    else {
      return;
    };
    let bucket = &mut self.buckets[i];
    let Some(pos) = bucket.timers.iter().position(|t| t.same(timer)) else {
      return;
    };
    bucket.timers.remove(pos);
    self.len -= 1;
    if bucket.timers.is_empty() {
      self.buckets.remove(i);
    }
  }

  /// The earliest-due timer, ties broken by insertion order.
  pub fn peek(&self) -> Option<&ScheduledTimer<E>> {
    self.buckets.first().and_then(|b| b.timers.front())
  }

  /// Unlinks and returns what `peek` would have returned.
  pub fn pop_min(&mut self) -> Option<ScheduledTimer<E>> {
    let bucket = self.buckets.first_mut()?;
    let timer = bucket.timers.pop_front()?;
    self.len -= 1;
    if bucket.timers.is_empty() {
      self.buckets.remove(0);
    }
    Some(timer)
  }

  /// Empties the store for scheduler teardown.
  pub fn take_all(&mut self) -> Vec<ScheduledTimer<E>> {
    self.len = 0;
    self
      .buckets
      .drain(..)
      .flat_map(|b| b.timers.into_iter())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::TestEngine;
  use crate::timer::EventLoopTimer;
  use crate::timer::FireDecision;
  use crate::timer::SubsystemTimer;
  use std::sync::Arc;

  struct Probe(EventLoopTimer);

  impl SubsystemTimer<TestEngine> for Probe {
    fn event_loop_timer(&self) -> &EventLoopTimer {
      &self.0
    }

    fn fire(&self, _now: Time, _engine: &TestEngine) -> FireDecision {
      FireDecision::Disarm
    }
  }

  fn probe() -> ScheduledTimer<TestEngine> {
    ScheduledTimer::Subsystem(Arc::new(Probe(EventLoopTimer::new())))
  }

  fn ms(n: u64) -> Time {
    Time::ZERO.add_ms(n)
  }

  #[test]
  fn pops_in_instant_order() {
    let mut store = TimerStore::new();
    let (a, b, c) = (probe(), probe(), probe());
    store.insert(ms(30), c.clone());
    store.insert(ms(10), a.clone());
    store.insert(ms(20), b.clone());
    assert_eq!(store.len(), 3);
    assert!(store.pop_min().unwrap().same(&a));
    assert!(store.pop_min().unwrap().same(&b));
    assert!(store.pop_min().unwrap().same(&c));
    assert!(store.pop_min().is_none());
    assert_eq!(store.len(), 0);
  }

  #[test]
  fn same_instant_is_fifo() {
    let mut store = TimerStore::new();
    let (a, b, c) = (probe(), probe(), probe());
    store.insert(ms(10), a.clone());
    store.insert(ms(10), b.clone());
    store.insert(ms(10), c.clone());
    assert!(store.peek().unwrap().same(&a));
    assert!(store.pop_min().unwrap().same(&a));
    assert!(store.pop_min().unwrap().same(&b));
    assert!(store.pop_min().unwrap().same(&c));
  }

  #[test]
  fn remove_unlinks_and_drops_empty_buckets() {
    let mut store = TimerStore::new();
    let (a, b) = (probe(), probe());
    store.insert(ms(10), a.clone());
    store.insert(ms(10), b.clone());
    store.remove(ms(10), &a);
    assert_eq!(store.len(), 1);
    assert!(store.peek().unwrap().same(&b));
    store.remove(ms(10), &b);
    assert_eq!(store.len(), 0);
    assert!(store.peek().is_none());
  }

  #[test]
  fn remove_of_absent_timer_is_a_no_op() {
    let mut store = TimerStore::new();
    let (a, b) = (probe(), probe());
    store.insert(ms(10), a.clone());
    // Wrong instant, then right instant but never-inserted timer.
    store.remove(ms(20), &a);
    store.remove(ms(10), &b);
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn take_all_empties_every_bucket() {
    let mut store = TimerStore::new();
    for i in 0..5 {
      store.insert(ms(i * 10), probe());
      store.insert(ms(i * 10), probe());
    }
    assert_eq!(store.take_all().len(), 10);
    assert_eq!(store.len(), 0);
    assert!(store.peek().is_none());
  }
}
