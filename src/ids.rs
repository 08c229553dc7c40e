// Copyright 2018-2025 the Deno authors. MIT license.

//! JS-visible timer identity and async-id packing.

/// Which `set*` entry point handed a timer out. Determines the ID map a
/// `clear*` lookup consults and how the timer is dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
  Timeout = 0,
  Interval = 1,
  Immediate = 2,
}

impl TimerKind {
  pub(crate) const COUNT: usize = 3;

  pub(crate) fn index(self) -> usize {
    self as usize
  }

  fn from_u32(value: u32) -> Option<TimerKind> {
    match value {
      0 => Some(TimerKind::Timeout),
      1 => Some(TimerKind::Interval),
      2 => Some(TimerKind::Immediate),
      _ => None,
    }
  }
}

/// A JS timer's identity: the `i32` id scripts see plus the kind it was
/// handed out for. Packs into the 64-bit async id the inspector correlates
/// schedule, dispatch, and cancel events with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
  pub id: i32,
  pub kind: TimerKind,
}

impl TimerId {
  pub fn new(id: i32, kind: TimerKind) -> TimerId {
    TimerId { id, kind }
  }

  /// `{ i32 id, u32 kind }` packed into 64 bits, kind in the high word.
  pub fn async_id(self) -> u64 {
    ((self.kind as u32 as u64) << 32) | self.id as u32 as u64
  }

  pub fn from_async_id(value: u64) -> Option<TimerId> {
    let kind = TimerKind::from_u32((value >> 32) as u32)?;
    Some(TimerId {
      id: value as u32 as i32,
      kind,
    })
  }
}

/// Parses a string id for `clear*`.
///
/// Only the canonical form the runtime itself would have produced is
/// accepted: ASCII digits, no sign, no leading zero, no surrounding
/// whitespace, value at least 1 (ids start at 1), in `i32` range. Anything
/// else misses, matching property-key lookup semantics on the host side.
pub fn parse_canonical_id(s: &str) -> Option<i32> {
  let bytes = s.as_bytes();
  if bytes.is_empty() || bytes[0] == b'0' {
    return None;
  }
  if !bytes.iter().all(|b| b.is_ascii_digit()) {
    return None;
  }
  s.parse::<i32>().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn async_id_round_trips() {
    for kind in [TimerKind::Timeout, TimerKind::Interval, TimerKind::Immediate]
    {
      let id = TimerId::new(12345, kind);
      assert_eq!(TimerId::from_async_id(id.async_id()), Some(id));
    }
    // Wrapped ids survive the i32 <-> u32 packing.
    let id = TimerId::new(-7, TimerKind::Timeout);
    assert_eq!(TimerId::from_async_id(id.async_id()), Some(id));
  }

  #[test]
  fn async_id_rejects_unknown_kind() {
    assert_eq!(TimerId::from_async_id(3 << 32), None);
  }

  #[test]
  fn canonical_ids_parse() {
    assert_eq!(parse_canonical_id("1"), Some(1));
    assert_eq!(parse_canonical_id("42"), Some(42));
    assert_eq!(parse_canonical_id("2147483647"), Some(i32::MAX));
  }

  #[test]
  fn non_canonical_ids_miss() {
    // Zero was never assigned; ids start at 1.
    assert_eq!(parse_canonical_id("0"), None);
    assert_eq!(parse_canonical_id(""), None);
    assert_eq!(parse_canonical_id("05"), None);
    assert_eq!(parse_canonical_id("+5"), None);
    assert_eq!(parse_canonical_id("-5"), None);
    assert_eq!(parse_canonical_id(" 5"), None);
    assert_eq!(parse_canonical_id("5 "), None);
    assert_eq!(parse_canonical_id("5x"), None);
    assert_eq!(parse_canonical_id("5.0"), None);
    // Overflows i32.
    assert_eq!(parse_canonical_id("2147483648"), None);
    assert_eq!(parse_canonical_id("99999999999999999999"), None);
  }
}
