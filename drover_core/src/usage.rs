//! Lightweight feature-usage counters, reported at the end of a run.

use crate::prelude::*;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum UsageValue {
  Count(u64),
  Text(String),
}

/// Append-mostly usage bag shared by the whole run.
#[derive(Default)]
pub struct Usage {
  entries: Mutex<HashMap<String, UsageValue>>,
}

impl Usage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn count(&self, key: &str, delta: u64) {
    let mut entries = self.entries.lock();
    match entries
      .entry(key.to_string())
      .or_insert(UsageValue::Count(0))
    {
      UsageValue::Count(n) => *n += delta,
      UsageValue::Text(_) => {}
    }
  }

  pub fn set_text(&self, key: &str, value: impl Into<String>) {
    self
      .entries
      .lock()
      .insert(key.to_string(), UsageValue::Text(value.into()));
  }

  pub fn snapshot(&self) -> HashMap<String, UsageValue> {
    self.entries.lock().clone()
  }
}

#[cfg(test)]
mod usage_tests {
  use super::*;

  #[test]
  fn count1() {
    let usage = Usage::new();
    usage.count("vus", 1);
    usage.count("vus", 2);
    usage.set_text("executor", "constant-vus");
    let snap = usage.snapshot();
    assert_eq!(snap.get("vus"), Some(&UsageValue::Count(3)));
    assert_eq!(
      snap.get("executor"),
      Some(&UsageValue::Text("constant-vus".into()))
    );
  }
}
