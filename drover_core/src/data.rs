//! SharedArray storage: immutable, JSON-encoded arrays shared by name
//! across every VU of a test run.

use crate::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;

/// One registry per test run, owned by the Bundle and shared with every
/// isolate instantiated from it. The canonical storage is the list of
/// JSON-encoded elements; isolates parse (and deep-freeze) lazily on read.
#[derive(Default)]
pub struct SharedArrayRegistry {
  arrays: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl SharedArrayRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the stored encoding, running `produce` only if `name` was
  /// never built. Producers are serialized under the registry lock, so
  /// concurrent constructions of the same name coalesce into one call.
  pub fn get_or_create(
    &self,
    name: &str,
    produce: impl FnOnce() -> AnyResult<Vec<String>>,
  ) -> AnyResult<Arc<Vec<String>>> {
    let mut arrays = self.arrays.lock();
    if let Some(existing) = arrays.get(name) {
      return Ok(existing.clone());
    }
    let data = Arc::new(produce()?);
    arrays.insert(name.to_string(), data.clone());
    Ok(data)
  }

  pub fn get(&self, name: &str) -> Option<Arc<Vec<String>>> {
    self.arrays.lock().get(name).cloned()
  }
}

#[cfg(test)]
mod data_tests {
  use super::*;

  #[test]
  fn coalesce1() {
    let registry = SharedArrayRegistry::new();
    let mut calls = 0;
    let first = registry
      .get_or_create("users", || {
        calls += 1;
        Ok(vec!["{\"id\":1}".to_string()])
      })
      .unwrap();
    let second = registry
      .get_or_create("users", || {
        calls += 1;
        Ok(vec![])
      })
      .unwrap();
    assert_eq!(calls, 1);
    assert!(Arc::ptr_eq(&first, &second));
  }

  #[test]
  fn produce_error1() {
    let registry = SharedArrayRegistry::new();
    let err = registry
      .get_or_create("bad", || anyhow::bail!("only arrays can be made into SharedArray"))
      .unwrap_err();
    assert_eq!(err.to_string(), "only arrays can be made into SharedArray");
    // A failed produce leaves no entry behind.
    assert!(registry.get("bad").is_none());
  }
}
