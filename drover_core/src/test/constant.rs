#[cfg(test)]
use parking_lot::{Mutex, MutexGuard};

#[cfg(test)]
static GLOBAL_SEQUENTIAL_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that drive V8 isolates; keeps engine-level state and
/// timing assertions deterministic.
#[cfg(test)]
pub fn acquire_sequential_guard() -> MutexGuard<'static, ()> {
  GLOBAL_SEQUENTIAL_LOCK.lock()
}
