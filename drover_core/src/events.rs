//! Lifecycle events: global test phases and per-VU iteration markers.
//! Emitters can wait, with a bound, until every subscriber acknowledges.

use crate::prelude::*;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
  // Global events.
  Init,
  TestStart,
  TestEnd,
  Exit,
  // Per-VU events.
  IterStart,
  IterEnd,
}

#[derive(Debug, Clone, Default)]
pub struct ExitData {
  pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IterData {
  pub iteration: i64,
  pub vu_id: u64,
  pub scenario_name: String,
  pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EventData {
  None,
  Exit(ExitData),
  Iteration(IterData),
}

struct DoneBarrier {
  remaining: Mutex<usize>,
  cond: Condvar,
}

impl DoneBarrier {
  fn new(count: usize) -> Self {
    Self {
      remaining: Mutex::new(count),
      cond: Condvar::new(),
    }
  }

  fn done(&self) {
    let mut remaining = self.remaining.lock();
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
      self.cond.notify_all();
    }
  }

  fn wait(&self, timeout: Duration) -> bool {
    let mut remaining = self.remaining.lock();
    while *remaining > 0 {
      if self.cond.wait_for(&mut remaining, timeout).timed_out() {
        return *remaining == 0;
      }
    }
    true
  }
}

/// A delivered event. Subscribers must call [`Event::done`] once processed
/// so the emitter's wait can return.
#[derive(Clone)]
pub struct Event {
  pub event_type: EventType,
  pub data: EventData,
  barrier: Arc<DoneBarrier>,
}

impl Event {
  pub fn done(&self) {
    self.barrier.done();
  }
}

impl std::fmt::Debug for Event {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Event")
      .field("event_type", &self.event_type)
      .field("data", &self.data)
      .finish()
  }
}

/// Handle returned by [`System::emit`]; waiting blocks until all
/// subscribers acked or the bound expires.
pub struct EventDone {
  barrier: Arc<DoneBarrier>,
  event_type: EventType,
}

impl EventDone {
  /// Returns `false` when the bound expired with acknowledgements missing.
  pub fn wait(&self, timeout: Duration) -> bool {
    let ok = self.barrier.wait(timeout);
    if !ok {
      warn!(
        "timed out waiting for event {:?} processing to finish",
        self.event_type
      );
    }
    ok
  }
}

struct Subscriber {
  id: u64,
  events: HashSet<EventType>,
  tx: UnboundedSender<Event>,
}

/// Event fan-out hub. One global instance per test run; per-VU events go
/// through the same hub carrying the VU id in their data.
#[derive(Default)]
pub struct System {
  subscribers: RwLock<Vec<Subscriber>>,
  next_id: AtomicU64,
}

impl System {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, events: &[EventType]) -> (u64, UnboundedReceiver<Event>) {
    let (tx, rx) = unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    self.subscribers.write().push(Subscriber {
      id,
      events: events.iter().copied().collect(),
      tx,
    });
    (id, rx)
  }

  pub fn unsubscribe(&self, id: u64) {
    self.subscribers.write().retain(|s| s.id != id);
  }

  pub fn emit(&self, event_type: EventType, data: EventData) -> EventDone {
    let subscribers = self.subscribers.read();
    let interested: Vec<&Subscriber> = subscribers
      .iter()
      .filter(|s| s.events.contains(&event_type))
      .collect();

    let barrier = Arc::new(DoneBarrier::new(interested.len()));
    for sub in interested {
      let event = Event {
        event_type,
        data: data.clone(),
        barrier: barrier.clone(),
      };
      // A dropped receiver counts as processed.
      if sub.tx.send(event).is_err() {
        barrier.done();
      }
    }
    EventDone {
      barrier,
      event_type,
    }
  }
}

#[cfg(test)]
mod events_tests {
  use super::*;

  #[test]
  fn emit_and_wait1() {
    let system = System::new();
    let (_id, mut rx) = system.subscribe(&[EventType::IterStart]);

    let done = system.emit(
      EventType::IterStart,
      EventData::Iteration(IterData {
        iteration: 0,
        vu_id: 1,
        scenario_name: "default".to_string(),
        error: None,
      }),
    );

    let handle = std::thread::spawn(move || {
      let event = rx.blocking_recv().unwrap();
      assert_eq!(event.event_type, EventType::IterStart);
      event.done();
    });

    assert!(done.wait(Duration::from_secs(5)));
    handle.join().unwrap();
  }

  #[test]
  fn emit_no_subscribers1() {
    let system = System::new();
    let done = system.emit(EventType::TestStart, EventData::None);
    assert!(done.wait(Duration::from_millis(10)));
  }

  #[test]
  fn emit_wrong_subscription1() {
    let system = System::new();
    let (_id, _rx) = system.subscribe(&[EventType::TestEnd]);
    // Nobody listens for IterEnd, so the wait returns immediately.
    let done = system.emit(EventType::IterEnd, EventData::None);
    assert!(done.wait(Duration::from_millis(10)));
  }

  #[test]
  fn unsubscribe1() {
    let system = System::new();
    let (id, rx) = system.subscribe(&[EventType::Exit]);
    drop(rx);
    system.unsubscribe(id);
    let done = system.emit(EventType::Exit, EventData::Exit(ExitData::default()));
    assert!(done.wait(Duration::from_millis(10)));
  }
}
