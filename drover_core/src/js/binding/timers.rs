//! `setTimeout`/`setInterval` natives and the per-VU timer queue. Timer
//! callbacks re-enter JavaScript only through the event loop; one waiter
//! task per VU watches the earliest deadline, so firing order is strictly
//! (deadline, insertion) ordered.

use crate::eventloop::RegisteredCallback;
use crate::js::JsRuntime;
use crate::prelude::*;

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct TimerEntry {
  pub cb: v8::Global<v8::Function>,
  pub args: Vec<v8::Global<v8::Value>>,
  pub repeated: bool,
  pub delay: Duration,
  pub kind: &'static str,
}

/// Bookkeeping living on the JS thread, inside the runtime bag.
pub struct Timers {
  next_id: i32,
  pub entries: HashMap<i32, TimerEntry>,
  pub wheel: Arc<TimerWheel>,
}

impl Timers {
  pub fn new() -> Self {
    Self {
      next_id: 0,
      entries: HashMap::new(),
      wheel: Arc::new(TimerWheel::new()),
    }
  }

  fn alloc_id(&mut self) -> i32 {
    self.next_id += 1;
    self.next_id
  }
}

impl Drop for Timers {
  fn drop(&mut self) {
    self.wheel.shutdown();
  }
}

struct Scheduled {
  deadline: Instant,
  seq: u64,
  id: i32,
  kind: &'static str,
  callback: Option<RegisteredCallback>,
}

impl PartialEq for Scheduled {
  fn eq(&self, other: &Self) -> bool {
    self.deadline == other.deadline && self.seq == other.seq
  }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for Scheduled {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // Deadline first; insertion order breaks ties.
    (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
  }
}

#[derive(Default)]
struct WheelInner {
  heap: BinaryHeap<Reverse<Scheduled>>,
  seq: u64,
}

/// The deadline-sorted queue shared between the JS thread and the waiter
/// task running on the Runner's tokio runtime.
pub struct TimerWheel {
  inner: Mutex<WheelInner>,
  notify: Notify,
  started: AtomicBool,
  shutdown: AtomicBool,
}

impl TimerWheel {
  fn new() -> Self {
    Self {
      inner: Mutex::new(WheelInner::default()),
      notify: Notify::new(),
      started: AtomicBool::new(false),
      shutdown: AtomicBool::new(false),
    }
  }

  pub fn schedule(
    self: &Arc<Self>,
    id: i32,
    kind: &'static str,
    delay: Duration,
    callback: RegisteredCallback,
    tokio_handle: &tokio::runtime::Handle,
  ) {
    {
      let mut inner = self.inner.lock();
      inner.seq += 1;
      let seq = inner.seq;
      inner.heap.push(Reverse(Scheduled {
        deadline: Instant::now() + delay,
        seq,
        id,
        kind,
        callback: Some(callback),
      }));
    }
    if !self.started.swap(true, Ordering::SeqCst) {
      let wheel = self.clone();
      tokio_handle.spawn(async move { wheel.run().await });
    }
    self.notify.notify_one();
  }

  /// Removes one timer. Its event-loop slot is released immediately with a
  /// no-op so a finished iteration isn't pinned to the old deadline.
  pub fn cancel(&self, id: i32) {
    let mut inner = self.inner.lock();
    let drained = std::mem::take(&mut inner.heap);
    for Reverse(mut entry) in drained.into_sorted_vec() {
      if entry.id == id {
        if let Some(cb) = entry.callback.take() {
          cb.invoke_noop();
        }
      } else {
        inner.heap.push(Reverse(entry));
      }
    }
    drop(inner);
    self.notify.notify_one();
  }

  /// Clears everything; used when a VU iteration is interrupted.
  pub fn clear_all(&self) {
    let drained = std::mem::take(&mut self.inner.lock().heap);
    for Reverse(mut entry) in drained.into_vec() {
      warn!(
        "{} {} was stopped because the VU iteration was interrupted",
        entry.kind, entry.id
      );
      if let Some(cb) = entry.callback.take() {
        cb.invoke_noop();
      }
    }
    self.notify.notify_one();
  }

  pub fn shutdown(&self) {
    self.shutdown.store(true, Ordering::SeqCst);
    self.clear_all();
  }

  async fn run(self: Arc<Self>) {
    loop {
      if self.shutdown.load(Ordering::SeqCst) {
        return;
      }

      let next_deadline = {
        let inner = self.inner.lock();
        inner.heap.peek().map(|Reverse(s)| s.deadline)
      };

      match next_deadline {
        None => self.notify.notified().await,
        Some(deadline) => {
          tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = self.notify.notified() => continue,
          }
          let mut due = vec![];
          {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            while matches!(inner.heap.peek(), Some(Reverse(top)) if top.deadline <= now) {
              due.push(inner.heap.pop().unwrap().0);
            }
          }
          for mut entry in due {
            let id = entry.id;
            if let Some(cb) = entry.callback.take() {
              cb.invoke(Box::new(move |scope| fire_timer(scope, id)));
            }
          }
        }
      }
    }
  }
}

/// Runs one timer's JS callback on the event loop; intervals re-arm
/// themselves afterwards.
fn fire_timer(scope: &mut v8::HandleScope, id: i32) -> AnyResult<()> {
  let state_rc = JsRuntime::state(scope);

  let (cb, args) = {
    let state = state_rc.borrow();
    match state.bag.timers.entries.get(&id) {
      // Cleared between scheduling and firing.
      None => return Ok(()),
      Some(entry) => (entry.cb.clone(), entry.args.clone()),
    }
  };

  let callback = v8::Local::new(scope, cb);
  let args: Vec<v8::Local<v8::Value>> =
    args.iter().map(|arg| v8::Local::new(scope, arg)).collect();
  let undefined = v8::undefined(scope).into();

  {
    let tc_scope = &mut v8::TryCatch::new(scope);
    callback.call(tc_scope, undefined, &args);
    if tc_scope.has_caught() {
      if tc_scope.has_terminated() {
        anyhow::bail!("timer callback interrupted");
      }
      let exception = tc_scope.exception().unwrap();
      let exception = v8::Global::new(tc_scope, exception);
      state_rc.borrow_mut().exceptions.capture_exception(exception);
    }
  }

  // Re-arm intervals, drop one-shots.
  let mut state = state_rc.borrow_mut();
  let repeated = state
    .bag
    .timers
    .entries
    .get(&id)
    .map(|e| (e.repeated, e.delay, e.kind));
  match repeated {
    Some((true, delay, kind)) => {
      let handle = state.bag.loop_shared.register();
      let wheel = state.bag.timers.wheel.clone();
      let tokio_handle = state.bag.tokio_handle.clone();
      wheel.schedule(id, kind, delay, handle, &tokio_handle);
    }
    Some((false, _, _)) => {
      state.bag.timers.entries.remove(&id);
    }
    None => {}
  }

  Ok(())
}

/// Native behind `setTimeout`/`setInterval`: `(callback, delayMs, repeated,
/// argsArray) -> id`.
pub fn create_timer(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
    crate::js::binding::throw_type_error(scope, "setTimeout requires a callback function");
    return;
  };
  let callback = v8::Global::new(scope, callback);

  let delay_ms = args
    .get(1)
    .number_value(scope)
    .map(|n| if n.is_finite() && n > 0.0 { n } else { 0.0 })
    .unwrap_or(0.0);
  let delay = Duration::from_millis(delay_ms as u64);
  let repeated = args.get(2).boolean_value(scope);

  let mut timer_args = vec![];
  if let Ok(params) = v8::Local::<v8::Array>::try_from(args.get(3)) {
    for i in 0..params.length() {
      let param = params.get_index(scope, i).unwrap();
      timer_args.push(v8::Global::new(scope, param));
    }
  }

  let state_rc = JsRuntime::state(scope);
  let mut state = state_rc.borrow_mut();
  let kind = if repeated { "setInterval" } else { "setTimeout" };

  let id = state.bag.timers.alloc_id();
  state.bag.timers.entries.insert(
    id,
    TimerEntry {
      cb: callback,
      args: timer_args,
      repeated,
      delay,
      kind,
    },
  );

  let handle = state.bag.loop_shared.register();
  let wheel = state.bag.timers.wheel.clone();
  let tokio_handle = state.bag.tokio_handle.clone();
  wheel.schedule(id, kind, delay, handle, &tokio_handle);

  rv.set(v8::Integer::new(scope, id).into());
}

/// Native behind `clearTimeout`/`clearInterval`.
pub fn clear_timer(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let Some(id) = args.get(0).int32_value(scope) else {
    return;
  };
  let state_rc = JsRuntime::state(scope);
  let mut state = state_rc.borrow_mut();
  state.bag.timers.entries.remove(&id);
  let wheel = state.bag.timers.wheel.clone();
  drop(state);
  wheel.cancel(id);
}
