//! Per-VU cooperative event loop. JavaScript microtasks and externally
//! registered callbacks are interleaved on one thread; goroutine-style
//! helpers running elsewhere re-enter only through [`LoopShared::register`].

use crate::js::{check_exceptions, InterruptReason, JsRuntime};
use crate::prelude::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A queued unit of work; runs on the loop thread with the isolate's scope.
pub type TaskFn = Box<dyn FnOnce(&mut v8::HandleScope) -> AnyResult<()> + Send + 'static>;

enum LoopMsg {
  Task(TaskFn),
  Wake,
}

/// The half of the loop that is safe to hand to other threads.
pub struct LoopShared {
  tx: UnboundedSender<LoopMsg>,
  pending: AtomicUsize,
}

impl LoopShared {
  /// Reserves a slot in the loop's lifetime: the loop will not terminate
  /// until the returned handle is invoked (or dropped, which enqueues a
  /// no-op instead).
  pub fn register(self: &Arc<Self>) -> RegisteredCallback {
    self.pending.fetch_add(1, Ordering::SeqCst);
    RegisteredCallback {
      shared: self.clone(),
      fired: false,
    }
  }

  /// Nudges a blocked loop so it re-checks interrupts and exit conditions.
  pub fn wake(&self) {
    let _ = self.tx.send(LoopMsg::Wake);
  }

  fn pending(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }
}

/// One-shot ticket for re-entering the loop from any thread. Invoking
/// consumes it, so a double invocation is impossible by construction.
pub struct RegisteredCallback {
  shared: Arc<LoopShared>,
  fired: bool,
}

impl RegisteredCallback {
  pub fn invoke(mut self, task: TaskFn) {
    self.fired = true;
    let shared = self.shared.clone();
    // The slot is released on the loop thread, right before the task runs;
    // that keeps the exit check consistent with the queue contents.
    let _ = self.shared.tx.send(LoopMsg::Task(Box::new(move |scope| {
      shared.pending.fetch_sub(1, Ordering::SeqCst);
      task(scope)
    })));
  }

  pub fn invoke_noop(self) {
    self.invoke(Box::new(|_| Ok(())));
  }
}

impl Drop for RegisteredCallback {
  fn drop(&mut self) {
    if !self.fired {
      let shared = self.shared.clone();
      let _ = self.shared.tx.send(LoopMsg::Task(Box::new(move |_| {
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(())
      })));
    }
  }
}

/// The loop itself; owned by one VU and driven on that VU's thread.
pub struct EventLoop {
  shared: Arc<LoopShared>,
  rx: UnboundedReceiver<LoopMsg>,
}

impl Default for EventLoop {
  fn default() -> Self {
    EventLoop::new()
  }
}

impl EventLoop {
  pub fn new() -> Self {
    let (tx, rx) = unbounded_channel();
    Self {
      shared: Arc::new(LoopShared {
        tx,
        pending: AtomicUsize::new(0),
      }),
      rx,
    }
  }

  pub fn shared(&self) -> Arc<LoopShared> {
    self.shared.clone()
  }

  /// Runs `initial` on the loop, then alternates microtask drains with
  /// queued registered callbacks until the queue is empty and no
  /// outstanding handles remain. Returns the first error raised; remaining
  /// registered work is left for [`EventLoop::wait_on_registered`].
  pub fn start(
    &mut self,
    rt: &mut JsRuntime,
    initial: impl FnOnce(&mut v8::HandleScope) -> AnyResult<()>,
  ) -> AnyResult<()> {
    let interrupt = rt.interrupt_slot();
    let scope = &mut rt.handle_scope();

    if let Err(e) = initial(scope) {
      return Err(interrupt_override(scope, e));
    }
    if let Some(e) = drain_microtasks(scope) {
      return Err(interrupt_override(scope, e));
    }

    loop {
      if interrupt.is_interrupted() {
        return Err(interrupt_error(scope));
      }

      let msg = match self.rx.try_recv() {
        Ok(msg) => msg,
        Err(TryRecvError::Empty) => {
          if self.shared.pending() == 0 {
            break;
          }
          match self.rx.blocking_recv() {
            Some(msg) => msg,
            None => break,
          }
        }
        Err(TryRecvError::Disconnected) => break,
      };

      match msg {
        LoopMsg::Wake => continue,
        LoopMsg::Task(task) => {
          if let Err(e) = task(scope) {
            return Err(interrupt_override(scope, e));
          }
          if let Some(e) = drain_microtasks(scope) {
            return Err(interrupt_override(scope, e));
          }
        }
      }
    }

    Ok(())
  }

  /// Drains still-registered callbacks after [`EventLoop::start`] returned,
  /// so fire-and-forget helpers can complete or be cleanly discarded.
  /// Errors are logged, never surfaced.
  pub fn wait_on_registered(&mut self, rt: &mut JsRuntime) {
    let scope = &mut rt.handle_scope();
    loop {
      let msg = match self.rx.try_recv() {
        Ok(msg) => msg,
        Err(TryRecvError::Empty) => {
          if self.shared.pending() == 0 {
            return;
          }
          match self.rx.blocking_recv() {
            Some(msg) => msg,
            None => return,
          }
        }
        Err(TryRecvError::Disconnected) => return,
      };
      match msg {
        LoopMsg::Wake => {}
        LoopMsg::Task(task) => {
          if let Err(e) = task(scope) {
            debug!("error in drained event-loop task: {e:#}");
          }
          if let Some(e) = drain_microtasks(scope) {
            debug!("error while draining microtasks: {e:#}");
          }
        }
      }
    }
  }
}

/// Runs the microtask queue to exhaustion and surfaces any uncaught
/// exception or unhandled promise rejection captured along the way.
fn drain_microtasks(scope: &mut v8::HandleScope) -> Option<AnyErr> {
  scope.perform_microtask_checkpoint();
  check_exceptions(scope).map(AnyErr::from)
}

/// When the isolate was terminated from the outside, the interrupt reason
/// is the authoritative error; whatever a task reported is secondary.
fn interrupt_override(scope: &mut v8::HandleScope, fallback: AnyErr) -> AnyErr {
  let state_rc = JsRuntime::state(scope);
  let interrupted = state_rc.borrow().bag.interrupt.is_interrupted();
  if interrupted {
    interrupt_error(scope)
  } else {
    fallback
  }
}

fn interrupt_error(scope: &mut v8::HandleScope) -> AnyErr {
  let state_rc = JsRuntime::state(scope);
  let interrupt = state_rc.borrow().bag.interrupt.clone();
  scope.cancel_terminate_execution();
  match interrupt.reason() {
    Some(InterruptReason::Abort(e)) => e.into(),
    Some(InterruptReason::Canceled) | Some(InterruptReason::Deadline) | None => {
      crate::errext::ContextCanceled.into()
    }
  }
}
