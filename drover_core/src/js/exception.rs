//! Uncaught exception and unhandled promise-rejection tracking for one
//! isolate.

#[derive(Default)]
pub struct ExceptionState {
  /// The first uncaught exception captured since the last check.
  pub exception: Option<v8::Global<v8::Value>>,
  /// Rejected promises with no handler attached yet, in rejection order.
  promise_rejections: Vec<(v8::Global<v8::Promise>, v8::Global<v8::Value>)>,
}

impl ExceptionState {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn capture_exception(&mut self, exception: v8::Global<v8::Value>) {
    if self.exception.is_none() {
      self.exception = Some(exception);
    }
  }

  pub fn capture_promise_rejection(
    &mut self,
    promise: v8::Global<v8::Promise>,
    reason: v8::Global<v8::Value>,
  ) {
    if !self.promise_rejections.iter().any(|(p, _)| *p == promise) {
      self.promise_rejections.push((promise, reason));
    }
  }

  /// A handler was attached after all; the rejection is no longer
  /// unhandled.
  pub fn remove_promise_rejection(&mut self, promise: &v8::Global<v8::Promise>) {
    self.promise_rejections.retain(|(p, _)| p != promise);
  }

  /// Drops rejections carrying exactly this value. Needed when a module
  /// evaluation error doubles as a promise rejection.
  pub fn remove_promise_rejection_entry(&mut self, value: &v8::Global<v8::Value>) {
    self.promise_rejections.retain(|(_, v)| v != value);
  }

  pub fn has_promise_rejection(&self) -> bool {
    !self.promise_rejections.is_empty()
  }

  pub fn pop_promise_rejection(
    &mut self,
  ) -> Option<(v8::Global<v8::Promise>, v8::Global<v8::Value>)> {
    if self.promise_rejections.is_empty() {
      None
    } else {
      Some(self.promise_rejections.remove(0))
    }
  }
}
