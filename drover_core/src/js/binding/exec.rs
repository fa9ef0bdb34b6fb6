//! Natives behind the `k6` and `k6/execution` builtins: blocking sleep,
//! group tagging, test aborts and VU/scenario introspection.

use crate::errext::InterruptError;
use crate::js::binding::throw_error;
use crate::js::{InterruptReason, JsRuntime};
use crate::types::SystemTag;

use serde_json::json;
use std::time::Duration;

/// `sleep(seconds)`: blocks the VU, preemptible by interruption.
pub fn sleep(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let secs = args.get(0).number_value(scope).unwrap_or(0.0);
  if !secs.is_finite() || secs <= 0.0 {
    return;
  }
  let interrupt = JsRuntime::state(scope).borrow().bag.interrupt.clone();
  // Returns early when interrupted; the pending termination then unwinds
  // the script at the next interpreter check.
  interrupt.wait_interruptible(Duration::from_secs_f64(secs));
}

/// `exec.test.abort([reason])`: interrupts the isolate with an
/// [`InterruptError`] so the abort survives the trip through the event
/// loop.
pub fn test_abort(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let reason = if args.length() > 0 && args.get(0).is_string() {
    Some(args.get(0).to_rust_string_lossy(scope))
  } else {
    None
  };
  let err = InterruptError::new(reason.as_deref());

  let state_rc = JsRuntime::state(scope);
  let (interrupt, loop_shared) = {
    let state = state_rc.borrow();
    (state.bag.interrupt.clone(), state.bag.loop_shared.clone())
  };
  interrupt.interrupt(InterruptReason::Abort(err));
  loop_shared.wake();
}

/// Snapshot of the execution state, JSON-encoded for the module shim.
pub fn snapshot(
  scope: &mut v8::HandleScope,
  _args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  let Some(vu_state) = state.bag.state.as_ref() else {
    drop(state);
    throw_error(
      scope,
      "getting VU information in the init context is not supported",
    );
    return;
  };

  let scenario = vu_state.scenario.lock().clone();
  let value = json!({
    "vu": {
      "idInTest": vu_state.vu_id_global,
      "idInInstance": vu_state.vu_id,
      "iterationInInstance": vu_state.iteration(),
      "iterationInScenario": encode_counter(scenario.iteration_local),
    },
    "scenario": {
      "name": scenario.name,
      "iterationInTest": encode_counter(scenario.iteration_global),
    },
  });

  drop(state);
  let json = v8::String::new(scope, &value.to_string()).unwrap();
  rv.set(json.into());
}

/// The `u64::MAX` sentinel means "unknown" and maps to JSON null.
fn encode_counter(value: u64) -> serde_json::Value {
  if value == u64::MAX {
    serde_json::Value::Null
  } else {
    serde_json::Value::from(value)
  }
}

/// Enters a `group(name, fn)` scope: appends to the group path tag.
pub fn group_enter(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let name = args.get(0).to_rust_string_lossy(scope);
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  let Some(vu_state) = state.bag.state.as_ref() else {
    return;
  };

  let mut groups = vu_state.group_stack.lock();
  groups.push(name);
  let path = format!("::{}", groups.join("::"));
  drop(groups);

  if vu_state.options.system_tag_enabled(SystemTag::Group) {
    vu_state.tags.lock().set_system_tag(SystemTag::Group, path);
  }
}

/// Leaves the innermost group scope.
pub fn group_leave(
  scope: &mut v8::HandleScope,
  _args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();
  let Some(vu_state) = state.bag.state.as_ref() else {
    return;
  };

  let mut groups = vu_state.group_stack.lock();
  groups.pop();
  let path = if groups.is_empty() {
    String::new()
  } else {
    format!("::{}", groups.join("::"))
  };
  drop(groups);

  if vu_state.options.system_tag_enabled(SystemTag::Group) {
    vu_state.tags.lock().set_system_tag(SystemTag::Group, path);
  }
}
