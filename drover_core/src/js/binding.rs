//! Js runtime bindings: context creation and the native functions scripts
//! reach through globals and the internal host object.

pub mod console;
pub mod exec;
pub mod open;
pub mod require;
pub mod shared_array;
pub mod timers;

use crate::prelude::*;

/// Name of the host object carrying the low-level natives the embedded
/// bootstrap wires up.
pub const INTERNAL_OBJECT: &str = "__InternalDroverGlobalObject";

/// Populates a new JavaScript context with low-level Rust bindings.
pub fn create_new_context<'s>(
  scope: &mut v8::HandleScope<'s, ()>,
) -> v8::Local<'s, v8::Context> {
  let context = v8::Context::new(scope);
  let global = context.global(scope);
  let scope = &mut v8::ContextScope::new(scope, context);

  // Init-context-only globals.
  set_function_to(scope, global, "open", open::open);
  set_function_to(scope, global, "require", require::require);

  // The per-VU console.
  console::install(scope, global);

  // Register the internal host object.
  let host = create_object_under(scope, global, INTERNAL_OBJECT);

  {
    set_function_to(scope, host, "timer_create", timers::create_timer);
    set_function_to(scope, host, "timer_clear", timers::clear_timer);
  }

  {
    set_function_to(scope, host, "shared_array_create", shared_array::create);
    set_function_to(scope, host, "shared_array_get", shared_array::get);
    set_function_to(scope, host, "shared_array_len", shared_array::len);
  }

  {
    set_function_to(scope, host, "exec_test_abort", exec::test_abort);
    set_function_to(scope, host, "exec_snapshot", exec::snapshot);
    set_function_to(scope, host, "group_enter", exec::group_enter);
    set_function_to(scope, host, "group_leave", exec::group_leave);
    set_function_to(scope, host, "sleep", exec::sleep);
  }

  context
}

/// Adds a property with the given name and value, into the given object.
pub fn set_property_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &str,
  value: v8::Local<v8::Value>,
) {
  let key = v8::String::new(scope, name).unwrap();
  target.set(scope, key.into(), value);
}

/// Adds a read-only property with the given name and value, into the given
/// object.
pub fn set_constant_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &str,
  value: v8::Local<v8::Value>,
) {
  let key = v8::String::new(scope, name).unwrap();
  target.define_own_property(scope, key.into(), value, v8::PropertyAttribute::READ_ONLY);
}

/// Adds a `Function` object which calls the given Rust function.
pub fn set_function_to(
  scope: &mut v8::HandleScope,
  target: v8::Local<v8::Object>,
  name: &'static str,
  callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
  let key = v8::String::new(scope, name).unwrap();
  let template = v8::FunctionTemplate::new(scope, callback);
  let val = template.get_function(scope).unwrap();

  target.set(scope, key.into(), val.into());
}

/// Creates an object with a given name under a `target` object.
pub fn create_object_under<'s>(
  scope: &mut v8::HandleScope<'s>,
  target: v8::Local<v8::Object>,
  name: &'static str,
) -> v8::Local<'s, v8::Object> {
  let template = v8::ObjectTemplate::new(scope);
  let key = v8::String::new(scope, name).unwrap();
  let value = template.new_instance(scope).unwrap();

  target.set(scope, key.into(), value.into());
  value
}

/// Useful utility to throw v8 exceptions.
pub fn throw_error(scope: &mut v8::HandleScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::error(scope, message);
  scope.throw_exception(exception);
}

/// Useful utility to throw v8 type errors.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::type_error(scope, message);
  scope.throw_exception(exception);
}

/// Sets a numeric global (`__VU`, `__ITER`).
pub fn set_number_global(scope: &mut v8::HandleScope, name: &str, value: f64) {
  let context = scope.get_current_context();
  let global = context.global(scope);
  let key = v8::String::new(scope, name).unwrap();
  let value = v8::Number::new(scope, value);
  global.set(scope, key.into(), value.into());
}

/// Sets `__ENV` from the composed environment map.
pub fn set_env_global(scope: &mut v8::HandleScope, env: &HashMap<String, String>) {
  let context = scope.get_current_context();
  let global = context.global(scope);
  let obj = v8::Object::new(scope);
  for (k, v) in env {
    let key = v8::String::new(scope, k).unwrap();
    let value = v8::String::new(scope, v).unwrap();
    obj.set(scope, key.into(), value.into());
  }
  let key = v8::String::new(scope, "__ENV").unwrap();
  global.set(scope, key.into(), obj.into());
}

/// Reads a global by name.
pub fn get_global<'s>(
  scope: &mut v8::HandleScope<'s>,
  name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
  let context = scope.get_current_context();
  let global = context.global(scope);
  let key = v8::String::new(scope, name)?;
  global.get(scope, key.into())
}

/// Reads a property of the internal host object (used for shim-defined
/// helpers like the SharedArray constructor).
pub fn get_host_property<'s>(
  scope: &mut v8::HandleScope<'s>,
  name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
  let host = get_global(scope, INTERNAL_OBJECT)?;
  let host = host.to_object(scope)?;
  let key = v8::String::new(scope, name)?;
  host.get(scope, key.into())
}
