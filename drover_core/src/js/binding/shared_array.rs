//! Natives behind the SharedArray constructor and its read-only view.

use crate::errext::InitContextError;
use crate::js::binding::{throw_error, throw_type_error};
use crate::js::JsRuntime;
use crate::prelude::*;

/// `(name, producer) -> length`. Runs the producer at most once per
/// (test run, name); subsequent constructions under the same name reuse the
/// stored encoding without calling the producer again.
pub fn create(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);

  {
    let state = state_rc.borrow();
    if !state.bag.in_init_context {
      throw_error(scope, "new SharedArray must be called in the init context");
      return;
    }
  }

  if args.length() < 1 || !args.get(0).is_string() {
    throw_type_error(scope, "SharedArray requires a name");
    return;
  }
  let name = args.get(0).to_rust_string_lossy(scope);
  if name.is_empty() {
    throw_error(scope, "empty name provided to SharedArray's constructor");
    return;
  }

  let Ok(producer) = v8::Local::<v8::Function>::try_from(args.get(1)) else {
    throw_type_error(scope, "SharedArray requires a producer function");
    return;
  };

  let registry = state_rc.borrow().bag.shared_arrays.clone();

  let data = registry.get_or_create(&name, || {
    let undefined = v8::undefined(scope).into();
    let tc_scope = &mut v8::TryCatch::new(scope);
    let result = match producer.call(tc_scope, undefined, &[]) {
      Some(result) => result,
      None => {
        let err = crate::js::err::from_try_catch(tc_scope, None);
        return Err(anyhow::anyhow!("{err}"));
      }
    };

    if !result.is_array() {
      return Err(anyhow::anyhow!("only arrays can be made into SharedArray"));
    }
    let arr = v8::Local::<v8::Array>::try_from(result).unwrap();

    let mut encoded = Vec::with_capacity(arr.length() as usize);
    for i in 0..arr.length() {
      let element = arr
        .get_index(tc_scope, i)
        .unwrap_or_else(|| v8::undefined(tc_scope).into());
      match v8::json::stringify(tc_scope, element) {
        Some(json) => encoded.push(json.to_rust_string_lossy(tc_scope)),
        None => encoded.push("null".to_string()),
      }
    }
    Ok(encoded)
  });

  let data = match data {
    Ok(data) => data,
    Err(e) => {
      throw_error(scope, &e.to_string());
      return;
    }
  };

  rv.set(v8::Integer::new(scope, data.len() as i32).into());
}

/// `(name, index) -> JSON string` of the element.
pub fn get(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let name = args.get(0).to_rust_string_lossy(scope);
  let index = args.get(1).int32_value(scope).unwrap_or(-1);

  let registry = JsRuntime::state(scope).borrow().bag.shared_arrays.clone();
  let Some(data) = registry.get(&name) else {
    throw_error(scope, &format!("unknown SharedArray {name:?}"));
    return;
  };
  if index < 0 || index as usize >= data.len() {
    rv.set(v8::undefined(scope).into());
    return;
  }
  let json = v8::String::new(scope, &data[index as usize]).unwrap();
  rv.set(json.into());
}

/// `(name) -> length`.
pub fn len(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let name = args.get(0).to_rust_string_lossy(scope);
  let registry = JsRuntime::state(scope).borrow().bag.shared_arrays.clone();
  let Some(data) = registry.get(&name) else {
    throw_error(scope, &format!("unknown SharedArray {name:?}"));
    return;
  };
  rv.set(v8::Integer::new(scope, data.len() as i32).into());
}
