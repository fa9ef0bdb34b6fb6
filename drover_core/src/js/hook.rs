//! Js runtime hooks: module resolution, import.meta, dynamic import and
//! promise rejections.

use crate::js::binding::throw_type_error;
use crate::js::err;
use crate::js::module::{create_origin, fetch_module_tree};
use crate::js::JsRuntime;
use crate::prelude::*;
use url::Url;

/// Called during `Module::instantiate_module`. Every dependency was already
/// compiled by the eager graph fetch, so this is a pure lookup; returning
/// the live record even for modules mid-evaluation is what closes cycles.
pub fn module_resolve_cb<'a>(
  context: v8::Local<'a, v8::Context>,
  specifier: v8::Local<'a, v8::String>,
  _import_attributes: v8::Local<'a, v8::FixedArray>,
  referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
  let scope = &mut unsafe { v8::CallbackScope::new(context) };
  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();

  let referrer = v8::Global::new(scope, referrer);
  let base_key = state.module_map.get_key(&referrer);
  let base = base_key.as_deref().and_then(|k| Url::parse(k).ok());

  let specifier = specifier.to_rust_string_lossy(scope);
  let resolved = state.bag.resolver.resolve(base.as_ref(), &specifier).ok()?;
  trace!("|module_resolve_cb| referrer:{base_key:?}, specifier:{resolved:?}");

  let module = state.module_map.get(&resolved)?;
  Some(v8::Local::new(scope, module))
}

/// Called the first time `import.meta` is accessed for a module.
pub extern "C" fn host_initialize_import_meta_object_cb(
  context: v8::Local<v8::Context>,
  module: v8::Local<v8::Module>,
  meta: v8::Local<v8::Object>,
) {
  let scope = &mut unsafe { v8::CallbackScope::new(context) };
  let scope = &mut v8::HandleScope::new(scope);

  let state_rc = JsRuntime::state(scope);
  let state = state_rc.borrow();

  let module = v8::Global::new(scope, module);
  let Some(key) = state.module_map.get_key(&module) else {
    return;
  };
  let is_main = state.module_map.main().clone() == Some(key.clone());
  drop(state);

  let url_key = v8::String::new(scope, "url").unwrap();
  let url_value = v8::String::new(scope, &key).unwrap();
  meta.create_data_property(scope, url_key.into(), url_value.into());

  let main_key = v8::String::new(scope, "main").unwrap();
  let main_value = v8::Boolean::new(scope, is_main);
  meta.create_data_property(scope, main_key.into(), main_value.into());

  // import.meta.resolve(spec) resolves relative to this module's URL and
  // returns the absolute URL string.
  let data = v8::String::new(scope, &key).unwrap();
  let builder = v8::FunctionBuilder::new(import_meta_resolve).data(data.into());
  let resolve_key = v8::String::new(scope, "resolve").unwrap();
  let resolve_value = v8::FunctionBuilder::<v8::Function>::build(builder, scope).unwrap();
  meta.set(scope, resolve_key.into(), resolve_value.into());
}

fn import_meta_resolve(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  if args.length() == 0 {
    throw_type_error(scope, "Not enough arguments specified.");
    return;
  }

  let base_key = args.data().to_rust_string_lossy(scope);
  let base = Url::parse(&base_key).ok();
  let specifier = args.get(0).to_rust_string_lossy(scope);

  let resolver = JsRuntime::state(scope).borrow().bag.resolver.clone();
  match resolver.resolve(base.as_ref(), &specifier) {
    Ok(resolved) => rv.set(v8::String::new(scope, &resolved).unwrap().into()),
    Err(e) => throw_type_error(scope, &e.to_string()),
  }
}

/// Called when a promise rejects with no rejection handler attached.
pub extern "C" fn promise_reject_cb(message: v8::PromiseRejectMessage) {
  let scope = &mut unsafe { v8::CallbackScope::new(&message) };
  let undefined = v8::undefined(scope).into();
  let event = message.get_event();

  use v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject;
  use v8::PromiseRejectEvent::PromiseRejectAfterResolved;
  use v8::PromiseRejectEvent::PromiseRejectWithNoHandler;
  use v8::PromiseRejectEvent::PromiseResolveAfterResolved;

  let reason = match event {
    PromiseHandlerAddedAfterReject
    | PromiseRejectAfterResolved
    | PromiseResolveAfterResolved => undefined,
    PromiseRejectWithNoHandler => message.get_value().unwrap(),
  };

  let promise = message.get_promise();
  let promise = v8::Global::new(scope, promise);

  let state_rc = JsRuntime::state(scope);
  let mut state = state_rc.borrow_mut();

  match event {
    PromiseRejectWithNoHandler => {
      let reason = v8::Global::new(scope, reason);
      state.exceptions.capture_promise_rejection(promise, reason);
    }
    PromiseHandlerAddedAfterReject => {
      state.exceptions.remove_promise_rejection(&promise);
    }
    PromiseRejectAfterResolved | PromiseResolveAfterResolved => {}
  }
}

/// Dynamic `import()`. Module sources live on local filesystems (or in the
/// archive), so resolution completes synchronously; the returned promise is
/// settled before this callback returns.
pub fn host_import_module_dynamically_cb<'s>(
  scope: &mut v8::HandleScope<'s>,
  _host_defined_options: v8::Local<'s, v8::Data>,
  resource_name: v8::Local<'s, v8::Value>,
  specifier: v8::Local<'s, v8::String>,
  _import_attributes: v8::Local<v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
  let promise_resolver = v8::PromiseResolver::new(scope)?;
  let promise = promise_resolver.get_promise(scope);

  let base_key = resource_name.to_rust_string_lossy(scope);
  let base = Url::parse(&base_key).ok();
  let specifier = specifier.to_rust_string_lossy(scope);

  let resolver = JsRuntime::state(scope).borrow().bag.resolver.clone();
  let resolved = match resolver.resolve(base.as_ref(), &specifier) {
    Ok(resolved) => resolved,
    Err(e) => {
      let message = v8::String::new(scope, &e.to_string()).unwrap();
      let exception = v8::Exception::error(scope, message);
      promise_resolver.reject(scope, exception);
      return Some(promise);
    }
  };
  trace!("|host_import_module_dynamically_cb| base:{base_key:?}, resolved:{resolved:?}");

  let tc_scope = &mut v8::TryCatch::new(scope);

  let module = match fetch_module_tree(tc_scope, &resolved, None) {
    Some(module) => module,
    None => {
      let exception = tc_scope
        .exception()
        .unwrap_or_else(|| v8::undefined(tc_scope).into());
      promise_resolver.reject(tc_scope, exception);
      return Some(promise);
    }
  };

  if module.get_status() == v8::ModuleStatus::Uninstantiated
    && module
      .instantiate_module(tc_scope, module_resolve_cb)
      .is_none()
  {
    let exception = tc_scope
      .exception()
      .unwrap_or_else(|| v8::undefined(tc_scope).into());
    promise_resolver.reject(tc_scope, exception);
    return Some(promise);
  }

  if module.get_status() == v8::ModuleStatus::Instantiated {
    let _ = module.evaluate(tc_scope);
  }

  if module.get_status() == v8::ModuleStatus::Errored {
    let exception = module.get_exception();
    // The rejection also reaches promise_reject_cb; drop the duplicate so
    // it doesn't surface as a second, unrelated error.
    let exception_ref = v8::Global::new(tc_scope, exception);
    let state_rc = JsRuntime::state(tc_scope);
    state_rc
      .borrow_mut()
      .exceptions
      .remove_promise_rejection_entry(&exception_ref);
    promise_resolver.reject(tc_scope, exception);
    return Some(promise);
  }

  let namespace = module.get_module_namespace();
  promise_resolver.resolve(tc_scope, namespace);
  Some(promise)
}

/// Compiles and runs a classic (non-module) script in the isolate; used for
/// the embedded wrappers.
pub fn execute_script<'s>(
  scope: &mut v8::HandleScope<'s>,
  name: &str,
  source: &str,
) -> AnyResult<v8::Local<'s, v8::Value>> {
  let result = {
    let tc_scope = &mut v8::TryCatch::new(scope);
    let origin = create_origin(tc_scope, name, false);
    let code = v8::String::new(tc_scope, source)
      .ok_or_else(|| anyhow::anyhow!("script source too large"))?;

    let script = match v8::Script::compile(tc_scope, code, Some(&origin)) {
      Some(script) => script,
      None => return Err(err::from_try_catch(tc_scope, None).into()),
    };
    match script.run(tc_scope) {
      Some(value) => v8::Global::new(tc_scope, value),
      None => return Err(err::from_try_catch(tc_scope, None).into()),
    }
  };
  Ok(v8::Local::new(scope, result))
}
