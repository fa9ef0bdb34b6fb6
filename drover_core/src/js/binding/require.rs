//! CommonJS-style `require()`: synchronous, init-context-only module
//! loading with per-specifier export caching and cycle support.

use crate::errext::InitContextError;
use crate::js::binding::{get_global, set_property_to, throw_error};
use crate::js::hook::module_resolve_cb;
use crate::js::module::fetch_module_tree;
use crate::js::JsRuntime;
use crate::prelude::*;
use url::Url;

pub fn require(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);

  {
    let state = state_rc.borrow();
    if !state.bag.in_init_context {
      throw_error(scope, &InitContextError("require".to_string()).to_string());
      return;
    }
  }

  if args.length() == 0 || !args.get(0).is_string() {
    throw_error(scope, "require() expects a module specifier");
    return;
  }
  let specifier = args.get(0).to_rust_string_lossy(scope);

  let (resolver, base) = {
    let state = state_rc.borrow();
    (
      state.bag.resolver.clone(),
      state.bag.module_dir_stack.last().cloned(),
    )
  };

  let resolved = match resolver.resolve(base.as_ref(), &specifier) {
    Ok(resolved) => resolved,
    Err(e) => {
      throw_error(scope, &e.to_string());
      return;
    }
  };

  // Builtins hand out their exports object directly.
  if resolver.is_builtin(&resolved) {
    match crate::modules::instantiate_builtin(scope, &resolved) {
      Ok(exports) => rv.set(v8::Local::new(scope, exports).into()),
      Err(e) => throw_error(scope, &e.to_string()),
    }
    return;
  }

  if let Some(cached) = state_rc.borrow().bag.require_cache.get(&resolved).cloned() {
    rv.set(v8::Local::new(scope, cached));
    return;
  }

  match load_required(scope, &resolved) {
    Some(value) => rv.set(value),
    None => { /* exception already thrown */ }
  }
}

/// Evaluates a required module with fresh `module`/`exports` globals and
/// returns its exports: the ESM namespace when the module used `export`
/// statements, `module.exports` otherwise.
fn load_required<'s>(
  scope: &mut v8::HandleScope<'s>,
  resolved: &str,
) -> Option<v8::Local<'s, v8::Value>> {
  let state_rc = JsRuntime::state(scope);

  // Fresh CommonJS scaffolding, swapped in around the evaluation.
  let saved_module = get_global(scope, "module");
  let saved_exports = get_global(scope, "exports");

  let exports_obj = v8::Object::new(scope);
  let module_obj = v8::Object::new(scope);
  set_property_to(scope, module_obj, "exports", exports_obj.into());
  install_cjs_globals(scope, module_obj.into(), exports_obj.into());

  // Cache the exports object before evaluating so cyclic requires observe
  // the partially-built bindings instead of recursing forever.
  {
    let mut state = state_rc.borrow_mut();
    let cached = v8::Global::new(scope, v8::Local::<v8::Value>::from(exports_obj));
    state.bag.require_cache.insert(resolved.to_string(), cached);
    if let Ok(url) = Url::parse(resolved) {
      state.bag.module_dir_stack.push(url);
    }
  }

  let result = evaluate_required(scope, resolved, module_obj);

  // Restore the outer module's scaffolding no matter what happened.
  {
    let mut state = state_rc.borrow_mut();
    state.bag.module_dir_stack.pop();
  }
  let undefined = v8::undefined(scope).into();
  install_cjs_globals(
    scope,
    saved_module.unwrap_or(undefined),
    saved_exports.unwrap_or(undefined),
  );

  match result {
    Some(value) => {
      state_rc
        .borrow_mut()
        .bag
        .require_cache
        .insert(resolved.to_string(), value.clone());
      Some(v8::Local::new(scope, value))
    }
    None => {
      state_rc.borrow_mut().bag.require_cache.remove(resolved);
      None
    }
  }
}

fn evaluate_required(
  scope: &mut v8::HandleScope,
  resolved: &str,
  module_obj: v8::Local<v8::Object>,
) -> Option<v8::Global<v8::Value>> {
  let tc_scope = &mut v8::TryCatch::new(scope);

  let module = fetch_module_tree(tc_scope, resolved, None)?;

  if module.get_status() == v8::ModuleStatus::Uninstantiated
    && module
      .instantiate_module(tc_scope, module_resolve_cb)
      .is_none()
  {
    return None;
  }
  if module.get_status() == v8::ModuleStatus::Instantiated {
    let _ = module.evaluate(tc_scope);
    tc_scope.perform_microtask_checkpoint();
  }
  if module.get_status() == v8::ModuleStatus::Errored {
    let exception = module.get_exception();
    tc_scope.throw_exception(exception);
    return None;
  }

  // `export` statements win; plain CommonJS modules expose module.exports.
  let namespace = module.get_module_namespace();
  let namespace = namespace.to_object(tc_scope)?;
  let names =
    namespace.get_own_property_names(tc_scope, v8::GetPropertyNamesArgs::default())?;
  if names.length() > 0 {
    return Some(v8::Global::new(
      tc_scope,
      v8::Local::<v8::Value>::from(namespace),
    ));
  }

  let exports_key = v8::String::new(tc_scope, "exports")?;
  let exports = module_obj.get(tc_scope, exports_key.into())?;
  if exports.is_null() {
    crate::js::binding::throw_error(tc_scope, "CommonJS's exports must not be null");
    return None;
  }
  Some(v8::Global::new(tc_scope, exports))
}

fn install_cjs_globals(
  scope: &mut v8::HandleScope,
  module_value: v8::Local<v8::Value>,
  exports_value: v8::Local<v8::Value>,
) {
  let context = scope.get_current_context();
  let global = context.global(scope);
  let module_key = v8::String::new(scope, "module").unwrap();
  global.set(scope, module_key.into(), module_value);
  let exports_key = v8::String::new(scope, "exports").unwrap();
  global.set(scope, exports_key.into(), exports_value);
}
