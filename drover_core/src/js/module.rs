//! Module records for one isolate: the path → module index, synchronous
//! static-import graph fetching, and synthetic modules for builtins.

use crate::js::binding::throw_error;
use crate::js::JsRuntime;
use crate::prelude::*;
use url::Url;

/// Canonical module key: a builtin specifier (`k6/...`) or an absolute URL
/// string.
pub type ModuleKey = String;

/// Module map. Tracks every compiled module of one isolate, so cyclic
/// imports resolve to the live record even mid-evaluation.
pub struct ModuleMap {
  main: Option<ModuleKey>,
  index: HashMap<ModuleKey, v8::Global<v8::Module>>,
  builtin_exports: HashMap<ModuleKey, v8::Global<v8::Object>>,
}

impl ModuleMap {
  pub fn new() -> ModuleMap {
    Self {
      main: None,
      index: HashMap::new(),
      builtin_exports: HashMap::new(),
    }
  }

  pub fn main(&self) -> &Option<ModuleKey> {
    &self.main
  }

  pub fn set_main(&mut self, key: &str) {
    self.main = Some(key.to_string());
  }

  pub fn insert(&mut self, key: &str, module: v8::Global<v8::Module>) {
    self.index.insert(key.to_string(), module);
  }

  pub fn get(&self, key: &str) -> Option<v8::Global<v8::Module>> {
    self.index.get(key).cloned()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.index.contains_key(key)
  }

  /// Reverse lookup: the key a compiled module was registered under.
  pub fn get_key(&self, module: &v8::Global<v8::Module>) -> Option<ModuleKey> {
    self
      .index
      .iter()
      .find(|(_, m)| *m == module)
      .map(|(k, _)| k.clone())
  }

  pub fn insert_builtin_exports(&mut self, key: &str, exports: v8::Global<v8::Object>) {
    self.builtin_exports.insert(key.to_string(), exports);
  }

  pub fn builtin_exports(&self, key: &str) -> Option<v8::Global<v8::Object>> {
    self.builtin_exports.get(key).cloned()
  }
}

impl Default for ModuleMap {
  fn default() -> Self {
    ModuleMap::new()
  }
}

/// Create v8 script origin.
pub fn create_origin<'s>(
  scope: &mut v8::HandleScope<'s, ()>,
  name: &str,
  is_module: bool,
) -> v8::ScriptOrigin<'s> {
  let name = v8::String::new(scope, name).unwrap();
  let source_map = v8::undefined(scope);

  v8::ScriptOrigin::new(
    scope,
    name.into(),
    0,
    0,
    false,
    0,
    Some(source_map.into()),
    false,
    false,
    is_module,
    None,
  )
}

/// Compiles the module graph rooted at `key`, synchronously and eagerly.
/// Every module lands in the [`ModuleMap`] before its dependencies are
/// walked, which is what makes cyclic imports resolvable.
///
/// On failure the exception is left in the scope (run under a `TryCatch`).
pub fn fetch_module_tree<'a>(
  scope: &mut v8::HandleScope<'a>,
  key: &str,
  maybe_source: Option<&str>,
) -> Option<v8::Local<'a, v8::Module>> {
  let state_rc = JsRuntime::state(scope);

  if let Some(module) = state_rc.borrow().module_map.get(key) {
    return Some(v8::Local::new(scope, module));
  }

  let resolver = state_rc.borrow().bag.resolver.clone();
  if resolver.is_builtin(key) {
    return fetch_builtin_module(scope, key);
  }

  let code = match maybe_source {
    Some(source) => source.to_string(),
    None => match resolver.load(key) {
      Ok(loaded) => loaded.code.clone(),
      Err(e) => {
        throw_error(scope, &e.to_string());
        return None;
      }
    },
  };
  trace!("compiling module {key:?} ({} bytes)", code.len());

  let origin = create_origin(scope, key, true);
  let code = v8::String::new(scope, &code)?;
  let mut source = v8::script_compiler::Source::new(code, Some(&origin));
  let module = v8::script_compiler::compile_module(scope, &mut source)?;

  let module_ref = v8::Global::new(scope, module);
  state_rc.borrow_mut().module_map.insert(key, module_ref);

  let base = Url::parse(key).ok();
  let requests = module.get_module_requests();
  for i in 0..requests.length() {
    let request = requests.get(scope, i).unwrap();
    let request = v8::Local::<v8::ModuleRequest>::try_from(request).unwrap();
    let specifier = request.get_specifier().to_rust_string_lossy(scope);

    let resolved = match resolver.resolve(base.as_ref(), &specifier) {
      Ok(resolved) => resolved,
      Err(e) => {
        throw_error(scope, &e.to_string());
        return None;
      }
    };

    if !state_rc.borrow().module_map.contains(&resolved) {
      fetch_module_tree(scope, &resolved, None)?;
    }
  }

  Some(module)
}

/// Materializes a builtin as a synthetic module: one export per property of
/// the instantiated exports object, plus `default` bound to the object
/// itself.
fn fetch_builtin_module<'a>(
  scope: &mut v8::HandleScope<'a>,
  specifier: &str,
) -> Option<v8::Local<'a, v8::Module>> {
  let exports = match crate::modules::instantiate_builtin(scope, specifier) {
    Ok(exports) => exports,
    Err(e) => {
      throw_error(scope, &e.to_string());
      return None;
    }
  };
  let exports_local = v8::Local::new(scope, exports.clone());

  let mut export_names: Vec<v8::Local<v8::String>> = vec![];
  let names =
    exports_local.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())?;
  for i in 0..names.length() {
    let name = names.get_index(scope, i)?;
    if name.is_string() {
      export_names.push(name.to_string(scope)?);
    }
  }
  let default_name = v8::String::new(scope, "default")?;
  export_names.push(default_name);

  let name = v8::String::new(scope, specifier)?;
  let module =
    v8::Module::create_synthetic_module(scope, name, &export_names, builtin_evaluation_steps);

  let state_rc = JsRuntime::state(scope);
  let module_ref = v8::Global::new(scope, module);
  let mut state = state_rc.borrow_mut();
  state.module_map.insert(specifier, module_ref);
  state.module_map.insert_builtin_exports(specifier, exports);

  Some(module)
}

/// Evaluation steps for synthetic builtin modules: copy the instantiated
/// exports onto the module's bindings.
fn builtin_evaluation_steps<'a>(
  context: v8::Local<'a, v8::Context>,
  module: v8::Local<v8::Module>,
) -> Option<v8::Local<'a, v8::Value>> {
  let scope = &mut unsafe { v8::CallbackScope::new(context) };
  let scope = &mut v8::HandleScope::new(scope);

  let state_rc = JsRuntime::state(scope);
  let (key, exports) = {
    let state = state_rc.borrow();
    let module_ref = v8::Global::new(scope, module);
    let key = state.module_map.get_key(&module_ref)?;
    let exports = state.module_map.builtin_exports(&key)?;
    (key, exports)
  };
  trace!("evaluating synthetic builtin module {key:?}");

  let exports = v8::Local::new(scope, exports);

  let names = exports.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())?;
  for i in 0..names.length() {
    let name = names.get_index(scope, i)?;
    if !name.is_string() {
      continue;
    }
    let name = name.to_string(scope)?;
    let value = exports.get(scope, name.into())?;
    module.set_synthetic_module_export(scope, name, value)?;
  }

  let default_name = v8::String::new(scope, "default")?;
  module.set_synthetic_module_export(scope, default_name, exports.into())?;

  Some(v8::undefined(scope).into())
}
