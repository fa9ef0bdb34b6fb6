//! Builtin-module registry: the factories behind `k6`, `k6/...` and
//! `k6/x/...` specifiers. Protocol modules (http, ws, grpc, ...) register
//! through the same interface from the embedding binary.

pub mod data;
pub mod execution;
pub mod k6;
pub mod timers;

use crate::js::JsRuntime;
use crate::prelude::*;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, OnceLock};

/// A builtin module: yields one exports object per isolate.
pub trait BuiltinModule: Send + Sync {
  fn new_module_instance<'s>(
    &self,
    scope: &mut v8::HandleScope<'s>,
  ) -> AnyResult<v8::Local<'s, v8::Object>>;
}

#[derive(Clone)]
enum Registered {
  Plain(Arc<dyn BuiltinModule>),
  /// Importable, but the first use logs a deprecation warning.
  Deprecated {
    module: Arc<dyn BuiltinModule>,
    message: String,
    warned: Arc<Once>,
  },
  /// The import itself fails.
  Removed { message: String },
}

/// Process-wide registry; append-only until the first Bundle seals it.
#[derive(Default)]
pub struct ModuleRegistry {
  modules: RwLock<HashMap<String, Registered>>,
  sealed: AtomicBool,
}

impl ModuleRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry preloaded with the modules the core itself ships.
  pub fn with_defaults() -> Self {
    let registry = ModuleRegistry::new();
    registry
      .register("k6", Arc::new(k6::K6Module))
      .expect("default module registration");
    registry
      .register("k6/data", Arc::new(data::DataModule))
      .expect("default module registration");
    registry
      .register("k6/execution", Arc::new(execution::ExecutionModule))
      .expect("default module registration");
    registry
      .register("k6/timers", Arc::new(timers::TimersModule))
      .expect("default module registration");
    registry
  }

  fn insert(&self, name: &str, entry: Registered) -> AnyResult<()> {
    if self.sealed.load(Ordering::SeqCst) {
      anyhow::bail!("module registry is sealed, can't register {name:?}");
    }
    self.modules.write().insert(name.to_string(), entry);
    Ok(())
  }

  pub fn register(&self, name: &str, module: Arc<dyn BuiltinModule>) -> AnyResult<()> {
    self.insert(name, Registered::Plain(module))
  }

  pub fn register_deprecated(
    &self,
    name: &str,
    module: Arc<dyn BuiltinModule>,
    message: &str,
  ) -> AnyResult<()> {
    self.insert(
      name,
      Registered::Deprecated {
        module,
        message: message.to_string(),
        warned: Arc::new(Once::new()),
      },
    )
  }

  pub fn register_removed(&self, name: &str, message: &str) -> AnyResult<()> {
    self.insert(
      name,
      Registered::Removed {
        message: message.to_string(),
      },
    )
  }

  /// No further registrations; called when the first Bundle is built.
  pub fn seal(&self) {
    self.sealed.store(true, Ordering::SeqCst);
  }

  pub fn recognizes(&self, specifier: &str) -> bool {
    self.modules.read().contains_key(specifier)
  }

  fn get(&self, specifier: &str) -> Option<Registered> {
    self.modules.read().get(specifier).cloned()
  }
}

/// The registry used by default for every Runner in this process.
pub fn global_registry() -> Arc<ModuleRegistry> {
  static REGISTRY: OnceLock<Arc<ModuleRegistry>> = OnceLock::new();
  REGISTRY
    .get_or_init(|| Arc::new(ModuleRegistry::with_defaults()))
    .clone()
}

/// Builds (or returns the cached) exports object of a builtin for the
/// current isolate.
pub fn instantiate_builtin(
  scope: &mut v8::HandleScope,
  specifier: &str,
) -> AnyResult<v8::Global<v8::Object>> {
  let state_rc = JsRuntime::state(scope);

  if let Some(cached) = state_rc.borrow().module_map.builtin_exports(specifier) {
    return Ok(cached);
  }

  let registry = state_rc.borrow().bag.registry.clone();
  let module = match registry.get(specifier) {
    Some(Registered::Plain(module)) => module,
    Some(Registered::Deprecated {
      module,
      message,
      warned,
    }) => {
      warned.call_once(|| warn!("{message}"));
      module
    }
    Some(Registered::Removed { message }) => anyhow::bail!("{message}"),
    None => anyhow::bail!("unknown module: \"{specifier}\""),
  };

  let exports = module.new_module_instance(scope)?;
  let exports = v8::Global::new(scope, exports);
  state_rc
    .borrow_mut()
    .module_map
    .insert_builtin_exports(specifier, exports.clone());
  Ok(exports)
}

#[cfg(test)]
mod modules_tests {
  use super::*;

  #[test]
  fn seal1() {
    let registry = ModuleRegistry::with_defaults();
    assert!(registry.recognizes("k6"));
    assert!(registry.recognizes("k6/data"));
    assert!(!registry.recognizes("k6/http"));

    registry.seal();
    let err = registry
      .register_removed("k6/x/late", "too late")
      .unwrap_err();
    assert!(err.to_string().contains("sealed"));
  }
}
