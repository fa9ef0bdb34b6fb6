//! The Bundle: a script compiled and validated once, its exported options
//! extracted, then frozen as a factory of per-VU isolates.

use crate::archive::Archive;
use crate::compat::CompatibilityMode;
use crate::data::SharedArrayRegistry;
use crate::errext::ConfigError;
use crate::eventloop::EventLoop;
use crate::fsext::FsMap;
use crate::js::binding::console::Console;
use crate::js::binding::{get_global, set_env_global, set_number_global, set_property_to};
use crate::js::hook::module_resolve_cb;
use crate::js::loader::Resolver;
use crate::js::module::fetch_module_tree;
use crate::js::{err, InterruptReason, JsRuntime, JsRuntimeInit};
use crate::modules::ModuleRegistry;
use crate::options::{parse_options, Options};
use crate::prelude::*;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Once};
use tokio_util::sync::CancellationToken;
use url::Url;

/// An immutable script source: where it came from, its bytes, and the
/// directory imports resolve against.
#[derive(Debug, Clone)]
pub struct Source {
  pub url: Url,
  pub data: Vec<u8>,
  /// Base directory override; defaults to the directory of `url`.
  pub pwd: Option<Url>,
}

impl Source {
  pub fn new(url: Url, data: Vec<u8>) -> Self {
    Self {
      url,
      data,
      pwd: None,
    }
  }

  pub fn with_pwd(mut self, pwd: Url) -> Self {
    self.pwd = Some(pwd);
    self
  }

  /// The effective base directory URL.
  pub fn base_dir(&self) -> AnyResult<Url> {
    match &self.pwd {
      Some(pwd) => Ok(pwd.clone()),
      None => Ok(self.url.join(".")?),
    }
  }
}

/// Environment-level knobs that exist before any script is read.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
  /// Compatibility-mode override; empty means `extended`.
  pub compatibility_mode: Option<String>,
  /// The `__ENV` contents handed to every VU.
  pub env: HashMap<String, String>,
}

impl RuntimeOptions {
  fn resolve_compat(&self, fallback: Option<&str>) -> AnyResult<CompatibilityMode> {
    let mode = match (self.compatibility_mode.as_deref(), fallback) {
      (Some(explicit), _) => explicit,
      (None, Some(archived)) => archived,
      (None, None) => return Ok(CompatibilityMode::default()),
    };
    mode
      .parse::<CompatibilityMode>()
      .map_err(|e| ConfigError::new(e.to_string()).into())
  }
}

/// Inputs for creating one fresh isolate out of a Bundle.
pub struct InstantiateParams {
  pub vu_id: u64,
  pub console: Arc<Console>,
  pub tokio_handle: tokio::runtime::Handle,
  pub state: Option<Arc<crate::state::State>>,
  /// Cancels a long-running init.
  pub init_ctx: Option<CancellationToken>,
}

/// Compiled, frozen script plus everything needed to mint isolates.
pub struct Bundle {
  pub source: Source,
  pub options: Options,
  pub compatibility_mode: CompatibilityMode,
  pub env: HashMap<String, String>,
  pub filesystems: FsMap,
  pub resolver: Arc<Resolver>,
  pub registry: Arc<ModuleRegistry>,
  pub callable_exports: HashSet<String>,
  pub shared_arrays: Arc<SharedArrayRegistry>,
  base_url: Url,
  entrypoint_key: String,
  open_relativity_warned: Arc<Once>,
}

/// One live isolate produced from a Bundle, with its event loop and the
/// resolved callable exports.
pub struct BundleInstance {
  pub rt: JsRuntime,
  pub event_loop: EventLoop,
  callables: HashMap<String, v8::Global<v8::Function>>,
  options_value: Option<String>,
  pub env: HashMap<String, String>,
}

impl BundleInstance {
  pub fn get_callable(&self, name: &str) -> Option<v8::Global<v8::Function>> {
    self.callables.get(name).cloned()
  }

  pub fn callable_names(&self) -> HashSet<String> {
    self.callables.keys().cloned().collect()
  }

  /// JSON text of the script's `options` export, when present.
  pub fn exported_options_json(&self) -> Option<&str> {
    self.options_value.as_deref()
  }
}

impl Bundle {
  /// Compiles and validates a script: executes it once in a throwaway
  /// isolate, extracts options and callable exports, then locks the
  /// resolver and the `file` filesystem.
  pub fn new(
    rtopts: &RuntimeOptions,
    source: Source,
    filesystems: FsMap,
    registry: Arc<ModuleRegistry>,
    tokio_handle: tokio::runtime::Handle,
  ) -> AnyResult<Bundle> {
    Self::build(rtopts, None, source, filesystems, registry, tokio_handle)
  }

  /// Reconstructs a Bundle from an archive. The archived options are
  /// authoritative metadata; re-executing the script must not override
  /// them.
  pub fn from_archive(
    rtopts: &RuntimeOptions,
    archive: &Archive,
    registry: Arc<ModuleRegistry>,
    tokio_handle: tokio::runtime::Handle,
  ) -> AnyResult<Bundle> {
    let url = Url::parse(&archive.filename)?;
    let pwd = Url::parse(&archive.pwd)?;
    let source = Source::new(url, archive.data.clone().into_bytes()).with_pwd(pwd);
    let filesystems = FsMap::from_archived(&archive.filesystems);

    let mut rtopts = rtopts.clone();
    if rtopts.compatibility_mode.is_none() {
      rtopts.compatibility_mode = Some(archive.compatibility_mode.clone());
    }
    let mut env = archive.env.clone();
    for (k, v) in &rtopts.env {
      env.insert(k.clone(), v.clone());
    }
    rtopts.env = env;

    let mut bundle = Self::build(
      &rtopts,
      Some(&archive.compatibility_mode),
      source,
      filesystems,
      registry,
      tokio_handle,
    )?;

    // The snapshot wins over whatever the re-executed script exported.
    let (options, _) = parse_options(&archive.options)
      .map_err(|e| AnyErr::from(ConfigError::new(e.to_string())))?;
    bundle.options = options;
    Ok(bundle)
  }

  fn build(
    rtopts: &RuntimeOptions,
    archived_compat: Option<&str>,
    source: Source,
    filesystems: FsMap,
    registry: Arc<ModuleRegistry>,
    tokio_handle: tokio::runtime::Handle,
  ) -> AnyResult<Bundle> {
    let compatibility_mode = rtopts.resolve_compat(archived_compat)?;
    let base_url = source.base_dir()?;
    let entrypoint_key = source.url.to_string();

    registry.seal();
    let resolver = Arc::new(Resolver::new(
      registry.clone(),
      filesystems.clone(),
      compatibility_mode,
    ));
    let raw = std::str::from_utf8(&source.data)
      .map_err(|_| anyhow::anyhow!("script source is not valid UTF-8"))?;
    resolver
      .seed(&entrypoint_key, raw)
      .map_err(|e| AnyErr::from(ConfigError::new(e.to_string())))?;

    let mut bundle = Bundle {
      source,
      options: Options::default(),
      compatibility_mode,
      env: rtopts.env.clone(),
      filesystems,
      resolver,
      registry,
      callable_exports: HashSet::new(),
      shared_arrays: Arc::new(SharedArrayRegistry::new()),
      base_url,
      entrypoint_key,
      open_relativity_warned: Arc::new(Once::new()),
    };

    // First execution, vu id 0: extracts exports and exercises every
    // init-time file access.
    let instance = bundle.instantiate(InstantiateParams {
      vu_id: 0,
      console: Arc::new(Console::new()),
      tokio_handle,
      state: None,
      init_ctx: None,
    })?;

    if let Some(options_json) = instance.exported_options_json() {
      let value: serde_json::Value = serde_json::from_str(options_json)
        .map_err(|e| AnyErr::from(ConfigError::new(e.to_string())))?;
      let (options, warning) =
        parse_options(&value).map_err(|e| AnyErr::from(ConfigError::new(e.to_string())))?;
      if let Some(warning) = warning {
        warn!(
          error = %warning,
          "There were unknown fields in the options exported in the script"
        );
      }
      bundle.options = options;
    }

    bundle.callable_exports = instance.callable_names();
    if bundle.callable_exports.is_empty() {
      anyhow::bail!("no exported functions in script");
    }

    // Freeze: no new module sources, and the `file` filesystem now only
    // serves what init already read.
    bundle.resolver.lock();
    bundle.filesystems.lock_file_scheme();

    Ok(bundle)
  }

  pub fn make_archive(&self, effective_options: &Options) -> Archive {
    Archive {
      archive_type: "js".to_string(),
      filename: self.source.url.to_string(),
      pwd: self.base_url.to_string(),
      data: String::from_utf8_lossy(&self.source.data).into_owned(),
      env: self.env.clone(),
      options: serde_json::to_value(effective_options).unwrap_or(serde_json::Value::Null),
      compatibility_mode: self.compatibility_mode.to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      os: std::env::consts::OS.to_string(),
      filesystems: self.filesystems.archived_contents(),
    }
  }

  /// Creates a fresh isolate, re-executes the main module inside it (so
  /// module-level state is per-VU) and resolves the callable exports.
  pub fn instantiate(&self, params: InstantiateParams) -> AnyResult<BundleInstance> {
    let mut event_loop = EventLoop::new();
    let env = self.env.clone();

    let mut rt = JsRuntime::new(JsRuntimeInit {
      resolver: self.resolver.clone(),
      registry: self.registry.clone(),
      filesystems: self.filesystems.clone(),
      env: env.clone(),
      console: params.console,
      shared_arrays: self.shared_arrays.clone(),
      entrypoint_pwd: self.base_url.clone(),
      open_relativity_warned: self.open_relativity_warned.clone(),
      loop_shared: event_loop.shared(),
      tokio_handle: params.tokio_handle.clone(),
      state: params.state,
    });

    // Allow canceling a long-running init from the outside.
    let init_watch = params.init_ctx.map(|token| {
      let done = CancellationToken::new();
      let interrupt = rt.interrupt_slot();
      let loop_shared = event_loop.shared();
      let done_clone = done.clone();
      params.tokio_handle.spawn(async move {
        tokio::select! {
          _ = token.cancelled() => {
            interrupt.interrupt(InterruptReason::Canceled);
            loop_shared.wake();
          }
          _ = done_clone.cancelled() => {}
        }
      });
      done
    });

    let result = self.run_init(&mut rt, &mut event_loop, params.vu_id, &env);

    if let Some(done) = init_watch {
      done.cancel();
    }

    let (callables, options_value) = result?;

    Ok(BundleInstance {
      rt,
      event_loop,
      callables,
      options_value,
      env,
    })
  }

  fn run_init(
    &self,
    rt: &mut JsRuntime,
    event_loop: &mut EventLoop,
    vu_id: u64,
    env: &HashMap<String, String>,
  ) -> AnyResult<(HashMap<String, v8::Global<v8::Function>>, Option<String>)> {
    let entrypoint_key = self.entrypoint_key.clone();
    let state_rc = rt.get_state();

    {
      let scope = &mut rt.handle_scope();
      set_number_global(scope, "__VU", vu_id as f64);
      set_env_global(scope, env);

      // CommonJS scaffolding for the main module.
      let exports_obj = v8::Object::new(scope);
      let module_obj = v8::Object::new(scope);
      set_property_to(scope, module_obj, "exports", exports_obj.into());
      let context = scope.get_current_context();
      let global = context.global(scope);
      set_property_to(scope, global, "module", module_obj.into());
      set_property_to(scope, global, "exports", exports_obj.into());
    }

    {
      let mut state = state_rc.borrow_mut();
      state.module_map.set_main(&entrypoint_key);
      state.bag.module_dir_stack.push(self.source.url.clone());
      state.bag.in_init_context = true;
    }

    let evaluated: Rc<RefCell<Option<v8::Global<v8::Module>>>> = Rc::new(RefCell::new(None));
    let evaluated_in = evaluated.clone();

    let start_result = event_loop.start(rt, move |scope| {
      let tc_scope = &mut v8::TryCatch::new(scope);

      let module = match fetch_module_tree(tc_scope, &entrypoint_key, None) {
        Some(module) => module,
        None => return Err(err::from_try_catch(tc_scope, None).into()),
      };

      if module
        .instantiate_module(tc_scope, module_resolve_cb)
        .is_none()
      {
        return Err(err::from_try_catch(tc_scope, None).into());
      }

      let _ = module.evaluate(tc_scope);
      if tc_scope.has_caught() && !tc_scope.has_terminated() {
        return Err(err::from_try_catch(tc_scope, None).into());
      }

      // A synchronous throw marks the module errored right away; surface
      // it directly instead of via the duplicated promise rejection.
      if module.get_status() == v8::ModuleStatus::Errored {
        let exception = module.get_exception();
        let exception_ref = v8::Global::new(tc_scope, exception);
        JsRuntime::state(tc_scope)
          .borrow_mut()
          .exceptions
          .remove_promise_rejection_entry(&exception_ref);
        return Err(err::exception_to_script_error(tc_scope, exception, None).into());
      }

      *evaluated_in.borrow_mut() = Some(v8::Global::new(tc_scope, module));
      Ok(())
    });

    // Init is over regardless of the outcome; init-only APIs shut off.
    {
      let mut state = state_rc.borrow_mut();
      state.bag.module_dir_stack.pop();
      state.bag.in_init_context = false;
    }
    start_result?;

    let module = evaluated
      .borrow_mut()
      .take()
      .ok_or_else(|| anyhow::anyhow!("main module was not evaluated"))?;

    let scope = &mut rt.handle_scope();
    let module = v8::Local::new(scope, module);

    if module.get_status() == v8::ModuleStatus::Errored {
      let exception = module.get_exception();
      // The same exception may sit in the rejection queue; drop it so it
      // isn't reported twice.
      let exception_ref = v8::Global::new(scope, exception);
      JsRuntime::state(scope)
        .borrow_mut()
        .exceptions
        .remove_promise_rejection_entry(&exception_ref);
      return Err(err::exception_to_script_error(scope, exception, None).into());
    }

    collect_exports(scope, module)
  }
}

/// Gathers the callable exports and the `options` export from the main
/// module: ESM namespace properties first, CommonJS `module.exports`
/// properties as a fallback (namespace wins on collision).
fn collect_exports(
  scope: &mut v8::HandleScope,
  module: v8::Local<v8::Module>,
) -> AnyResult<(HashMap<String, v8::Global<v8::Function>>, Option<String>)> {
  let mut callables = HashMap::new();
  let mut options_value: Option<String> = None;

  let mut collect = |scope: &mut v8::HandleScope,
                     obj: v8::Local<v8::Object>,
                     callables: &mut HashMap<String, v8::Global<v8::Function>>,
                     options_value: &mut Option<String>|
   -> AnyResult<()> {
    let Some(names) = obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
    else {
      return Ok(());
    };
    for i in 0..names.length() {
      let Some(name) = names.get_index(scope, i) else {
        continue;
      };
      if !name.is_string() {
        continue;
      }
      let key = name.to_rust_string_lossy(scope);
      let Some(value) = obj.get(scope, name) else {
        continue;
      };

      if key == "options" {
        if options_value.is_none() && !value.is_undefined() && !value.is_null() {
          let json = v8::json::stringify(scope, value)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "null".to_string());
          *options_value = Some(json);
        }
        continue;
      }

      if let Ok(function) = v8::Local::<v8::Function>::try_from(value) {
        callables
          .entry(key)
          .or_insert_with(|| v8::Global::new(scope, function));
      }
    }
    Ok(())
  };

  // ESM namespace exports.
  let namespace = module.get_module_namespace();
  if let Some(namespace) = namespace.to_object(scope) {
    collect(scope, namespace, &mut callables, &mut options_value)?;
  }

  // CommonJS module.exports.
  if let Some(module_obj) = get_global(scope, "module").and_then(|m| m.to_object(scope)) {
    let exports_key = v8::String::new(scope, "exports").unwrap();
    if let Some(exports) = module_obj.get(scope, exports_key.into()) {
      if exports.is_null() {
        anyhow::bail!("CommonJS's exports must not be null");
      }
      if let Some(exports) = exports.to_object(scope) {
        collect(scope, exports, &mut callables, &mut options_value)?;
      }
    }
  }

  Ok((callables, options_value))
}
