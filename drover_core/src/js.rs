//! Per-VU JavaScript runtime: one V8 isolate, the state its bindings reach
//! for, and the interrupt plumbing that lets a canceled activation stop
//! running script.

use crate::data::SharedArrayRegistry;
use crate::errext::InterruptError;
use crate::eventloop::LoopShared;
use crate::fsext::FsMap;
use crate::js::binding::console::Console;
use crate::js::binding::timers::Timers;
use crate::js::exception::ExceptionState;
use crate::js::loader::Resolver;
use crate::js::module::ModuleMap;
use crate::modules::ModuleRegistry;
use crate::prelude::*;
use crate::state::State;

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Once};
use std::time::Duration;
use url::Url;

pub mod binding;
pub mod err;
pub mod exception;
pub mod hook;
pub mod loader;
pub mod module;
pub mod transpiler;

// Initialize V8 platform.
pub fn init_v8_platform() {
  static V8_INIT: Once = Once::new();
  V8_INIT.call_once(move || {
    let platform = v8::new_default_platform(0, false).make_shared();
    v8::V8::initialize_platform(platform);
    v8::V8::initialize();
  });
}

/// Why a running isolate was terminated from the outside.
#[derive(Debug, Clone)]
pub enum InterruptReason {
  /// The activation's run context was canceled.
  Canceled,
  /// A setup/teardown/summary deadline fired.
  Deadline,
  /// The script asked for the whole test to stop.
  Abort(InterruptError),
}

/// Thread-safe handle used to stop JavaScript mid-flight. The interpreter
/// is never killed; `terminate_execution` makes V8 unwind cooperatively at
/// the next interrupt check.
pub struct InterruptSlot {
  isolate_handle: v8::IsolateHandle,
  reason: Mutex<Option<InterruptReason>>,
  interrupted: Mutex<bool>,
  cond: Condvar,
}

impl InterruptSlot {
  fn new(isolate_handle: v8::IsolateHandle) -> Self {
    Self {
      isolate_handle,
      reason: Mutex::new(None),
      interrupted: Mutex::new(false),
      cond: Condvar::new(),
    }
  }

  /// Safe from any thread. The first reason wins until cleared.
  pub fn interrupt(&self, reason: InterruptReason) {
    {
      let mut slot = self.reason.lock();
      if slot.is_none() {
        *slot = Some(reason);
      }
    }
    *self.interrupted.lock() = true;
    self.cond.notify_all();
    self.isolate_handle.terminate_execution();
  }

  /// Resets the slot before a new activation or one-shot call.
  pub fn clear(&self) {
    *self.reason.lock() = None;
    *self.interrupted.lock() = false;
    self.isolate_handle.cancel_terminate_execution();
  }

  pub fn is_interrupted(&self) -> bool {
    *self.interrupted.lock()
  }

  pub fn reason(&self) -> Option<InterruptReason> {
    self.reason.lock().clone()
  }

  /// Blocks for up to `timeout`; returns `true` when woken by an interrupt.
  /// Used by blocking natives (`sleep`) so cancellation stays responsive.
  pub fn wait_interruptible(&self, timeout: Duration) -> bool {
    let mut interrupted = self.interrupted.lock();
    if *interrupted {
      return true;
    }
    self.cond.wait_for(&mut interrupted, timeout);
    *interrupted
  }
}

/// Everything the native bindings need, carried inside the isolate state.
pub struct RuntimeBag {
  pub resolver: Arc<Resolver>,
  pub registry: Arc<ModuleRegistry>,
  pub filesystems: FsMap,
  pub env: HashMap<String, String>,
  pub console: Arc<Console>,
  pub shared_arrays: Arc<SharedArrayRegistry>,
  /// Base directory of the entrypoint module; what `open()` resolves
  /// against.
  pub entrypoint_pwd: Url,
  /// One-shot guard for the `open()` relativity deprecation warning,
  /// shared by every instance of the same Bundle.
  pub open_relativity_warned: Arc<Once>,
  /// URLs of the modules currently evaluating, innermost last. Used for
  /// relative `require()` and the `open()` relativity check.
  pub module_dir_stack: Vec<Url>,
  /// Init-only APIs (`open`, `require`, `new SharedArray`, module loading)
  /// check this before doing anything.
  pub in_init_context: bool,
  pub timers: Timers,
  pub loop_shared: Arc<LoopShared>,
  pub interrupt: Arc<InterruptSlot>,
  pub tokio_handle: tokio::runtime::Handle,
  /// Per-VU state; `None` only while a Bundle constructs its throwaway
  /// options-extraction instance.
  pub state: Option<Arc<State>>,
  pub require_cache: HashMap<String, v8::Global<v8::Value>>,
}

pub struct JsRuntimeState {
  /// A sand-boxed execution context with its own set of built-in objects
  /// and functions.
  pub context: v8::Global<v8::Context>,
  /// Holds information about resolved ES modules.
  pub module_map: ModuleMap,
  /// Stores and manages uncaught exceptions.
  pub exceptions: ExceptionState,
  pub bag: RuntimeBag,
}

/// Inputs for a fresh isolate; assembled by `Bundle::instantiate`.
pub struct JsRuntimeInit {
  pub resolver: Arc<Resolver>,
  pub registry: Arc<ModuleRegistry>,
  pub filesystems: FsMap,
  pub env: HashMap<String, String>,
  pub console: Arc<Console>,
  pub shared_arrays: Arc<SharedArrayRegistry>,
  pub entrypoint_pwd: Url,
  pub open_relativity_warned: Arc<Once>,
  pub loop_shared: Arc<LoopShared>,
  pub tokio_handle: tokio::runtime::Handle,
  pub state: Option<Arc<State>>,
}

pub struct JsRuntime {
  // V8 isolate.
  isolate: v8::OwnedIsolate,

  /// The state of the runtime.
  pub state: Rc<RefCell<JsRuntimeState>>,

  interrupt: Arc<InterruptSlot>,
}

impl JsRuntime {
  /// Creates a new JsRuntime with its own isolate and context.
  pub fn new(init: JsRuntimeInit) -> Self {
    // Fire up the v8 engine.
    init_v8_platform();

    let mut isolate = v8::Isolate::new(v8::CreateParams::default());

    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
    isolate.set_promise_reject_callback(hook::promise_reject_cb);
    isolate.set_host_initialize_import_meta_object_callback(
      hook::host_initialize_import_meta_object_cb,
    );
    isolate
      .set_host_import_module_dynamically_callback(hook::host_import_module_dynamically_cb);

    let interrupt = Arc::new(InterruptSlot::new(isolate.thread_safe_handle()));

    let context = {
      let scope = &mut v8::HandleScope::new(&mut *isolate);
      let context = binding::create_new_context(scope);
      v8::Global::new(scope, context)
    };

    let state = Rc::new(RefCell::new(JsRuntimeState {
      context,
      module_map: ModuleMap::new(),
      exceptions: ExceptionState::new(),
      bag: RuntimeBag {
        resolver: init.resolver,
        registry: init.registry,
        filesystems: init.filesystems,
        env: init.env,
        console: init.console,
        shared_arrays: init.shared_arrays,
        entrypoint_pwd: init.entrypoint_pwd,
        open_relativity_warned: init.open_relativity_warned,
        module_dir_stack: vec![],
        in_init_context: true,
        timers: Timers::new(),
        loop_shared: init.loop_shared,
        interrupt: interrupt.clone(),
        tokio_handle: init.tokio_handle,
        state: init.state,
        require_cache: HashMap::new(),
      },
    }));

    isolate.set_slot(state.clone());

    let mut rt = JsRuntime {
      isolate,
      state,
      interrupt,
    };
    rt.init_runtime_environment();
    rt
  }

  /// Evaluates the embedded bootstrap (console wiring, timer wrappers,
  /// SharedArray plumbing) inside the fresh context.
  fn init_runtime_environment(&mut self) {
    let source = include_str!("./js/runtime/10__drover.js");
    let scope = &mut self.handle_scope();
    let tc_scope = &mut v8::TryCatch::new(scope);

    let origin = module::create_origin(tc_scope, "drover:runtime/10__drover.js", false);
    let code = v8::String::new(tc_scope, source).unwrap();
    let script = v8::Script::compile(tc_scope, code, Some(&origin))
      .expect("the embedded runtime bootstrap must compile");
    if script.run(tc_scope).is_none() {
      let exception = tc_scope.exception().unwrap();
      let exception = err::exception_to_script_error(tc_scope, exception, None);
      unreachable!("the embedded runtime bootstrap must evaluate: {exception}");
    }
  }

  pub fn interrupt_slot(&self) -> Arc<InterruptSlot> {
    self.interrupt.clone()
  }
}

// State management specific methods.
impl JsRuntime {
  /// Returns the runtime state stored in the given isolate.
  pub fn state(isolate: &v8::Isolate) -> Rc<RefCell<JsRuntimeState>> {
    isolate
      .get_slot::<Rc<RefCell<JsRuntimeState>>>()
      .unwrap()
      .clone()
  }

  /// Returns the runtime's state.
  pub fn get_state(&self) -> Rc<RefCell<JsRuntimeState>> {
    Self::state(&self.isolate)
  }

  /// Returns a v8 handle scope for the runtime.
  pub fn handle_scope(&mut self) -> v8::HandleScope {
    let context = self.context();
    v8::HandleScope::with_context(&mut self.isolate, context)
  }

  /// Returns the context created for the runtime.
  pub fn context(&mut self) -> v8::Global<v8::Context> {
    let state = self.get_state();
    let state = state.borrow();
    state.context.clone()
  }
}

/// Returns an error if an uncaught exception or an unhandled promise
/// rejection has been captured since the last check.
pub fn check_exceptions(scope: &mut v8::HandleScope) -> Option<crate::errext::ScriptError> {
  let state_rc = JsRuntime::state(scope);

  let maybe_exception = state_rc.borrow_mut().exceptions.exception.take();
  if let Some(exception) = maybe_exception {
    let exception = v8::Local::new(scope, exception);
    return Some(err::exception_to_script_error(scope, exception, None));
  }

  let maybe_rejection = state_rc.borrow_mut().exceptions.pop_promise_rejection();
  if let Some((_promise, value)) = maybe_rejection {
    let value = v8::Local::new(scope, value);
    return Some(err::exception_to_script_error(
      scope,
      value,
      Some("Uncaught (in promise) "),
    ));
  }

  None
}
