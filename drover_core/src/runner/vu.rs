//! One VU: a BundleInstance, its event loop and state, executing exactly
//! one iteration per `run_once` with lifecycle events, pacing and
//! interruption wired in.

use crate::bundle::BundleInstance;
use crate::errext::ContextCanceled;
use crate::eventloop::LoopShared;
use crate::events::{EventData, EventType, IterData, System as EventSystem};
use crate::js::binding::set_number_global;
use crate::js::err;
use crate::js::{InterruptReason, InterruptSlot};
use crate::metrics::{self, Sample, TagSet};
use crate::prelude::*;
use crate::state::{ScenarioState, State};
use crate::types::SystemTag;

use parking_lot::RwLock;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

/// Bound on waiting for event subscribers to acknowledge IterStart/IterEnd.
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const DEFAULT_EXEC: &str = "default";
const DEFAULT_SCENARIO: &str = "default";

type IterationCountersFn = Arc<dyn Fn() -> (u64, u64) + Send + Sync>;

/// Inputs for [`Vu::activate`].
#[derive(Default)]
pub struct VuActivationParams {
  pub run_context: CancellationToken,
  /// Name of the exported function to run; defaults to `"default"`.
  pub exec: Option<String>,
  /// Environment overlay for this activation.
  pub env: HashMap<String, String>,
  /// Tag overlay on top of the run-tags baseline.
  pub tags: TagSet,
  pub scenario: Option<String>,
  /// Yields (scenario-local, scenario-global) iteration numbers; when
  /// absent both counters stay at the unknown sentinel.
  pub get_next_iteration_counters: Option<IterationCountersFn>,
  /// Invoked once the run context is canceled and the in-flight iteration
  /// has finished.
  pub deactivate_callback: Option<Box<dyn FnOnce() + Send>>,
}

struct Activation {
  token: CancellationToken,
  exec: String,
  scenario_name: String,
  get_next_iteration_counters: Option<IterationCountersFn>,
  watcher_done: CancellationToken,
}

/// An initialized VU. Owns its isolate and event loop; driven from one
/// thread by the external scheduler.
pub struct Vu {
  instance: BundleInstance,
  state: Arc<State>,
  id: u64,
  id_global: u64,
  events: Arc<EventSystem>,
  run_tags: Arc<RwLock<TagSet>>,
  setup_data: Arc<RwLock<Option<Vec<u8>>>>,
  setup_value: Option<v8::Global<v8::Value>>,
  busy: Arc<tokio::sync::Mutex<()>>,
  tokio_handle: tokio::runtime::Handle,
  /// Per-scenario iteration counts of this VU within this process.
  scenario_iters: HashMap<String, u64>,
  activation: Option<Activation>,
}

impl Vu {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    instance: BundleInstance,
    state: Arc<State>,
    id: u64,
    id_global: u64,
    events: Arc<EventSystem>,
    run_tags: Arc<RwLock<TagSet>>,
    setup_data: Arc<RwLock<Option<Vec<u8>>>>,
    tokio_handle: tokio::runtime::Handle,
  ) -> Self {
    Self {
      instance,
      state,
      id,
      id_global,
      events,
      run_tags,
      setup_data,
      setup_value: None,
      busy: Arc::new(tokio::sync::Mutex::new(())),
      tokio_handle,
      scenario_iters: HashMap::new(),
      activation: None,
    }
  }

  pub fn get_id(&self) -> u64 {
    self.id
  }

  pub fn state(&self) -> &Arc<State> {
    &self.state
  }

  pub(crate) fn interrupt_slot(&self) -> Arc<InterruptSlot> {
    self.instance.rt.interrupt_slot()
  }

  pub(crate) fn loop_shared(&self) -> Arc<LoopShared> {
    self.instance.event_loop.shared()
  }

  /// Marks the VU active for one scenario run. At most one activation is
  /// live at a time; re-activating tears down the previous watcher.
  pub fn activate(&mut self, params: VuActivationParams) -> ActiveVu<'_> {
    if let Some(prev) = self.activation.take() {
      prev.watcher_done.cancel();
    }

    let interrupt = self.interrupt_slot();
    interrupt.clear();

    let exec = params
      .exec
      .filter(|e| !e.is_empty())
      .unwrap_or_else(|| DEFAULT_EXEC.to_string());
    let scenario_name = params
      .scenario
      .unwrap_or_else(|| DEFAULT_SCENARIO.to_string());

    // Compose the environment: bundle env overlaid with activation env.
    let mut env = self.instance.env.clone();
    env.extend(params.env.clone());
    {
      let scope = &mut self.instance.rt.handle_scope();
      crate::js::binding::set_env_global(scope, &env);
    }

    // Reset tags to the run-tags baseline plus the activation overlay;
    // metadata always starts clean.
    {
      let options = &self.state.options;
      let mut tags = self.state.tags.lock();
      tags.tags = self.run_tags.read().clone();
      for (k, v) in &params.tags {
        tags.tags.insert(k.clone(), v.clone());
      }
      tags.metadata.clear();

      if options.system_tag_enabled(SystemTag::Vu) {
        tags.set_system_tag(SystemTag::Vu, self.id_global.to_string());
      }
      if options.system_tag_enabled(SystemTag::Group) {
        tags.set_system_tag(SystemTag::Group, "");
      }
      if options.system_tag_enabled(SystemTag::Scenario) {
        tags.set_system_tag(SystemTag::Scenario, scenario_name.clone());
      }
    }

    *self.state.scenario.lock() = ScenarioState {
      name: Some(scenario_name.clone()),
      ..Default::default()
    };
    self.state.group_stack.lock().clear();

    // Cancellation watcher: interrupt the isolate, wait out the busy
    // token, then notify the scheduler.
    let watcher_done = CancellationToken::new();
    {
      let token = params.run_context.clone();
      let done = watcher_done.clone();
      let interrupt = interrupt.clone();
      let loop_shared = self.loop_shared();
      let busy = self.busy.clone();
      let deactivate = params.deactivate_callback;
      self.tokio_handle.spawn(async move {
        tokio::select! {
          _ = token.cancelled() => {
            interrupt.interrupt(InterruptReason::Canceled);
            loop_shared.wake();
            // The in-flight iteration holds the token; wait for it.
            let _guard = busy.lock().await;
            drop(_guard);
            if let Some(cb) = deactivate {
              cb();
            }
          }
          _ = done.cancelled() => {}
        }
      });
    }

    self.activation = Some(Activation {
      token: params.run_context,
      exec,
      scenario_name,
      get_next_iteration_counters: params.get_next_iteration_counters,
      watcher_done,
    });

    ActiveVu { vu: self }
  }

  fn run_once_inner(&mut self) -> AnyResult<()> {
    let (token, exec, scenario_name, get_next) = {
      let act = self
        .activation
        .as_ref()
        .expect("run_once requires an activated VU");
      (
        act.token.clone(),
        act.exec.clone(),
        act.scenario_name.clone(),
        act.get_next_iteration_counters.clone(),
      )
    };

    if token.is_cancelled() {
      return Err(ContextCanceled.into());
    }
    // At most one iteration at a time; a concurrent caller parks here
    // until the in-flight iteration finishes.
    let busy = self.busy.clone();
    let guard = busy.blocking_lock();
    if token.is_cancelled() {
      drop(guard);
      return Err(ContextCanceled.into());
    }

    self.hydrate_setup_value();

    // The external scheduler validates exec names up front; a miss here is
    // its bug, not a script error.
    let func = self.instance.get_callable(&exec).unwrap_or_else(|| {
      panic!("function \"{exec}\" not found in exports");
    });

    let iteration = self.state.increment_iteration();
    {
      let scope = &mut self.instance.rt.handle_scope();
      set_number_global(scope, "__ITER", iteration as f64);
    }

    let vu_scenario_iter = self
      .scenario_iters
      .entry(scenario_name.clone())
      .and_modify(|v| *v += 1)
      .or_insert(0);
    trace!(
      "vu {} starting iteration {iteration} (scenario iter {vu_scenario_iter})",
      self.id
    );

    let (scenario_local, scenario_global) = match &get_next {
      Some(counters) => counters(),
      None => (u64::MAX, u64::MAX),
    };
    {
      let mut scenario = self.state.scenario.lock();
      scenario.iteration_local = scenario_local;
      scenario.iteration_global = scenario_global;
    }

    let iter_data = IterData {
      iteration,
      vu_id: self.id,
      scenario_name: scenario_name.clone(),
      error: None,
    };
    self
      .events
      .emit(EventType::IterStart, EventData::Iteration(iter_data.clone()))
      .wait(EVENT_WAIT_TIMEOUT);

    let started = Instant::now();
    let setup_value = self.setup_value.clone().expect("setup value hydrated");
    let result = self.run_fn(true, func, vec![setup_value], &token);

    let mut end_data = iter_data;
    if let Err(e) = &result {
      end_data.error = Some(format!("{e:#}"));
    }
    self
      .events
      .emit(EventType::IterEnd, EventData::Iteration(end_data))
      .wait(EVENT_WAIT_TIMEOUT);

    // Minimum-iteration pacing, preemptible by cancellation.
    let is_full = !token.is_cancelled();
    if is_full {
      if let Some(min) = self.state.options.min_iteration_duration {
        let elapsed = started.elapsed();
        if min.as_std() > elapsed {
          self.interrupt_slot().wait_interruptible(min.as_std() - elapsed);
        }
      }
    }

    drop(guard);
    result.map(|_| ())
  }

  fn hydrate_setup_value(&mut self) {
    if self.setup_value.is_some() {
      return;
    }
    let data = self.setup_data.read().clone();
    let scope = &mut self.instance.rt.handle_scope();
    let value: v8::Local<v8::Value> = match data {
      Some(bytes) => {
        let text = String::from_utf8_lossy(&bytes);
        let json = v8::String::new(scope, &text).unwrap();
        v8::json::parse(scope, json).unwrap_or_else(|| v8::undefined(scope).into())
      }
      None => v8::undefined(scope).into(),
    };
    self.setup_value = Some(v8::Global::new(scope, value));
  }

  /// Runs one callable on the event loop: the core of iterations and of
  /// the one-shot setup/teardown/summary calls.
  fn run_fn(
    &mut self,
    is_default: bool,
    func: v8::Global<v8::Function>,
    args: Vec<v8::Global<v8::Value>>,
    token: &CancellationToken,
  ) -> AnyResult<Option<v8::Global<v8::Value>>> {
    let state = self.state.clone();

    if state.options.no_cookies_reset != Some(true) {
      state.cookie_jar.clear();
    }
    if is_default && state.options.system_tag_enabled(SystemTag::Iter) {
      state
        .tags
        .lock()
        .set_system_tag(SystemTag::Iter, state.iteration().to_string());
    }

    let started = Instant::now();
    let returned: Rc<RefCell<Option<v8::Global<v8::Value>>>> = Rc::new(RefCell::new(None));
    let returned_in = returned.clone();

    let start_result = self.instance.event_loop.start(&mut self.instance.rt, move |scope| {
      let func = v8::Local::new(scope, func);
      let args: Vec<v8::Local<v8::Value>> =
        args.iter().map(|a| v8::Local::new(scope, a)).collect();
      let undefined = v8::undefined(scope).into();

      let tc_scope = &mut v8::TryCatch::new(scope);
      match func.call(tc_scope, undefined, &args) {
        Some(value) => {
          *returned_in.borrow_mut() = Some(v8::Global::new(tc_scope, value));
          Ok(())
        }
        None => {
          if tc_scope.has_terminated() {
            anyhow::bail!("script call interrupted");
          }
          Err(err::from_try_catch(tc_scope, None).into())
        }
      }
    });

    if start_result.is_err() {
      // Outstanding timers die with the iteration; each one is logged and
      // its loop slot released, then stragglers are drained.
      self.clear_timers();
      self
        .instance
        .event_loop
        .wait_on_registered(&mut self.instance.rt);
    }

    let is_full = !token.is_cancelled();
    self.emit_iteration_samples(is_full && is_default, started.elapsed());

    let value = start_result.map(|_| returned.borrow_mut().take())?;

    // Unwrap a returned promise to its resolved value; an unhandled
    // rejection already surfaced through the loop.
    let value = match value {
      None => None,
      Some(value) => {
        let scope = &mut self.instance.rt.handle_scope();
        let local = v8::Local::new(scope, value.clone());
        match v8::Local::<v8::Promise>::try_from(local) {
          Ok(promise) if promise.state() == v8::PromiseState::Fulfilled => {
            let resolved = promise.result(scope);
            Some(v8::Global::new(scope, resolved))
          }
          Ok(_) => None,
          Err(_) => Some(value),
        }
      }
    };

    Ok(value)
  }

  fn clear_timers(&mut self) {
    let state_rc = self.instance.rt.get_state();
    let mut state = state_rc.borrow_mut();
    state.bag.timers.entries.clear();
    let wheel = state.bag.timers.wheel.clone();
    drop(state);
    wheel.clear_all();
  }

  fn emit_iteration_samples(&self, full_default_iteration: bool, elapsed: Duration) {
    let now = SystemTime::now();
    let (tags, metadata) = {
      let t = self.state.tags.lock();
      (t.tags.clone(), t.metadata.clone())
    };

    let mut samples = vec![];
    let (sent, received) = self.state.dialer.take_io_totals();
    samples.push(Sample {
      metric: self.state.builtin_metrics.data_sent.clone(),
      tags: tags.clone(),
      metadata: metadata.clone(),
      time: now,
      value: sent as f64,
    });
    samples.push(Sample {
      metric: self.state.builtin_metrics.data_received.clone(),
      tags: tags.clone(),
      metadata: metadata.clone(),
      time: now,
      value: received as f64,
    });

    if full_default_iteration {
      samples.push(Sample {
        metric: self.state.builtin_metrics.iteration_duration.clone(),
        tags: tags.clone(),
        metadata: metadata.clone(),
        time: now,
        value: metrics::duration_millis(elapsed),
      });
      samples.push(Sample {
        metric: self.state.builtin_metrics.iterations.clone(),
        tags,
        metadata,
        time: now,
        value: 1.0,
      });
    }

    metrics::push_samples(&self.state.samples, samples);
  }

  /// One-shot invocation used by setup/teardown: runs the named callable
  /// with an optional JSON argument and returns the JSON of its result.
  pub(crate) fn run_callable_once(
    &mut self,
    name: &str,
    arg_json: Option<Vec<u8>>,
  ) -> AnyResult<Option<Vec<u8>>> {
    let func = self
      .instance
      .get_callable(name)
      .ok_or_else(|| anyhow::anyhow!("function {name:?} not found in exports"))?;

    let arg = {
      let scope = &mut self.instance.rt.handle_scope();
      let value: v8::Local<v8::Value> = match &arg_json {
        Some(bytes) => {
          let text = String::from_utf8_lossy(bytes);
          let json = v8::String::new(scope, &text).unwrap();
          v8::json::parse(scope, json).unwrap_or_else(|| v8::undefined(scope).into())
        }
        None => v8::undefined(scope).into(),
      };
      v8::Global::new(scope, value)
    };

    let token = CancellationToken::new();
    let result = self.run_fn(false, func, vec![arg], &token)?;

    let Some(result) = result else {
      return Ok(None);
    };
    let scope = &mut self.instance.rt.handle_scope();
    let local = v8::Local::new(scope, result);
    if local.is_undefined() || local.is_null() {
      return Ok(None);
    }
    match v8::json::stringify(scope, local) {
      Some(json) => Ok(Some(json.to_rust_string_lossy(scope).into_bytes())),
      None => Ok(None),
    }
  }

  /// Runs the summary wrapper around the optional `handleSummary` export;
  /// returns output-path → contents.
  pub(crate) fn run_summary(
    &mut self,
    data_json: &str,
    json_path: Option<&str>,
  ) -> AnyResult<HashMap<String, Vec<u8>>> {
    const SUMMARY_WRAPPER: &str = include_str!("../js/runtime/20__summary.js");

    let (wrapper, args) = {
      let scope = &mut self.instance.rt.handle_scope();

      let wrapper = crate::js::hook::execute_script(scope, "drover:runtime/20__summary.js", SUMMARY_WRAPPER)?;
      let wrapper = v8::Local::<v8::Function>::try_from(wrapper)
        .map_err(|_| anyhow::anyhow!("summary wrapper must evaluate to a function"))?;
      let wrapper = v8::Global::new(scope, wrapper);

      let exported: v8::Local<v8::Value> = match self.instance.get_callable("handleSummary")
      {
        Some(func) => v8::Local::new(scope, func).into(),
        None => v8::undefined(scope).into(),
      };

      let data_str = v8::String::new(scope, data_json).unwrap();
      let data: v8::Local<v8::Value> = v8::json::parse(scope, data_str)
        .unwrap_or_else(|| v8::undefined(scope).into());

      let json_path: v8::Local<v8::Value> = match json_path {
        Some(path) => v8::String::new(scope, path).unwrap().into(),
        None => v8::undefined(scope).into(),
      };

      let args = vec![
        v8::Global::new(scope, exported),
        v8::Global::new(scope, data),
        v8::Global::new(scope, json_path),
      ];
      (wrapper, args)
    };

    let token = CancellationToken::new();
    let result = self.run_fn(false, wrapper, args, &token)?;

    let Some(result) = result else {
      return Ok(HashMap::new());
    };

    let scope = &mut self.instance.rt.handle_scope();
    let local = v8::Local::new(scope, result);
    let Some(obj) = local.to_object(scope) else {
      return Ok(HashMap::new());
    };

    let mut outputs = HashMap::new();
    if let Some(names) = obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
    {
      for i in 0..names.length() {
        let Some(name) = names.get_index(scope, i) else {
          continue;
        };
        let key = name.to_rust_string_lossy(scope);
        let Some(value) = obj.get(scope, name) else {
          continue;
        };
        if value.is_array_buffer() {
          let buf = v8::Local::<v8::ArrayBuffer>::try_from(value).unwrap();
          let store = buf.get_backing_store();
          let len = buf.byte_length();
          let bytes = match store.data() {
            Some(data) => unsafe {
              std::slice::from_raw_parts(data.as_ptr() as *const u8, len).to_vec()
            },
            None => vec![],
          };
          outputs.insert(key, bytes);
        } else if !value.is_undefined() && !value.is_null() {
          outputs.insert(key, value.to_rust_string_lossy(scope).into_bytes());
        }
      }
    }
    Ok(outputs)
  }
}

impl Drop for Vu {
  fn drop(&mut self) {
    if let Some(act) = self.activation.take() {
      act.watcher_done.cancel();
    }
  }
}

/// The activated overlay; one iteration per [`ActiveVu::run_once`] call.
pub struct ActiveVu<'a> {
  vu: &'a mut Vu,
}

impl ActiveVu<'_> {
  pub fn run_once(&mut self) -> AnyResult<()> {
    self.vu.run_once_inner()
  }

  pub fn vu(&mut self) -> &mut Vu {
    self.vu
  }
}
