//! The Runner: owner of per-test shared resources and the factory of VUs,
//! plus the one-shot setup/teardown/summary invocations.

pub mod vu;

use crate::archive::Archive;
use crate::bufpool::BufferPool;
use crate::bundle::{Bundle, RuntimeOptions, Source};
use crate::errext::{ContextCanceled, TimeoutError};
use crate::events;
use crate::fsext::FsMap;
use crate::js::binding::console::Console;
use crate::js::InterruptReason;
use crate::limiter::RpsLimiter;
use crate::metrics::{BuiltinMetrics, Registry, SampleSender, TagSet};
use crate::modules::ModuleRegistry;
use crate::netext::{build_tls_config, Dialer};
use crate::options::Options;
use crate::prelude::*;
use crate::state::{State, StateFields};
use crate::types::SystemTag;
use crate::usage::Usage;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vu::Vu;

/// HandleSummary always runs under this fixed deadline.
pub const SUMMARY_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Everything that exists before any script is read, shared by every
/// Runner of the process.
pub struct PreInitState {
  pub registry: Arc<Registry>,
  pub builtin_metrics: Arc<BuiltinMetrics>,
  pub events: Arc<events::System>,
  pub usage: Arc<Usage>,
  pub module_registry: Arc<ModuleRegistry>,
  pub runtime_options: RuntimeOptions,
  pub runtime_version: String,
  // Keeps the default runtime alive when we created it ourselves.
  _tokio_rt: Option<tokio::runtime::Runtime>,
  tokio_handle: tokio::runtime::Handle,
}

impl PreInitState {
  /// Builds a PreInitState with its own small tokio runtime for timers and
  /// watchers.
  pub fn new(runtime_options: RuntimeOptions) -> AnyResult<Arc<Self>> {
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .thread_name("drover-worker")
      .enable_all()
      .build()?;
    let tokio_handle = tokio_rt.handle().clone();
    Self::assemble(runtime_options, Some(tokio_rt), tokio_handle)
  }

  /// For embedders that already run tokio.
  pub fn with_handle(
    runtime_options: RuntimeOptions,
    tokio_handle: tokio::runtime::Handle,
  ) -> AnyResult<Arc<Self>> {
    Self::assemble(runtime_options, None, tokio_handle)
  }

  fn assemble(
    runtime_options: RuntimeOptions,
    tokio_rt: Option<tokio::runtime::Runtime>,
    tokio_handle: tokio::runtime::Handle,
  ) -> AnyResult<Arc<Self>> {
    let registry = Arc::new(Registry::new());
    let builtin_metrics = Arc::new(BuiltinMetrics::register(&registry)?);
    Ok(Arc::new(Self {
      registry,
      builtin_metrics,
      events: Arc::new(events::System::new()),
      usage: Arc::new(Usage::new()),
      module_registry: crate::modules::global_registry(),
      runtime_options,
      runtime_version: env!("CARGO_PKG_VERSION").to_string(),
      _tokio_rt: tokio_rt,
      tokio_handle,
    }))
  }

  pub fn tokio_handle(&self) -> tokio::runtime::Handle {
    self.tokio_handle.clone()
  }
}

/// The aggregated end-of-test data handed to `handleSummary`.
#[derive(Debug, Clone, Default)]
pub struct Summary {
  pub metrics: serde_json::Value,
  pub root_group: serde_json::Value,
  pub test_run_duration: Duration,
  pub no_color: bool,
  /// When set, a JSON rendering of the metrics is added under this output
  /// path.
  pub summary_json_path: Option<String>,
}

pub struct Runner {
  pub bundle: Bundle,
  pub preinit: Arc<PreInitState>,
  options: RwLock<Options>,
  console: RwLock<Arc<Console>>,
  run_tags: Arc<RwLock<TagSet>>,
  rps_limit: RwLock<Option<Arc<RpsLimiter>>>,
  tls_config: RwLock<Arc<rustls::ClientConfig>>,
  buffer_pool: Arc<BufferPool>,
  setup_data: Arc<RwLock<Option<Vec<u8>>>>,
  tls_auth_warning: Once,
}

impl Runner {
  pub fn new(
    preinit: Arc<PreInitState>,
    source: Source,
    filesystems: FsMap,
  ) -> AnyResult<Runner> {
    let bundle = Bundle::new(
      &preinit.runtime_options,
      source,
      filesystems,
      preinit.module_registry.clone(),
      preinit.tokio_handle(),
    )?;
    Self::from_bundle(preinit, bundle)
  }

  pub fn from_archive(preinit: Arc<PreInitState>, archive: &Archive) -> AnyResult<Runner> {
    let bundle = Bundle::from_archive(
      &preinit.runtime_options,
      archive,
      preinit.module_registry.clone(),
      preinit.tokio_handle(),
    )?;
    Self::from_bundle(preinit, bundle)
  }

  fn from_bundle(preinit: Arc<PreInitState>, bundle: Bundle) -> AnyResult<Runner> {
    let script_options = bundle.options.clone();
    let runner = Runner {
      bundle,
      preinit,
      options: RwLock::new(Options::default()),
      console: RwLock::new(Arc::new(Console::new())),
      run_tags: Arc::new(RwLock::new(TagSet::new())),
      rps_limit: RwLock::new(None),
      tls_config: RwLock::new(Arc::new(build_tls_config(&Options::default())?)),
      buffer_pool: Arc::new(BufferPool::new()),
      setup_data: Arc::new(RwLock::new(None)),
      tls_auth_warning: Once::new(),
    };
    runner.set_options(&script_options)?;
    runner
      .preinit
      .usage
      .set_text("compatibility_mode", runner.bundle.compatibility_mode.as_str());
    Ok(runner)
  }

  pub fn make_archive(&self) -> Archive {
    self.bundle.make_archive(&self.get_options())
  }

  pub fn get_options(&self) -> Options {
    self.options.read().clone()
  }

  /// Validates and applies options on top of the script-exported baseline,
  /// rewiring the shared resources they configure.
  pub fn set_options(&self, opts: &Options) -> AnyResult<()> {
    opts.validate()?;

    let mut merged = self.bundle.options.clone();
    merged.apply(opts);

    if let Some(auths) = &merged.tls_auth {
      if auths.iter().any(|a| a.domains.is_empty()) {
        self.tls_auth_warning.call_once(|| {
          warn!(
            "a tlsAuth certificate has no domains configured and will never \
             be selected for a connection"
          );
        });
      }
    }
    *self.tls_config.write() = Arc::new(build_tls_config(&merged)?);

    *self.rps_limit.write() = merged.rps.and_then(RpsLimiter::new).map(Arc::new);

    *self.console.write() = match &merged.console_output {
      Some(path) => Arc::new(Console::with_output_file(path)?),
      None => Arc::new(Console::new()),
    };

    *self.run_tags.write() = merged
      .run_tags
      .clone()
      .map(|tags| tags.into_iter().collect())
      .unwrap_or_default();

    *self.options.write() = merged;
    Ok(())
  }

  /// True for every export the scheduler may reference as an `exec`.
  pub fn is_executable(&self, name: &str) -> bool {
    self.bundle.callable_exports.contains(name)
  }

  pub fn get_setup_data(&self) -> Option<Vec<u8>> {
    self.setup_data.read().clone()
  }

  /// Lets a distributed coordinator inject setup data produced elsewhere.
  pub fn set_setup_data(&self, data: Option<Vec<u8>>) {
    *self.setup_data.write() = data;
  }

  /// Creates an initialized VU. `init_ctx`, when given, can cancel a
  /// long-running init.
  pub fn new_vu(
    &self,
    init_ctx: Option<CancellationToken>,
    id_local: u64,
    id_global: u64,
    samples: SampleSender,
  ) -> AnyResult<Vu> {
    let options = self.get_options();

    let local_addr = options
      .local_ips
      .as_ref()
      .and_then(|pool| pool.at(id_local.saturating_sub(1)));
    let dialer = Arc::new(Dialer::from_options(&options, local_addr));

    let state = Arc::new(State::from(StateFields {
      options: options.clone(),
      dialer,
      tls_config: self.tls_config.read().clone(),
      cookie_jar: Arc::new(crate::cookiejar::CookieJar::new()),
      rps_limit: self.rps_limit.read().clone(),
      buffer_pool: self.buffer_pool.clone(),
      vu_id: id_local,
      vu_id_global: id_global,
      samples: samples.clone(),
      builtin_metrics: self.preinit.builtin_metrics.clone(),
      usage: self.preinit.usage.clone(),
    }));

    let instance = self.bundle.instantiate(crate::bundle::InstantiateParams {
      vu_id: id_local,
      console: self.console.read().clone(),
      tokio_handle: self.preinit.tokio_handle(),
      state: Some(state.clone()),
      init_ctx,
    })?;
    self.preinit.usage.count("vus_initialized", 1);

    Ok(Vu::new(
      instance,
      state,
      id_local,
      id_global,
      self.preinit.events.clone(),
      self.run_tags.clone(),
      self.setup_data.clone(),
      self.preinit.tokio_handle(),
    ))
  }

  /// Runs the script's `setup` export (noop when absent) under its
  /// deadline and stores the JSON-serialized result.
  pub fn setup(&self, parent: &CancellationToken, samples: SampleSender) -> AnyResult<()> {
    if !self.is_executable("setup") {
      return Ok(());
    }
    let timeout = self.get_options().setup_timeout();
    let data = self.run_part(parent, samples, "setup", None, timeout)?;
    *self.setup_data.write() = data;
    Ok(())
  }

  /// Runs `teardown` with the decoded setup data (or `undefined`).
  pub fn teardown(&self, parent: &CancellationToken, samples: SampleSender) -> AnyResult<()> {
    if !self.is_executable("teardown") {
      return Ok(());
    }
    let timeout = self.get_options().teardown_timeout();
    let arg = self.setup_data.read().clone();
    self.run_part(parent, samples, "teardown", arg, timeout)?;
    Ok(())
  }

  /// Invokes `handleSummary` (or the default rendering) under the fixed
  /// two-minute deadline, returning output-path → contents.
  pub fn handle_summary(
    &self,
    summary: &Summary,
    samples: SampleSender,
  ) -> AnyResult<HashMap<String, Vec<u8>>> {
    use std::io::IsTerminal;

    let options = self.get_options();
    let setup_data: serde_json::Value = match self.get_setup_data() {
      Some(bytes) => serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
      None => serde_json::Value::Null,
    };

    let data = serde_json::json!({
      "root_group": summary.root_group,
      "options": {
        "summaryTrendStats": options.summary_trend_stats,
        "summaryTimeUnit": options.summary_time_unit,
        "noColor": summary.no_color,
      },
      "state": {
        "isStdOutTTY": std::io::stdout().is_terminal(),
        "isStdErrTTY": std::io::stderr().is_terminal(),
        "testRunDurationMs": crate::metrics::duration_millis(summary.test_run_duration),
      },
      "metrics": summary.metrics,
      "setup_data": setup_data,
    });

    let mut vu = self.new_vu(None, 0, 0, samples)?;
    let (deadline_hit, watch_done) = self.watch_deadline(&vu, None, SUMMARY_TIMEOUT);

    if options.system_tag_enabled(SystemTag::Group) {
      vu.state()
        .tags
        .lock()
        .set_system_tag(SystemTag::Group, "::handleSummary");
    }

    let result = vu.run_summary(
      &data.to_string(),
      summary.summary_json_path.as_deref(),
    );
    watch_done.cancel();

    self.map_part_error(result, "handleSummary", SUMMARY_TIMEOUT, &deadline_hit)
  }

  /// The shared primitive behind setup/teardown: a transient VU (ids 0/0)
  /// running one callable under a deadline.
  fn run_part(
    &self,
    parent: &CancellationToken,
    samples: SampleSender,
    name: &str,
    arg_json: Option<Vec<u8>>,
    timeout: Duration,
  ) -> AnyResult<Option<Vec<u8>>> {
    let mut vu = self.new_vu(None, 0, 0, samples)?;
    let (deadline_hit, watch_done) = self.watch_deadline(&vu, Some(parent), timeout);

    if self.get_options().system_tag_enabled(SystemTag::Group) {
      vu.state()
        .tags
        .lock()
        .set_system_tag(SystemTag::Group, format!("::{name}"));
    }

    let result = vu.run_callable_once(name, arg_json);
    watch_done.cancel();

    self.map_part_error(result, name, timeout, &deadline_hit)
  }

  /// Interrupts the VU's isolate when the deadline (or the parent context)
  /// fires. Returns the deadline flag and the cancel handle for the
  /// watcher itself.
  fn watch_deadline(
    &self,
    vu: &Vu,
    parent: Option<&CancellationToken>,
    timeout: Duration,
  ) -> (Arc<AtomicBool>, CancellationToken) {
    let deadline_hit = Arc::new(AtomicBool::new(false));
    let watch_done = CancellationToken::new();

    let interrupt = vu.interrupt_slot();
    let loop_shared = vu.loop_shared();
    let deadline_flag = deadline_hit.clone();
    let done = watch_done.clone();
    let parent = parent.cloned().unwrap_or_default();

    self.preinit.tokio_handle().spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(timeout) => {
          deadline_flag.store(true, Ordering::SeqCst);
          interrupt.interrupt(InterruptReason::Deadline);
          loop_shared.wake();
        }
        _ = parent.cancelled() => {
          interrupt.interrupt(InterruptReason::Canceled);
          loop_shared.wake();
        }
        _ = done.cancelled() => {}
      }
    });

    (deadline_hit, watch_done)
  }

  /// Spec'd error shaping: a deadline expiry without a more specific
  /// script abort becomes a [`TimeoutError`] for the stage.
  fn map_part_error<T>(
    &self,
    result: AnyResult<T>,
    name: &str,
    timeout: Duration,
    deadline_hit: &AtomicBool,
  ) -> AnyResult<T> {
    match result {
      Ok(v) => Ok(v),
      Err(e) => {
        if deadline_hit.load(Ordering::SeqCst) {
          // The plain cancellation sentinel means nothing more specific
          // happened; synthesize the stage timeout. Script aborts and
          // script errors win over it.
          if e.downcast_ref::<ContextCanceled>().is_some() {
            return Err(TimeoutError::new(name, timeout).into());
          }
        }
        Err(e)
      }
    }
  }
}
