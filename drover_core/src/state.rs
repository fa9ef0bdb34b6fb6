//! Per-VU state: the bag of shared and per-VU resources handed to every
//! binding and external protocol module.

use crate::bufpool::BufferPool;
use crate::cookiejar::CookieJar;
use crate::limiter::RpsLimiter;
use crate::metrics::{BuiltinMetrics, SampleSender, TagsAndMeta};
use crate::netext::Dialer;
use crate::options::Options;
use crate::usage::Usage;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Sentinel for "the external scheduler has not told us"; consumers must
/// treat it as unknown rather than a huge iteration number.
pub const ITERATION_UNKNOWN: u64 = u64::MAX;

/// Scenario-scoped iteration bookkeeping for one VU.
#[derive(Debug, Clone)]
pub struct ScenarioState {
  pub name: Option<String>,
  /// This VU's iteration number within the scenario, process-local.
  pub iteration_local: u64,
  /// The scenario's iteration number across all instances of a
  /// distributed run.
  pub iteration_global: u64,
}

impl Default for ScenarioState {
  fn default() -> Self {
    Self {
      name: None,
      iteration_local: ITERATION_UNKNOWN,
      iteration_global: ITERATION_UNKNOWN,
    }
  }
}

/// Everything one VU carries across iterations. The Runner-owned pieces
/// (buffer pool, RPS limiter, builtin metrics, usage) are shared; the rest
/// is exclusive to this VU.
pub struct State {
  pub options: Options,
  pub dialer: Arc<Dialer>,
  pub tls_config: Arc<rustls::ClientConfig>,
  pub cookie_jar: Arc<CookieJar>,
  pub rps_limit: Option<Arc<RpsLimiter>>,
  pub buffer_pool: Arc<BufferPool>,
  /// Local VU id, 1..N within this process; 0 for init/setup/teardown/
  /// summary transient VUs.
  pub vu_id: u64,
  /// Globally-unique VU id across a distributed run.
  pub vu_id_global: u64,
  pub samples: SampleSender,
  pub tags: Mutex<TagsAndMeta>,
  pub builtin_metrics: Arc<BuiltinMetrics>,
  pub usage: Arc<Usage>,
  /// `__ITER`: starts at -1, incremented before each iteration runs.
  iteration: AtomicI64,
  pub scenario: Mutex<ScenarioState>,
  pub group_stack: Mutex<Vec<String>>,
}

impl State {
  pub fn iteration(&self) -> i64 {
    self.iteration.load(Ordering::Relaxed)
  }

  /// Bumps `__ITER`, returning the new value.
  pub fn increment_iteration(&self) -> i64 {
    self.iteration.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub fn reset_iteration(&self) {
    self.iteration.store(-1, Ordering::Relaxed);
  }
}

/// Builder-ish constructor keeping the field soup in one place.
pub struct StateFields {
  pub options: Options,
  pub dialer: Arc<Dialer>,
  pub tls_config: Arc<rustls::ClientConfig>,
  pub cookie_jar: Arc<CookieJar>,
  pub rps_limit: Option<Arc<RpsLimiter>>,
  pub buffer_pool: Arc<BufferPool>,
  pub vu_id: u64,
  pub vu_id_global: u64,
  pub samples: SampleSender,
  pub builtin_metrics: Arc<BuiltinMetrics>,
  pub usage: Arc<Usage>,
}

impl From<StateFields> for State {
  fn from(f: StateFields) -> Self {
    State {
      options: f.options,
      dialer: f.dialer,
      tls_config: f.tls_config,
      cookie_jar: f.cookie_jar,
      rps_limit: f.rps_limit,
      buffer_pool: f.buffer_pool,
      vu_id: f.vu_id,
      vu_id_global: f.vu_id_global,
      samples: f.samples,
      tags: Mutex::new(TagsAndMeta::default()),
      builtin_metrics: f.builtin_metrics,
      usage: f.usage,
      iteration: AtomicI64::new(-1),
      scenario: Mutex::new(ScenarioState::default()),
      group_stack: Mutex::new(vec![]),
    }
  }
}
