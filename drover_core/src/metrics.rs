//! Metric model: the registry, the built-in metrics every run carries and
//! the samples that flow to the external output.

use crate::prelude::*;
use crate::types::SystemTag;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::UnboundedSender;

pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
  Counter,
  Gauge,
  Rate,
  Trend,
}

/// What the numeric sample values of a metric mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
  Default,
  Time,
  Data,
}

#[derive(Debug)]
pub struct Metric {
  pub name: String,
  pub metric_type: MetricType,
  pub contains: ValueType,
}

/// Per-test-run metric registry. Metric identity is by name; registering an
/// existing name with a different shape is an error.
#[derive(Default)]
pub struct Registry {
  metrics: Mutex<HashMap<String, Arc<Metric>>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn new_metric(
    &self,
    name: &str,
    metric_type: MetricType,
    contains: ValueType,
  ) -> AnyResult<Arc<Metric>> {
    let mut metrics = self.metrics.lock();
    if let Some(existing) = metrics.get(name) {
      if existing.metric_type != metric_type || existing.contains != contains {
        anyhow::bail!("metric {name:?} already registered with a different type");
      }
      return Ok(existing.clone());
    }
    let metric = Arc::new(Metric {
      name: name.to_string(),
      metric_type,
      contains,
    });
    metrics.insert(name.to_string(), metric.clone());
    Ok(metric)
  }

  pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
    self.metrics.lock().get(name).cloned()
  }
}

/// The metrics the runtime itself emits, resolved once per test run.
pub struct BuiltinMetrics {
  pub iterations: Arc<Metric>,
  pub iteration_duration: Arc<Metric>,
  pub data_sent: Arc<Metric>,
  pub data_received: Arc<Metric>,
  pub vus: Arc<Metric>,
  pub vus_max: Arc<Metric>,
}

impl BuiltinMetrics {
  pub fn register(registry: &Registry) -> AnyResult<Self> {
    Ok(Self {
      iterations: registry.new_metric(ITERATIONS, MetricType::Counter, ValueType::Default)?,
      iteration_duration: registry.new_metric(
        ITERATION_DURATION,
        MetricType::Trend,
        ValueType::Time,
      )?,
      data_sent: registry.new_metric(DATA_SENT, MetricType::Counter, ValueType::Data)?,
      data_received: registry.new_metric(
        DATA_RECEIVED,
        MetricType::Counter,
        ValueType::Data,
      )?,
      vus: registry.new_metric(VUS, MetricType::Gauge, ValueType::Default)?,
      vus_max: registry.new_metric(VUS_MAX, MetricType::Gauge, ValueType::Default)?,
    })
  }
}

/// Ordered tag set. BTreeMap keeps rendering deterministic.
pub type TagSet = BTreeMap<String, String>;

/// The per-VU mutable tag and metadata state, replaced wholesale on
/// activation and stamped onto every emitted sample.
#[derive(Debug, Clone, Default)]
pub struct TagsAndMeta {
  pub tags: TagSet,
  pub metadata: BTreeMap<String, String>,
}

impl TagsAndMeta {
  pub fn set_tag(&mut self, key: &str, value: impl Into<String>) {
    self.tags.insert(key.to_string(), value.into());
  }

  pub fn set_system_tag(&mut self, tag: SystemTag, value: impl Into<String>) {
    self.set_tag(tag.as_str(), value);
  }

  pub fn delete_tag(&mut self, key: &str) {
    self.tags.remove(key);
  }
}

#[derive(Clone)]
pub struct Sample {
  pub metric: Arc<Metric>,
  pub tags: TagSet,
  pub metadata: BTreeMap<String, String>,
  pub time: SystemTime,
  pub value: f64,
}

impl std::fmt::Debug for Sample {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Sample")
      .field("metric", &self.metric.name)
      .field("tags", &self.tags)
      .field("value", &self.value)
      .finish()
  }
}

/// The channel-typed sink samples flow through; provided by the caller of
/// `Runner::new_vu` and the setup/teardown entry points.
pub type SampleSender = UnboundedSender<Vec<Sample>>;

/// Converts a wall-clock duration into the floating-point milliseconds
/// convention used by time-valued metrics.
pub fn duration_millis(d: std::time::Duration) -> f64 {
  d.as_secs_f64() * 1000.0
}

/// Pushes a batch, quietly dropping it when the receiver is gone (the test
/// is shutting down and nobody reads samples anymore).
pub fn push_samples(out: &SampleSender, samples: Vec<Sample>) {
  if samples.is_empty() {
    return;
  }
  let _ = out.send(samples);
}

#[cfg(test)]
mod metrics_tests {
  use super::*;

  #[test]
  fn registry1() {
    let registry = Registry::new();
    let m1 = registry
      .new_metric("my_counter", MetricType::Counter, ValueType::Default)
      .unwrap();
    let m2 = registry
      .new_metric("my_counter", MetricType::Counter, ValueType::Default)
      .unwrap();
    assert!(Arc::ptr_eq(&m1, &m2));
    assert!(registry
      .new_metric("my_counter", MetricType::Gauge, ValueType::Default)
      .is_err());
  }

  #[test]
  fn builtin1() {
    let registry = Registry::new();
    let builtin = BuiltinMetrics::register(&registry).unwrap();
    assert_eq!(builtin.iteration_duration.metric_type, MetricType::Trend);
    assert_eq!(builtin.iteration_duration.contains, ValueType::Time);
    assert!(registry.get(ITERATIONS).is_some());
  }

  #[test]
  fn duration_millis1() {
    let d = std::time::Duration::from_nanos(1_500_000);
    assert!((duration_millis(d) - 1.5).abs() < 1e-9);
  }
}
