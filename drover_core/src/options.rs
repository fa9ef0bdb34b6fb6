//! The declarative test options a script exports, with the merge and
//! strict-then-loose parse rules.

use crate::prelude::*;
use crate::types::{
  DnsOptions, Duration, HostAddress, HostnameBlocklist, IpBlock, IpPool, Stage, SystemTag,
  TlsAuth, TlsVersions,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration as StdDuration;

pub const DEFAULT_SETUP_TIMEOUT: StdDuration = StdDuration::from_secs(60);
pub const DEFAULT_TEARDOWN_TIMEOUT: StdDuration = StdDuration::from_secs(60);

/// Every field is optional; unset means "not configured here". Merge
/// precedence is resolved by [`Options::apply`]: externally-supplied options
/// over script-exported options over defaults, last write wins per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub paused: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vus: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub iterations: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration: Option<Duration>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stages: Option<Vec<Stage>>,
  /// Scenario configurations are owned by the external scheduler; the core
  /// carries them opaquely.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub scenarios: Option<serde_json::Map<String, serde_json::Value>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_redirects: Option<i64>,
  #[serde(
    rename = "insecureSkipTLSVerify",
    skip_serializing_if = "Option::is_none"
  )]
  pub insecure_skip_tls_verify: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tls_cipher_suites: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tls_version: Option<TlsVersions>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tls_auth: Option<Vec<TlsAuth>>,
  /// Threshold expressions are evaluated by an external renderer; carried
  /// opaquely, keyed by metric selector.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub thresholds: Option<BTreeMap<String, serde_json::Value>>,
  #[serde(rename = "blacklistIPs", skip_serializing_if = "Option::is_none")]
  pub blacklist_ips: Option<Vec<IpBlock>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub block_hostnames: Option<HostnameBlocklist>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub hosts: Option<BTreeMap<String, HostAddress>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub no_connection_reuse: Option<bool>,
  #[serde(
    rename = "noVUConnectionReuse",
    skip_serializing_if = "Option::is_none"
  )]
  pub no_vu_connection_reuse: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub min_iteration_duration: Option<Duration>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub setup_timeout: Option<Duration>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub teardown_timeout: Option<Duration>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rps: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_per_host: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user_agent: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dns: Option<DnsOptions>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub system_tags: Option<BTreeSet<SystemTag>>,
  /// Metric tags applied to every sample of the run. The canonical JSON key
  /// is `tags`; `runTags` is accepted as an alias.
  #[serde(
    rename = "tags",
    alias = "runTags",
    skip_serializing_if = "Option::is_none"
  )]
  pub run_tags: Option<BTreeMap<String, String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub summary_trend_stats: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub summary_time_unit: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub discard_response_bodies: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub no_cookies_reset: Option<bool>,
  #[serde(rename = "localIPs", skip_serializing_if = "Option::is_none")]
  pub local_ips: Option<IpPool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub console_output: Option<String>,
}

/// JSON keys the parser recognizes; anything else triggers the
/// unknown-fields warning and is then ignored.
const KNOWN_FIELDS: &[&str] = &[
  "paused",
  "vus",
  "iterations",
  "duration",
  "stages",
  "scenarios",
  "maxRedirects",
  "insecureSkipTLSVerify",
  "tlsCipherSuites",
  "tlsVersion",
  "tlsAuth",
  "thresholds",
  "blacklistIPs",
  "blockHostnames",
  "hosts",
  "noConnectionReuse",
  "noVUConnectionReuse",
  "minIterationDuration",
  "setupTimeout",
  "teardownTimeout",
  "rps",
  "batch",
  "batchPerHost",
  "userAgent",
  "dns",
  "systemTags",
  "tags",
  "runTags",
  "summaryTrendStats",
  "summaryTimeUnit",
  "discardResponseBodies",
  "noCookiesReset",
  "localIPs",
  "consoleOutput",
];

/// Parses an exported `options` JSON value. Unknown fields produce a warning
/// message (second tuple slot) but never a failure; type errors on known
/// fields do fail.
pub fn parse_options(value: &serde_json::Value) -> AnyResult<(Options, Option<String>)> {
  let unknown: Vec<String> = match value {
    serde_json::Value::Object(obj) => obj
      .keys()
      .filter(|k| !KNOWN_FIELDS.contains(&k.as_str()))
      .cloned()
      .collect(),
    _ => vec![],
  };

  let warning = if unknown.is_empty() {
    None
  } else {
    Some(
      unknown
        .iter()
        .map(|f| format!("unknown field \"{f}\""))
        .collect::<Vec<_>>()
        .join("; "),
    )
  };

  let opts: Options = serde_json::from_value(value.clone())?;
  Ok((opts, warning))
}

impl Options {
  /// Overlays `other` onto `self`: every set field of `other` wins.
  pub fn apply(&mut self, other: &Options) {
    macro_rules! overlay {
      ($($field:ident),+ $(,)?) => {
        $(
          if other.$field.is_some() {
            self.$field = other.$field.clone();
          }
        )+
      };
    }
    overlay!(
      paused,
      vus,
      iterations,
      duration,
      stages,
      scenarios,
      max_redirects,
      insecure_skip_tls_verify,
      tls_cipher_suites,
      tls_version,
      tls_auth,
      thresholds,
      blacklist_ips,
      block_hostnames,
      hosts,
      no_connection_reuse,
      no_vu_connection_reuse,
      min_iteration_duration,
      setup_timeout,
      teardown_timeout,
      rps,
      batch,
      batch_per_host,
      user_agent,
      dns,
      system_tags,
      run_tags,
      summary_trend_stats,
      summary_time_unit,
      discard_response_bodies,
      no_cookies_reset,
      local_ips,
      console_output,
    );
  }

  pub fn validate(&self) -> AnyResult<()> {
    if let Some(vus) = self.vus {
      if vus < 0 {
        anyhow::bail!("the number of VUs can't be negative");
      }
    }
    if let Some(iterations) = self.iterations {
      if iterations < 0 {
        anyhow::bail!("the number of iterations can't be negative");
      }
    }
    if let Some(rps) = self.rps {
      if rps < 0.0 {
        anyhow::bail!("rps can't be negative");
      }
    }
    if let Some(stages) = &self.stages {
      for stage in stages {
        if matches!(stage.target, Some(t) if t < 0) {
          anyhow::bail!("stage targets can't be negative");
        }
      }
    }
    if let Some(suites) = &self.tls_cipher_suites {
      for name in suites {
        if crate::types::cipher_suite_id(name).is_none() {
          anyhow::bail!("unknown cipher suite {name:?}");
        }
      }
    }
    if let Some(versions) = &self.tls_version {
      if versions.min > versions.max {
        anyhow::bail!("tls_version min can't be greater than max");
      }
    }
    Ok(())
  }

  pub fn setup_timeout(&self) -> StdDuration {
    self
      .setup_timeout
      .map(|d| d.as_std())
      .unwrap_or(DEFAULT_SETUP_TIMEOUT)
  }

  pub fn teardown_timeout(&self) -> StdDuration {
    self
      .teardown_timeout
      .map(|d| d.as_std())
      .unwrap_or(DEFAULT_TEARDOWN_TIMEOUT)
  }

  pub fn system_tag_enabled(&self, tag: SystemTag) -> bool {
    match &self.system_tags {
      Some(set) => set.contains(&tag),
      None => crate::types::default_system_tags().contains(&tag),
    }
  }
}

#[cfg(test)]
mod options_tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn parse1() {
    let (opts, warning) = parse_options(&json!({
      "vus": 10,
      "duration": "30s",
      "insecureSkipTLSVerify": true,
      "noVUConnectionReuse": true,
    }))
    .unwrap();
    assert!(warning.is_none());
    assert_eq!(opts.vus, Some(10));
    assert_eq!(
      opts.duration.unwrap().as_std(),
      StdDuration::from_secs(30)
    );
    assert_eq!(opts.insecure_skip_tls_verify, Some(true));
    assert_eq!(opts.no_vu_connection_reuse, Some(true));
  }

  #[test]
  fn parse_unknown_fields1() {
    let (opts, warning) = parse_options(&json!({
      "something": {"x": 1},
      "vus": 2,
    }))
    .unwrap();
    assert_eq!(opts.vus, Some(2));
    assert!(warning.unwrap().contains("unknown field \"something\""));
  }

  #[test]
  fn parse_wrong_type1() {
    let err = parse_options(&json!([1, 2])).unwrap_err();
    assert!(
      err.to_string().contains("invalid type: sequence"),
      "got: {err}"
    );
  }

  #[test]
  fn parse_stages1() {
    let (opts, _) = parse_options(&json!({
      "stages": [
        {"duration": "10s", "target": 10},
        {"duration": "5s"},
      ],
    }))
    .unwrap();
    let stages = opts.stages.unwrap();
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0].duration.as_std(), StdDuration::from_secs(10));
    assert_eq!(stages[0].target, Some(10));
    assert_eq!(stages[1].duration.as_std(), StdDuration::from_secs(5));
    assert_eq!(stages[1].target, None);
  }

  #[test]
  fn parse_run_tags_alias1() {
    let (opts, _) = parse_options(&json!({"tags": {"env": "stage"}})).unwrap();
    assert_eq!(opts.run_tags.unwrap()["env"], "stage");
    let (opts, _) = parse_options(&json!({"runTags": {"env": "prod"}})).unwrap();
    assert_eq!(opts.run_tags.unwrap()["env"], "prod");
  }

  #[test]
  fn apply1() {
    let mut base = Options {
      vus: Some(1),
      duration: Some(Duration::from_millis(1000)),
      ..Default::default()
    };
    let overlay = Options {
      vus: Some(5),
      ..Default::default()
    };
    base.apply(&overlay);
    assert_eq!(base.vus, Some(5));
    // Unset fields in the overlay leave the base untouched.
    assert_eq!(base.duration, Some(Duration::from_millis(1000)));
  }

  #[test]
  fn validate1() {
    let opts = Options {
      vus: Some(-1),
      ..Default::default()
    };
    assert!(opts.validate().is_err());

    let opts = Options {
      tls_cipher_suites: Some(vec!["TLS_MADE_UP".to_string()]),
      ..Default::default()
    };
    assert!(opts.validate().is_err());
  }

  #[test]
  fn serialize_roundtrip1() {
    let (opts, _) = parse_options(&json!({
      "vus": 3,
      "blacklistIPs": ["10.0.0.0/8"],
      "hosts": {"test.example.com": "10.2.2.2:8080"},
      "tlsVersion": "tls1.2",
      "minIterationDuration": "2s",
    }))
    .unwrap();
    let round: Options =
      serde_json::from_value(serde_json::to_value(&opts).unwrap()).unwrap();
    assert_eq!(opts, round);
  }
}
