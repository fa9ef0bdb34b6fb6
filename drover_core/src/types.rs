//! Scalar types used by the declarative options: durations with the
//! `"1m30s"` string form, TLS versions and cipher suites, DNS resolution
//! knobs, IP blocks and hostname blocklists.

use crate::prelude::*;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration as StdDuration;

// Duration {

/// A wall-clock duration that (de)serializes as a duration string
/// (`"10s"`, `"1m30s"`, `"200ms"`). Plain JSON numbers are accepted and
/// interpreted as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub StdDuration);

impl Duration {
  pub fn from_millis(ms: u64) -> Self {
    Duration(StdDuration::from_millis(ms))
  }

  pub fn as_std(&self) -> StdDuration {
    self.0
  }
}

impl From<StdDuration> for Duration {
  fn from(d: StdDuration) -> Self {
    Duration(d)
  }
}

const NANOS_PER_UNIT: &[(&str, u64)] = &[
  ("ns", 1),
  ("us", 1_000),
  ("µs", 1_000),
  ("ms", 1_000_000),
  ("s", 1_000_000_000),
  ("m", 60 * 1_000_000_000),
  ("h", 3600 * 1_000_000_000),
];

/// Parses a duration string: a sequence of decimal numbers, each with an
/// optional fraction and a mandatory unit suffix (`ns`, `us`, `ms`, `s`,
/// `m`, `h`). `"0"` is accepted without a unit.
pub fn parse_duration(s: &str) -> AnyResult<StdDuration> {
  let orig = s;
  if s == "0" {
    return Ok(StdDuration::ZERO);
  }
  if s.is_empty() {
    anyhow::bail!("invalid duration {orig:?}");
  }

  let mut rest = s;
  let mut total_nanos: u128 = 0;
  while !rest.is_empty() {
    let num_end = rest
      .find(|c: char| !c.is_ascii_digit() && c != '.')
      .ok_or_else(|| anyhow::anyhow!("missing unit in duration {orig:?}"))?;
    if num_end == 0 {
      anyhow::bail!("invalid duration {orig:?}");
    }
    let (num, after) = rest.split_at(num_end);
    let value: f64 = num
      .parse()
      .map_err(|_| anyhow::anyhow!("invalid duration {orig:?}"))?;

    let (unit, nanos_per) = NANOS_PER_UNIT
      .iter()
      .filter(|(u, _)| after.starts_with(u))
      // Longest unit match wins so "ms" is not read as "m".
      .max_by_key(|(u, _)| u.len())
      .ok_or_else(|| anyhow::anyhow!("unknown unit in duration {orig:?}"))?;

    total_nanos += (value * *nanos_per as f64) as u128;
    rest = &after[unit.len()..];
  }

  Ok(StdDuration::from_nanos(total_nanos.try_into()?))
}

/// Renders a duration the way the string form writes it (`"1m30s"`).
pub fn format_duration(d: StdDuration) -> String {
  let nanos = d.as_nanos();
  if nanos == 0 {
    return "0s".to_string();
  }
  if nanos < 1_000_000_000 {
    // Sub-second: pick the coarsest unit that keeps an integral-ish value.
    let millis = d.as_secs_f64() * 1000.0;
    if nanos % 1_000_000 == 0 {
      return format!("{}ms", millis as u64);
    }
    if nanos % 1_000 == 0 {
      return format!("{}µs", nanos / 1_000);
    }
    return format!("{nanos}ns");
  }

  let mut out = String::new();
  let total_secs = d.as_secs();
  let hours = total_secs / 3600;
  let mins = (total_secs % 3600) / 60;
  let secs = total_secs % 60;
  let subsec = d.subsec_nanos();
  if hours > 0 {
    out.push_str(&format!("{hours}h"));
  }
  if mins > 0 {
    out.push_str(&format!("{mins}m"));
  }
  if secs > 0 || subsec > 0 {
    if subsec > 0 {
      let frac = format!("{:09}", subsec);
      let frac = frac.trim_end_matches('0');
      out.push_str(&format!("{secs}.{frac}s"));
    } else {
      out.push_str(&format!("{secs}s"));
    }
  }
  out
}

impl std::fmt::Display for Duration {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", format_duration(self.0))
  }
}

impl FromStr for Duration {
  type Err = AnyErr;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse_duration(s).map(Duration)
  }
}

impl Serialize for Duration {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for Duration {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
      serde_json::Value::String(s) => s.parse().map_err(DeError::custom),
      serde_json::Value::Number(n) => {
        let ms = n
          .as_f64()
          .ok_or_else(|| DeError::custom("invalid duration number"))?;
        Ok(Duration(StdDuration::from_secs_f64(ms / 1000.0)))
      }
      other => Err(DeError::custom(format!(
        "invalid duration: {other}, expected a string or a number"
      ))),
    }
  }
}

// Duration }

// Stages {

/// One entry of the `stages` ramping shorthand: hold/ramp for `duration`
/// towards `target` VUs. A missing target stays `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
  pub duration: Duration,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target: Option<i64>,
}

// Stages }

// TLS {

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
  Ssl30,
  Tls10,
  Tls11,
  Tls12,
  Tls13,
}

impl TlsVersion {
  pub fn as_str(&self) -> &'static str {
    match self {
      TlsVersion::Ssl30 => "ssl3.0",
      TlsVersion::Tls10 => "tls1.0",
      TlsVersion::Tls11 => "tls1.1",
      TlsVersion::Tls12 => "tls1.2",
      TlsVersion::Tls13 => "tls1.3",
    }
  }
}

impl FromStr for TlsVersion {
  type Err = AnyErr;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ssl3.0" => Ok(TlsVersion::Ssl30),
      "tls1.0" => Ok(TlsVersion::Tls10),
      "tls1.1" => Ok(TlsVersion::Tls11),
      "tls1.2" => Ok(TlsVersion::Tls12),
      "tls1.3" => Ok(TlsVersion::Tls13),
      _ => anyhow::bail!("unknown TLS version: {s:?}"),
    }
  }
}

impl Serialize for TlsVersion {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for TlsVersion {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(DeError::custom)
  }
}

/// `tlsVersion` accepts either a single version string (pinning both ends)
/// or a `{min, max}` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TlsVersions {
  pub min: TlsVersion,
  pub max: TlsVersion,
}

impl<'de> Deserialize<'de> for TlsVersions {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    struct MinMax {
      min: TlsVersion,
      max: TlsVersion,
    }

    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
      serde_json::Value::String(s) => {
        let version: TlsVersion = s.parse().map_err(DeError::custom)?;
        Ok(TlsVersions {
          min: version,
          max: version,
        })
      }
      other => {
        let mm: MinMax = serde_json::from_value(other).map_err(DeError::custom)?;
        Ok(TlsVersions {
          min: mm.min,
          max: mm.max,
        })
      }
    }
  }
}

/// Client certificate presented for the listed domains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsAuth {
  #[serde(default)]
  pub domains: Vec<String>,
  pub cert: String,
  pub key: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
}

/// IANA cipher-suite ids for the names the options accept.
const CIPHER_SUITES: &[(&str, u16)] = &[
  ("TLS_RSA_WITH_RC4_128_SHA", 0x0005),
  ("TLS_RSA_WITH_3DES_EDE_CBC_SHA", 0x000a),
  ("TLS_RSA_WITH_AES_128_CBC_SHA", 0x002f),
  ("TLS_RSA_WITH_AES_256_CBC_SHA", 0x0035),
  ("TLS_RSA_WITH_AES_128_GCM_SHA256", 0x009c),
  ("TLS_RSA_WITH_AES_256_GCM_SHA384", 0x009d),
  ("TLS_ECDHE_ECDSA_WITH_RC4_128_SHA", 0xc007),
  ("TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA", 0xc009),
  ("TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA", 0xc00a),
  ("TLS_ECDHE_RSA_WITH_RC4_128_SHA", 0xc011),
  ("TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA", 0xc012),
  ("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA", 0xc013),
  ("TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA", 0xc014),
  ("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", 0xc02f),
  ("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", 0xc02b),
  ("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", 0xc030),
  ("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", 0xc02c),
  ("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305", 0xcca8),
  ("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305", 0xcca9),
  ("TLS_AES_128_GCM_SHA256", 0x1301),
  ("TLS_AES_256_GCM_SHA384", 0x1302),
  ("TLS_CHACHA20_POLY1305_SHA256", 0x1303),
];

pub fn cipher_suite_id(name: &str) -> Option<u16> {
  CIPHER_SUITES
    .iter()
    .find(|(n, _)| *n == name)
    .map(|(_, id)| *id)
}

// TLS }

// IP blocks {

/// A single address or CIDR block, used by `blacklistIPs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlock {
  pub addr: IpAddr,
  pub prefix: u8,
}

impl IpBlock {
  pub fn contains(&self, ip: &IpAddr) -> bool {
    match (self.addr, ip) {
      (IpAddr::V4(net), IpAddr::V4(ip)) => {
        let mask = if self.prefix == 0 {
          0
        } else {
          u32::MAX << (32 - self.prefix as u32)
        };
        (u32::from(net) & mask) == (u32::from(*ip) & mask)
      }
      (IpAddr::V6(net), IpAddr::V6(ip)) => {
        let mask = if self.prefix == 0 {
          0
        } else {
          u128::MAX << (128 - self.prefix as u32)
        };
        (u128::from(net) & mask) == (u128::from(*ip) & mask)
      }
      _ => false,
    }
  }
}

impl FromStr for IpBlock {
  type Err = AnyErr;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (addr, prefix) = match s.split_once('/') {
      Some((a, p)) => {
        let addr: IpAddr = a.parse()?;
        let prefix: u8 = p.parse()?;
        (addr, prefix)
      }
      None => {
        let addr: IpAddr = s.parse()?;
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        (addr, prefix)
      }
    };
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
      anyhow::bail!("invalid IP block prefix in {s:?}");
    }
    Ok(IpBlock { addr, prefix })
  }
}

impl std::fmt::Display for IpBlock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.addr, self.prefix)
  }
}

impl Serialize for IpBlock {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for IpBlock {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(DeError::custom)
  }
}

// IP blocks }

// Hostnames {

/// Lowercased hostname patterns, exact (`"test.example.com"`) or
/// wildcard-prefixed (`"*.example.com"`, matching any depth of subdomain).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostnameBlocklist {
  patterns: Vec<String>,
}

impl HostnameBlocklist {
  pub fn new(patterns: Vec<String>) -> AnyResult<Self> {
    let mut normalized = Vec::with_capacity(patterns.len());
    for p in patterns {
      let p = p.to_ascii_lowercase();
      let body = p.strip_prefix('*').unwrap_or(&p);
      if body.contains('*') {
        anyhow::bail!("wildcards are only allowed as a prefix, invalid pattern {p:?}");
      }
      normalized.push(p);
    }
    Ok(HostnameBlocklist {
      patterns: normalized,
    })
  }

  pub fn is_empty(&self) -> bool {
    self.patterns.is_empty()
  }

  pub fn matches(&self, hostname: &str) -> bool {
    let hostname = hostname.to_ascii_lowercase();
    self.patterns.iter().any(|p| match p.strip_prefix('*') {
      Some(suffix) => hostname.ends_with(suffix),
      None => hostname == *p,
    })
  }
}

/// A `hosts{}` override target: an IP with an optional fixed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAddress {
  pub ip: IpAddr,
  pub port: Option<u16>,
}

impl FromStr for HostAddress {
  type Err = AnyErr;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Ok(ip) = s.parse::<IpAddr>() {
      return Ok(HostAddress { ip, port: None });
    }
    let sock: std::net::SocketAddr = s
      .parse()
      .map_err(|_| anyhow::anyhow!("invalid host address {s:?}"))?;
    Ok(HostAddress {
      ip: sock.ip(),
      port: Some(sock.port()),
    })
  }
}

impl std::fmt::Display for HostAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.port {
      Some(port) => write!(f, "{}:{}", self.ip, port),
      None => write!(f, "{}", self.ip),
    }
  }
}

impl Serialize for HostAddress {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for HostAddress {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(DeError::custom)
  }
}

// Hostnames }

// Local IP pool {

/// The `localIPs` source-address pool: a comma-separated string of single
/// addresses and inclusive `a-b` ranges, or a plain JSON array of addresses.
/// VUs pick an address by id, wrapping around the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpPool {
  ips: Vec<IpAddr>,
}

impl IpPool {
  pub fn len(&self) -> usize {
    self.ips.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ips.is_empty()
  }

  pub fn at(&self, index: u64) -> Option<IpAddr> {
    if self.ips.is_empty() {
      return None;
    }
    Some(self.ips[(index % self.ips.len() as u64) as usize])
  }
}

impl FromStr for IpPool {
  type Err = AnyErr;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut ips = vec![];
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      match part.split_once('-') {
        None => ips.push(part.parse::<IpAddr>()?),
        Some((lo, hi)) => {
          let lo: IpAddr = lo.trim().parse()?;
          let hi: IpAddr = hi.trim().parse()?;
          match (lo, hi) {
            (IpAddr::V4(lo), IpAddr::V4(hi)) => {
              let (lo, hi) = (u32::from(lo), u32::from(hi));
              if lo > hi {
                anyhow::bail!("invalid IP range {part:?}");
              }
              for ip in lo..=hi {
                ips.push(IpAddr::V4(ip.into()));
              }
            }
            _ => anyhow::bail!("only IPv4 ranges are supported, got {part:?}"),
          }
        }
      }
    }
    Ok(IpPool { ips })
  }
}

impl std::fmt::Display for IpPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let parts: Vec<String> = self.ips.iter().map(|ip| ip.to_string()).collect();
    write!(f, "{}", parts.join(","))
  }
}

impl Serialize for IpPool {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for IpPool {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
      serde_json::Value::String(s) => s.parse().map_err(DeError::custom),
      serde_json::Value::Array(items) => {
        let mut ips = vec![];
        for item in items {
          let s = item
            .as_str()
            .ok_or_else(|| DeError::custom("localIPs entries must be strings"))?;
          ips.push(s.parse::<IpAddr>().map_err(DeError::custom)?);
        }
        Ok(IpPool { ips })
      }
      other => Err(DeError::custom(format!(
        "invalid localIPs: {other}, expected a string or an array"
      ))),
    }
  }
}

// Local IP pool }

// DNS {

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsSelect {
  #[serde(rename = "first")]
  First,
  #[serde(rename = "random")]
  Random,
  #[serde(rename = "roundRobin")]
  RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsPolicy {
  #[serde(rename = "preferIPv4")]
  PreferIPv4,
  #[serde(rename = "preferIPv6")]
  PreferIPv6,
  #[serde(rename = "onlyIPv4")]
  OnlyIPv4,
  #[serde(rename = "onlyIPv6")]
  OnlyIPv6,
  #[serde(rename = "any")]
  Any,
}

/// `dns{}` options: resolution cache TTL (`"inf"`, `"0"`, or a duration),
/// the record-selection strategy and the address-family policy.
///
/// Accepts either an object or the compact
/// `"ttl=5m,select=random,policy=any"` string form.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DnsOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ttl: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub select: Option<DnsSelect>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub policy: Option<DnsPolicy>,
}

impl<'de> Deserialize<'de> for DnsOptions {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    struct Object {
      #[serde(default)]
      ttl: Option<String>,
      #[serde(default)]
      select: Option<DnsSelect>,
      #[serde(default)]
      policy: Option<DnsPolicy>,
    }

    let v = serde_json::Value::deserialize(deserializer)?;
    match v {
      serde_json::Value::String(s) => {
        let mut out = DnsOptions::default();
        for part in s.split(',').filter(|p| !p.is_empty()) {
          let (key, value) = part
            .split_once('=')
            .ok_or_else(|| DeError::custom(format!("invalid dns option {part:?}")))?;
          match key.trim() {
            "ttl" => out.ttl = Some(value.trim().to_string()),
            "select" => {
              out.select =
                Some(serde_json::from_value(value.trim().into()).map_err(DeError::custom)?)
            }
            "policy" => {
              out.policy =
                Some(serde_json::from_value(value.trim().into()).map_err(DeError::custom)?)
            }
            other => return Err(DeError::custom(format!("unknown dns option {other:?}"))),
          }
        }
        Ok(out)
      }
      other => {
        let obj: Object = serde_json::from_value(other).map_err(DeError::custom)?;
        Ok(DnsOptions {
          ttl: obj.ttl,
          select: obj.select,
          policy: obj.policy,
        })
      }
    }
  }
}

// DNS }

// System tags {

/// Tags the runtime itself may stamp onto samples; `systemTags` selects the
/// active subset.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SystemTag {
  Proto,
  Subproto,
  Status,
  Method,
  Url,
  Name,
  Group,
  Check,
  Error,
  ErrorCode,
  TlsVersion,
  Scenario,
  Service,
  ExpectedResponse,
  Iter,
  Vu,
  Ip,
}

impl SystemTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      SystemTag::Proto => "proto",
      SystemTag::Subproto => "subproto",
      SystemTag::Status => "status",
      SystemTag::Method => "method",
      SystemTag::Url => "url",
      SystemTag::Name => "name",
      SystemTag::Group => "group",
      SystemTag::Check => "check",
      SystemTag::Error => "error",
      SystemTag::ErrorCode => "error_code",
      SystemTag::TlsVersion => "tls_version",
      SystemTag::Scenario => "scenario",
      SystemTag::Service => "service",
      SystemTag::ExpectedResponse => "expected_response",
      SystemTag::Iter => "iter",
      SystemTag::Vu => "vu",
      SystemTag::Ip => "ip",
    }
  }
}

/// The tags stamped unless the script narrows the set.
pub fn default_system_tags() -> HashSet<SystemTag> {
  [
    SystemTag::Proto,
    SystemTag::Subproto,
    SystemTag::Status,
    SystemTag::Method,
    SystemTag::Url,
    SystemTag::Name,
    SystemTag::Group,
    SystemTag::Check,
    SystemTag::Error,
    SystemTag::ErrorCode,
    SystemTag::TlsVersion,
    SystemTag::Scenario,
    SystemTag::ExpectedResponse,
  ]
  .into_iter()
  .collect()
}

// System tags }

#[cfg(test)]
mod types_tests {
  use super::*;

  #[test]
  fn parse_duration1() {
    assert_eq!(parse_duration("10s").unwrap(), StdDuration::from_secs(10));
    assert_eq!(parse_duration("1m30s").unwrap(), StdDuration::from_secs(90));
    assert_eq!(
      parse_duration("200ms").unwrap(),
      StdDuration::from_millis(200)
    );
    assert_eq!(
      parse_duration("1h2m3s").unwrap(),
      StdDuration::from_secs(3723)
    );
    assert_eq!(
      parse_duration("1.5s").unwrap(),
      StdDuration::from_millis(1500)
    );
    assert_eq!(parse_duration("0").unwrap(), StdDuration::ZERO);
  }

  #[test]
  fn parse_duration2() {
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("s").is_err());
    assert!(parse_duration("10parsecs").is_err());
  }

  #[test]
  fn format_duration1() {
    assert_eq!(format_duration(StdDuration::from_secs(90)), "1m30s");
    assert_eq!(format_duration(StdDuration::from_millis(200)), "200ms");
    assert_eq!(format_duration(StdDuration::from_secs(3723)), "1h2m3s");
    assert_eq!(format_duration(StdDuration::ZERO), "0s");
  }

  #[test]
  fn duration_serde1() {
    let d: Duration = serde_json::from_str("\"1m30s\"").unwrap();
    assert_eq!(d.as_std(), StdDuration::from_secs(90));
    let d: Duration = serde_json::from_str("1500").unwrap();
    assert_eq!(d.as_std(), StdDuration::from_millis(1500));
    assert_eq!(serde_json::to_string(&d).unwrap(), "\"1.5s\"");
  }

  #[test]
  fn tls_versions1() {
    let v: TlsVersions = serde_json::from_str("\"tls1.2\"").unwrap();
    assert_eq!(v.min, TlsVersion::Tls12);
    assert_eq!(v.max, TlsVersion::Tls12);

    let v: TlsVersions =
      serde_json::from_str(r#"{"min":"tls1.0","max":"tls1.3"}"#).unwrap();
    assert_eq!(v.min, TlsVersion::Tls10);
    assert_eq!(v.max, TlsVersion::Tls13);
  }

  #[test]
  fn ip_block1() {
    let b: IpBlock = "10.0.0.0/8".parse().unwrap();
    assert!(b.contains(&"10.1.2.3".parse().unwrap()));
    assert!(!b.contains(&"11.1.2.3".parse().unwrap()));

    let single: IpBlock = "192.168.1.1".parse().unwrap();
    assert!(single.contains(&"192.168.1.1".parse().unwrap()));
    assert!(!single.contains(&"192.168.1.2".parse().unwrap()));
  }

  #[test]
  fn hostname_blocklist1() {
    let bl =
      HostnameBlocklist::new(vec!["*.example.com".into(), "exact.io".into()]).unwrap();
    assert!(bl.matches("sub.example.com"));
    assert!(bl.matches("deep.sub.example.com"));
    assert!(bl.matches("EXACT.io"));
    assert!(!bl.matches("example.org"));
    assert!(HostnameBlocklist::new(vec!["foo.*.bar".into()]).is_err());
  }

  #[test]
  fn ip_pool1() {
    let pool: IpPool = "192.168.0.1,10.0.0.1-10.0.0.3".parse().unwrap();
    assert_eq!(pool.len(), 4);
    assert_eq!(pool.at(0), Some("192.168.0.1".parse().unwrap()));
    assert_eq!(pool.at(3), Some("10.0.0.3".parse().unwrap()));
    // Wraps around.
    assert_eq!(pool.at(4), Some("192.168.0.1".parse().unwrap()));
    assert!("10.0.0.3-10.0.0.1".parse::<IpPool>().is_err());
  }

  #[test]
  fn dns_options1() {
    let d: DnsOptions =
      serde_json::from_str("\"ttl=5m,select=random,policy=preferIPv4\"").unwrap();
    assert_eq!(d.ttl.as_deref(), Some("5m"));
    assert_eq!(d.select, Some(DnsSelect::Random));
    assert_eq!(d.policy, Some(DnsPolicy::PreferIPv4));

    let d: DnsOptions = serde_json::from_str(r#"{"ttl":"inf"}"#).unwrap();
    assert_eq!(d.ttl.as_deref(), Some("inf"));
    assert_eq!(d.select, None);
  }
}
