//! Error taxonomy: exit codes, abort reasons and the typed errors that carry
//! them across the runner boundary.

use crate::prelude::*;
use std::time::Duration;

/// Process exit codes reported to the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
  CleanExit = 0,
  GenericEngine = 6,
  ThresholdsHaveFailed = 99,
  SetupTimeout = 100,
  TeardownTimeout = 101,
  GenericTimeout = 102,
  InvalidConfig = 104,
  ExternalAbort = 105,
  ScriptException = 107,
  ScriptAborted = 108,
}

/// Why a whole test run stops early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
  AbortedByError,
  AbortedByScriptError,
  AbortedByScriptAbort,
  AbortedByTimeout,
}

/// Extra classification attached to errors that cross the public boundary.
pub trait RunStatus {
  fn exit_code(&self) -> ExitCode;

  fn abort_reason(&self) -> Option<AbortReason> {
    None
  }

  fn hint(&self) -> Option<&str> {
    None
  }
}

/// An uncaught exception escaped the script, at init time or inside an
/// iteration. Carries the interpreter's stack rendering when available.
#[derive(Debug, Clone)]
pub struct ScriptError {
  pub message: String,
  pub stack: Option<String>,
}

impl ScriptError {
  pub fn new(message: String, stack: Option<String>) -> Self {
    Self { message, stack }
  }
}

impl std::fmt::Display for ScriptError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.stack {
      Some(stack) if !stack.is_empty() => write!(f, "{stack}"),
      _ => write!(f, "{}", self.message),
    }
  }
}

impl std::error::Error for ScriptError {}

impl RunStatus for ScriptError {
  fn exit_code(&self) -> ExitCode {
    ExitCode::ScriptException
  }

  fn abort_reason(&self) -> Option<AbortReason> {
    Some(AbortReason::AbortedByScriptError)
  }

  fn hint(&self) -> Option<&str> {
    Some("script exception")
  }
}

/// Raised through `exec.test.abort([reason])`; also used as the value of the
/// interpreter interrupt so it survives the trip through the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptError {
  pub reason: String,
}

pub const ABORT_TEST: &str = "test aborted";

impl InterruptError {
  /// Builds the canonical reason string, `"test aborted"` with the optional
  /// script-provided suffix.
  pub fn new(user_reason: Option<&str>) -> Self {
    let reason = match user_reason {
      Some(r) if !r.is_empty() => format!("{ABORT_TEST}: {r}"),
      _ => ABORT_TEST.to_string(),
    };
    Self { reason }
  }
}

impl std::fmt::Display for InterruptError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.reason)
  }
}

impl std::error::Error for InterruptError {}

impl RunStatus for InterruptError {
  fn exit_code(&self) -> ExitCode {
    ExitCode::ScriptAborted
  }

  fn abort_reason(&self) -> Option<AbortReason> {
    Some(AbortReason::AbortedByScriptAbort)
  }
}

/// A deadline-bearing stage (setup, teardown, summary) ran out of time
/// without producing a more specific script error.
#[derive(Debug, Clone)]
pub struct TimeoutError {
  pub stage: String,
  pub duration: Duration,
}

impl TimeoutError {
  pub fn new(stage: &str, duration: Duration) -> Self {
    Self {
      stage: stage.to_string(),
      duration,
    }
  }
}

impl std::fmt::Display for TimeoutError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{} execution timed out after {:.0} seconds",
      self.stage,
      self.duration.as_secs_f64()
    )
  }
}

impl std::error::Error for TimeoutError {}

impl RunStatus for TimeoutError {
  fn exit_code(&self) -> ExitCode {
    match self.stage.as_str() {
      "setup" => ExitCode::SetupTimeout,
      "teardown" => ExitCode::TeardownTimeout,
      _ => ExitCode::GenericTimeout,
    }
  }

  fn abort_reason(&self) -> Option<AbortReason> {
    Some(AbortReason::AbortedByTimeout)
  }

  fn hint(&self) -> Option<&str> {
    match self.stage.as_str() {
      "setup" => Some("You can increase the time limit via the setupTimeout option"),
      "teardown" => Some("You can increase the time limit via the teardownTimeout option"),
      _ => None,
    }
  }
}

/// Invalid declarative configuration: bad compatibility mode, options that
/// fail to unmarshal, invalid option values.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ConfigError {
  pub message: String,
}

impl ConfigError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl RunStatus for ConfigError {
  fn exit_code(&self) -> ExitCode {
    ExitCode::InvalidConfig
  }

  fn abort_reason(&self) -> Option<AbortReason> {
    Some(AbortReason::AbortedByError)
  }
}

/// An init-context-only API was called from VU context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("the \"{0}\" function is only available in the init stage of the test (\"init context\")")]
pub struct InitContextError(pub String);

/// The context driving the current activation was canceled; not an error of
/// the script itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context canceled")]
pub struct ContextCanceled;

/// Walks an [`AnyErr`] chain and returns the classification of the first
/// typed error found, defaulting to a generic engine failure.
pub fn classify(err: &AnyErr) -> (ExitCode, Option<AbortReason>, Option<String>) {
  for cause in err.chain() {
    if let Some(e) = cause.downcast_ref::<ScriptError>() {
      return (e.exit_code(), e.abort_reason(), e.hint().map(String::from));
    }
    if let Some(e) = cause.downcast_ref::<InterruptError>() {
      return (e.exit_code(), e.abort_reason(), e.hint().map(String::from));
    }
    if let Some(e) = cause.downcast_ref::<TimeoutError>() {
      return (e.exit_code(), e.abort_reason(), e.hint().map(String::from));
    }
    if let Some(e) = cause.downcast_ref::<ConfigError>() {
      return (e.exit_code(), e.abort_reason(), e.hint().map(String::from));
    }
  }
  (ExitCode::GenericEngine, None, None)
}

#[cfg(test)]
mod errext_tests {
  use super::*;

  #[test]
  fn timeout_message1() {
    let e = TimeoutError::new("setup", Duration::from_secs(10));
    assert_eq!(e.to_string(), "setup execution timed out after 10 seconds");
    assert_eq!(e.exit_code(), ExitCode::SetupTimeout);
    assert!(e.hint().unwrap().contains("setupTimeout"));
  }

  #[test]
  fn interrupt_reason1() {
    assert_eq!(InterruptError::new(None).to_string(), "test aborted");
    assert_eq!(
      InterruptError::new(Some("flaky backend")).to_string(),
      "test aborted: flaky backend"
    );
  }

  #[test]
  fn classify1() {
    let err: AnyErr = ScriptError::new("boom".into(), None).into();
    let (code, reason, hint) = classify(&err);
    assert_eq!(code, ExitCode::ScriptException);
    assert_eq!(reason, Some(AbortReason::AbortedByScriptError));
    assert_eq!(hint.as_deref(), Some("script exception"));
  }
}
