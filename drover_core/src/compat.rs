//! Script compatibility modes.

use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which JavaScript feature-set the script is compiled under.
///
/// `Base` hands source to the interpreter untouched; `Extended` runs it
/// through the transpiler so modern syntax is normalized to what the
/// interpreter accepts; `ExperimentalEnhanced` additionally strips
/// TypeScript type annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompatibilityMode {
  #[serde(rename = "base")]
  Base,
  #[default]
  #[serde(rename = "extended")]
  Extended,
  #[serde(rename = "experimental_enhanced")]
  ExperimentalEnhanced,
}

impl CompatibilityMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      CompatibilityMode::Base => "base",
      CompatibilityMode::Extended => "extended",
      CompatibilityMode::ExperimentalEnhanced => "experimental_enhanced",
    }
  }
}

impl std::fmt::Display for CompatibilityMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for CompatibilityMode {
  type Err = AnyErr;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "base" => Ok(CompatibilityMode::Base),
      "extended" => Ok(CompatibilityMode::Extended),
      "experimental_enhanced" => Ok(CompatibilityMode::ExperimentalEnhanced),
      other => anyhow::bail!(
        "invalid compatibility mode \"{other}\". Use: \"extended\", \"base\", \"experimental_enhanced\""
      ),
    }
  }
}

#[cfg(test)]
mod compat_tests {
  use super::*;

  #[test]
  fn parse1() {
    assert_eq!(
      "extended".parse::<CompatibilityMode>().unwrap(),
      CompatibilityMode::Extended
    );
    assert_eq!(
      "base".parse::<CompatibilityMode>().unwrap(),
      CompatibilityMode::Base
    );
  }

  #[test]
  fn parse2() {
    let err = "es1".parse::<CompatibilityMode>().unwrap_err();
    assert_eq!(
      err.to_string(),
      "invalid compatibility mode \"es1\". Use: \"extended\", \"base\", \"experimental_enhanced\""
    );
  }
}
