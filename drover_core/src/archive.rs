//! The archive: a self-describing, portable snapshot a Bundle can be
//! reconstructed from. Tarball framing is the CLI's concern; this is the
//! metadata + contents model.

use crate::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
  /// Always `"js"`.
  #[serde(rename = "type")]
  pub archive_type: String,
  /// Absolute URL of the entrypoint script.
  pub filename: String,
  /// Base-directory URL imports were resolved against.
  pub pwd: String,
  /// Raw entrypoint source.
  pub data: String,
  /// Environment snapshot. Older archives may lack it entirely.
  #[serde(default)]
  pub env: HashMap<String, String>,
  /// Effective options at archiving time; authoritative on restore.
  pub options: serde_json::Value,
  pub compatibility_mode: String,
  /// Version of the runtime that produced the archive.
  pub version: String,
  /// Operating system the archive was produced on.
  pub os: String,
  /// Per-scheme file contents, everything init-time execution read.
  #[serde(default)]
  pub filesystems: HashMap<String, HashMap<String, Vec<u8>>>,
}

impl Archive {
  pub fn to_json(&self) -> AnyResult<String> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  pub fn from_json(data: &str) -> AnyResult<Archive> {
    let archive: Archive = serde_json::from_str(data)?;
    if archive.archive_type != "js" {
      anyhow::bail!("unsupported archive type {:?}", archive.archive_type);
    }
    Ok(archive)
  }
}

#[cfg(test)]
mod archive_tests {
  use super::*;

  #[test]
  fn json_roundtrip1() {
    let mut filesystems = HashMap::new();
    let mut file_fs = HashMap::new();
    file_fs.insert("/test/script.js".to_string(), b"export {}".to_vec());
    filesystems.insert("file".to_string(), file_fs);

    let archive = Archive {
      archive_type: "js".to_string(),
      filename: "file:///test/script.js".to_string(),
      pwd: "file:///test/".to_string(),
      data: "export default function () {}".to_string(),
      env: HashMap::from_iter([("FOO".to_string(), "bar".to_string())]),
      options: serde_json::json!({"vus": 5}),
      compatibility_mode: "extended".to_string(),
      version: "0.3.0".to_string(),
      os: "linux".to_string(),
      filesystems,
    };

    let round = Archive::from_json(&archive.to_json().unwrap()).unwrap();
    assert_eq!(round.filename, archive.filename);
    assert_eq!(round.env, archive.env);
    assert_eq!(round.options, archive.options);
    assert_eq!(round.filesystems, archive.filesystems);
  }

  #[test]
  fn missing_env_defaults_empty1() {
    let json = r#"{
      "type": "js",
      "filename": "file:///t.js",
      "pwd": "file:///",
      "data": "",
      "options": {},
      "compatibilityMode": "base",
      "version": "0.1.0",
      "os": "linux"
    }"#;
    let archive = Archive::from_json(json).unwrap();
    assert!(archive.env.is_empty());
    assert!(archive.filesystems.is_empty());
  }

  #[test]
  fn wrong_type1() {
    let json = r#"{
      "type": "tar",
      "filename": "file:///t.js",
      "pwd": "file:///",
      "data": "",
      "options": {},
      "compatibilityMode": "base",
      "version": "0.1.0",
      "os": "linux"
    }"#;
    assert!(Archive::from_json(json).is_err());
  }
}
