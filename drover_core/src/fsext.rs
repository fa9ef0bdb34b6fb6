//! Filesystem abstraction behind the module resolver and `open()`: plain OS
//! and in-memory backends, plus the caching wrapper that can be flipped into
//! "only previously-read files" mode once init is over.

use crate::prelude::*;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Returned by [`CacheOnlyFs`] when locked down and asked for an unknown
/// path. Callers translate it into their own user-facing message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("the path \"{0}\" was never requested before")]
pub struct PathNeverRequestedError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
  pub is_dir: bool,
  pub size: u64,
}

/// A read-only file source keyed by absolute slash-separated paths.
pub trait Fs: Send + Sync {
  fn read_file(&self, path: &str) -> AnyResult<Vec<u8>>;

  fn stat(&self, path: &str) -> Option<FileStat>;

  fn is_dir(&self, path: &str) -> bool {
    self.stat(path).map(|s| s.is_dir).unwrap_or(false)
  }
}

/// The operating-system filesystem.
#[derive(Debug, Default)]
pub struct OsFs;

impl Fs for OsFs {
  fn read_file(&self, path: &str) -> AnyResult<Vec<u8>> {
    Ok(std::fs::read(Path::new(path))?)
  }

  fn stat(&self, path: &str) -> Option<FileStat> {
    let meta = std::fs::metadata(Path::new(path)).ok()?;
    Some(FileStat {
      is_dir: meta.is_dir(),
      size: meta.len(),
    })
  }
}

/// An in-memory filesystem, used for archives and for the `https` scheme
/// (whose contents are always pre-fetched by the loader collaborator).
#[derive(Debug, Default)]
pub struct MemFs {
  files: HashMap<String, Vec<u8>>,
}

impl MemFs {
  pub fn new(files: HashMap<String, Vec<u8>>) -> Self {
    Self { files }
  }
}

impl Fs for MemFs {
  fn read_file(&self, path: &str) -> AnyResult<Vec<u8>> {
    match self.files.get(path) {
      Some(data) => Ok(data.clone()),
      None => Err(
        IoErr::new(IoErrKind::NotFound, format!("file not found: {path:?}")).into(),
      ),
    }
  }

  fn stat(&self, path: &str) -> Option<FileStat> {
    if let Some(data) = self.files.get(path) {
      return Some(FileStat {
        is_dir: false,
        size: data.len() as u64,
      });
    }
    // A directory exists if any file lives under it.
    let prefix = format!("{}/", path.trim_end_matches('/'));
    if self.files.keys().any(|k| k.starts_with(&prefix)) {
      return Some(FileStat {
        is_dir: true,
        size: 0,
      });
    }
    None
  }
}

/// Records every successful read during the learning phase; after
/// [`CacheOnlyFs::allow_only_cached`] flips, unknown paths fail with the
/// [`PathNeverRequestedError`] sentinel and known paths are served from the
/// recorded copy.
pub struct CacheOnlyFs {
  inner: Arc<dyn Fs>,
  cache: Mutex<HashMap<String, Arc<Vec<u8>>>>,
  only_cached: AtomicBool,
}

impl CacheOnlyFs {
  pub fn new(inner: Arc<dyn Fs>) -> Self {
    Self {
      inner,
      cache: Mutex::new(HashMap::new()),
      only_cached: AtomicBool::new(false),
    }
  }

  pub fn allow_only_cached(&self) {
    self.only_cached.store(true, Ordering::SeqCst);
  }

  /// The recorded reads, keyed by path. This is what an archive carries.
  pub fn cached_files(&self) -> HashMap<String, Vec<u8>> {
    self
      .cache
      .lock()
      .iter()
      .map(|(k, v)| (k.clone(), v.as_ref().clone()))
      .collect()
  }
}

impl Fs for CacheOnlyFs {
  fn read_file(&self, path: &str) -> AnyResult<Vec<u8>> {
    let mut cache = self.cache.lock();
    if let Some(data) = cache.get(path) {
      return Ok(data.as_ref().clone());
    }
    if self.only_cached.load(Ordering::SeqCst) {
      return Err(PathNeverRequestedError(path.to_string()).into());
    }
    let data = self.inner.read_file(path)?;
    cache.insert(path.to_string(), Arc::new(data.clone()));
    Ok(data)
  }

  fn stat(&self, path: &str) -> Option<FileStat> {
    if let Some(data) = self.cache.lock().get(path) {
      return Some(FileStat {
        is_dir: false,
        size: data.len() as u64,
      });
    }
    if self.only_cached.load(Ordering::SeqCst) {
      return None;
    }
    self.inner.stat(path)
  }
}

/// The scheme → filesystem mapping a Bundle resolves against.
#[derive(Clone)]
pub struct FsMap {
  inner: HashMap<String, Arc<CacheOnlyFs>>,
}

impl FsMap {
  pub fn new(fses: HashMap<String, Arc<dyn Fs>>) -> Self {
    let inner = fses
      .into_iter()
      .map(|(scheme, fs)| (scheme, Arc::new(CacheOnlyFs::new(fs))))
      .collect();
    Self { inner }
  }

  /// The usual live layout: OS-backed `file`, empty `https`.
  pub fn with_defaults() -> Self {
    let mut fses: HashMap<String, Arc<dyn Fs>> = HashMap::new();
    fses.insert("file".to_string(), Arc::new(OsFs));
    fses.insert("https".to_string(), Arc::new(MemFs::default()));
    FsMap::new(fses)
  }

  /// Rebuilds the mapping from archived contents.
  pub fn from_archived(archived: &HashMap<String, HashMap<String, Vec<u8>>>) -> Self {
    let mut fses: HashMap<String, Arc<dyn Fs>> = HashMap::new();
    for (scheme, files) in archived {
      let files = files
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<HashMap<String, Vec<u8>>>();
      fses.insert(scheme.clone(), Arc::new(MemFs::new(files)));
    }
    fses
      .entry("file".to_string())
      .or_insert_with(|| Arc::new(MemFs::default()));
    fses
      .entry("https".to_string())
      .or_insert_with(|| Arc::new(MemFs::default()));
    FsMap::new(fses)
  }

  pub fn get(&self, scheme: &str) -> Option<Arc<CacheOnlyFs>> {
    self.inner.get(scheme).cloned()
  }

  /// Locks the `file` scheme to previously-read paths; what enforces the
  /// init-time file-access contract.
  pub fn lock_file_scheme(&self) {
    if let Some(fs) = self.inner.get("file") {
      fs.allow_only_cached();
    }
  }

  pub fn archived_contents(&self) -> HashMap<String, HashMap<String, Vec<u8>>> {
    self
      .inner
      .iter()
      .map(|(scheme, fs)| (scheme.clone(), fs.cached_files()))
      .collect()
  }
}

#[cfg(test)]
mod fsext_tests {
  use super::*;

  #[test]
  fn cache_only1() {
    let mut files = HashMap::new();
    files.insert("/a.txt".to_string(), b"alpha".to_vec());
    files.insert("/b.txt".to_string(), b"beta".to_vec());
    let fs = CacheOnlyFs::new(Arc::new(MemFs::new(files)));

    assert_eq!(fs.read_file("/a.txt").unwrap(), b"alpha");
    fs.allow_only_cached();

    // Previously-read files keep working, unseen ones hit the sentinel.
    assert_eq!(fs.read_file("/a.txt").unwrap(), b"alpha");
    let err = fs.read_file("/b.txt").unwrap_err();
    assert!(err.downcast_ref::<PathNeverRequestedError>().is_some());
  }

  #[test]
  fn mem_fs_dirs1() {
    let mut files = HashMap::new();
    files.insert("/data/users.json".to_string(), b"[]".to_vec());
    let fs = MemFs::new(files);
    assert!(fs.is_dir("/data"));
    assert!(!fs.is_dir("/data/users.json"));
    assert!(fs.stat("/missing").is_none());
  }

  #[test]
  fn archived_roundtrip1() {
    let mut files = HashMap::new();
    files.insert("/script.js".to_string(), b"export {}".to_vec());
    let mut fses: HashMap<String, Arc<dyn Fs>> = HashMap::new();
    fses.insert("file".to_string(), Arc::new(MemFs::new(files)));
    let map = FsMap::new(fses);

    let fs = map.get("file").unwrap();
    fs.read_file("/script.js").unwrap();

    let archived = map.archived_contents();
    let rebuilt = FsMap::from_archived(&archived);
    assert_eq!(
      rebuilt.get("file").unwrap().read_file("/script.js").unwrap(),
      b"export {}"
    );
  }
}
