//! Module resolution and source loading: specifier classes, the per-Bundle
//! compiled-source cache, and the compatibility-mode preprocessing step.

use crate::compat::CompatibilityMode;
use crate::fsext::{Fs, FsMap};
use crate::js::transpiler;
use crate::modules::ModuleRegistry;
use crate::prelude::*;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// A loaded, preprocessed module source keyed by its canonical URL string.
pub struct LoadedSource {
  pub url: Url,
  pub code: String,
}

/// Turns specifiers into canonical module keys and loads their sources.
/// Each source is read and preprocessed exactly once per Bundle; concurrent
/// loads of the same specifier coalesce on the cache lock.
pub struct Resolver {
  registry: Arc<ModuleRegistry>,
  filesystems: FsMap,
  compat: CompatibilityMode,
  cache: Mutex<HashMap<String, Arc<LoadedSource>>>,
  locked: AtomicBool,
}

impl Resolver {
  pub fn new(
    registry: Arc<ModuleRegistry>,
    filesystems: FsMap,
    compat: CompatibilityMode,
  ) -> Self {
    Self {
      registry,
      filesystems,
      compat,
      cache: Mutex::new(HashMap::new()),
      locked: AtomicBool::new(false),
    }
  }

  pub fn compatibility_mode(&self) -> CompatibilityMode {
    self.compat
  }

  /// No further module sources can be added; already-cached ones keep
  /// serving every subsequent instantiation.
  pub fn lock(&self) {
    self.locked.store(true, Ordering::SeqCst);
  }

  /// Resolves a specifier against the requesting module's URL into a
  /// canonical key: a builtin specifier verbatim, or an absolute URL
  /// string.
  pub fn resolve(&self, base: Option<&Url>, specifier: &str) -> AnyResult<String> {
    if specifier == "k6" || specifier.starts_with("k6/") {
      if self.registry.recognizes(specifier) {
        return Ok(specifier.to_string());
      }
      anyhow::bail!("unknown module: \"{specifier}\"");
    }

    let url = match Url::parse(specifier) {
      Ok(url) => match url.scheme() {
        "file" | "https" => url,
        scheme => anyhow::bail!("unsupported scheme for module import: {scheme:?}"),
      },
      // Not an absolute URL: resolve relative to the requesting module
      // with plain URL-join semantics.
      Err(_) => match base {
        Some(base) => base.join(specifier)?,
        None => anyhow::bail!(
          "cannot resolve relative specifier {specifier:?} without a requesting module"
        ),
      },
    };
    Ok(url.to_string())
  }

  pub fn is_builtin(&self, key: &str) -> bool {
    key == "k6" || key.starts_with("k6/")
  }

  /// Loads bytes for a canonical URL key, strips an optional UTF-8 BOM and
  /// preprocesses per the active compatibility mode.
  pub fn load(&self, key: &str) -> AnyResult<Arc<LoadedSource>> {
    let mut cache = self.cache.lock();
    if let Some(cached) = cache.get(key) {
      return Ok(cached.clone());
    }
    if self.locked.load(Ordering::SeqCst) {
      anyhow::bail!("module {key:?} was not previously resolved during initialization");
    }

    let url = Url::parse(key)?;
    let fs = self
      .filesystems
      .get(url.scheme())
      .ok_or_else(|| anyhow::anyhow!("no filesystem registered for scheme {:?}", url.scheme()))?;

    let bytes = fs.read_file(&fs_key(&url))?;
    let bytes = strip_bom(&bytes);
    let raw = String::from_utf8(bytes.to_vec())
      .map_err(|_| anyhow::anyhow!("module {key:?} is not valid UTF-8"))?;

    let code = match self.compat {
      CompatibilityMode::Base => raw,
      CompatibilityMode::Extended => transpiler::normalize_es(Some(key), &raw)?,
      CompatibilityMode::ExperimentalEnhanced => transpiler::strip_types(Some(key), &raw)?,
    };

    let loaded = Arc::new(LoadedSource { url, code });
    cache.insert(key.to_string(), loaded.clone());
    Ok(loaded)
  }

  /// Seeds the cache with an already-available source (the entrypoint).
  pub fn seed(&self, key: &str, raw: &str) -> AnyResult<Arc<LoadedSource>> {
    let url = Url::parse(key)?;
    let raw = strip_bom(raw.as_bytes());
    let raw = std::str::from_utf8(raw)?;
    let code = match self.compat {
      CompatibilityMode::Base => raw.to_string(),
      CompatibilityMode::Extended => transpiler::normalize_es(Some(key), raw)?,
      CompatibilityMode::ExperimentalEnhanced => transpiler::strip_types(Some(key), raw)?,
    };
    let loaded = Arc::new(LoadedSource { url, code });
    self.cache.lock().insert(key.to_string(), loaded.clone());
    Ok(loaded)
  }
}

/// The path a URL maps to inside its scheme's filesystem.
pub fn fs_key(url: &Url) -> String {
  match url.scheme() {
    "file" => match url.to_file_path() {
      Ok(path) => path.to_string_lossy().into_owned(),
      Err(_) => url.path().to_string(),
    },
    _ => format!(
      "/{}{}",
      url.host_str().unwrap_or_default(),
      url.path()
    ),
  }
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
  bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

#[cfg(test)]
mod loader_tests {
  use super::*;
  use crate::fsext::{Fs, MemFs};

  fn make_resolver(files: Vec<(&str, &str)>) -> Resolver {
    let mem: HashMap<String, Vec<u8>> = files
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
      .collect();
    let mut fses: HashMap<String, Arc<dyn Fs>> = HashMap::new();
    fses.insert("file".to_string(), Arc::new(MemFs::new(mem)));
    Resolver::new(
      Arc::new(ModuleRegistry::with_defaults()),
      FsMap::new(fses),
      CompatibilityMode::Base,
    )
  }

  #[test]
  fn resolve_builtin1() {
    let resolver = make_resolver(vec![]);
    assert_eq!(resolver.resolve(None, "k6").unwrap(), "k6");
    assert_eq!(resolver.resolve(None, "k6/data").unwrap(), "k6/data");
    assert!(resolver.resolve(None, "k6/no_such_thing").is_err());
  }

  #[test]
  fn resolve_relative1() {
    let resolver = make_resolver(vec![]);
    let base = Url::parse("file:///scripts/main.js").unwrap();
    assert_eq!(
      resolver.resolve(Some(&base), "./lib/util.js").unwrap(),
      "file:///scripts/lib/util.js"
    );
    assert_eq!(
      resolver.resolve(Some(&base), "../other.js").unwrap(),
      "file:///other.js"
    );
    // URL semantics, including percent-encoding.
    assert_eq!(
      resolver.resolve(Some(&base), "./my%20lib.js").unwrap(),
      "file:///scripts/my%20lib.js"
    );
  }

  #[test]
  fn resolve_absolute1() {
    let resolver = make_resolver(vec![]);
    assert_eq!(
      resolver.resolve(None, "file:///abs/mod.js").unwrap(),
      "file:///abs/mod.js"
    );
    assert!(resolver.resolve(None, "ftp://example.com/mod.js").is_err());
  }

  #[test]
  fn load_bom_and_cache1() {
    let resolver = make_resolver(vec![("/scripts/bom.js", "\u{FEFF}export default 1;")]);
    let loaded = resolver.load("file:///scripts/bom.js").unwrap();
    assert_eq!(loaded.code, "export default 1;");

    // Second load serves the cache even after locking.
    resolver.lock();
    let again = resolver.load("file:///scripts/bom.js").unwrap();
    assert!(Arc::ptr_eq(&loaded, &again));
    let err = resolver.load("file:///scripts/fresh.js").unwrap_err();
    assert!(err
      .to_string()
      .contains("not previously resolved during initialization"));
  }
}
