//! Per-VU cookie jar. The HTTP module (an external collaborator) reads and
//! writes it; the core only owns its lifecycle and the per-iteration reset.

use crate::prelude::*;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
  pub name: String,
  pub value: String,
  pub path: String,
  pub secure: bool,
}

/// Cookies keyed by domain. Not shared across VUs.
#[derive(Debug, Default)]
pub struct CookieJar {
  cookies: Mutex<HashMap<String, Vec<Cookie>>>,
}

impl CookieJar {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, domain: &str, cookie: Cookie) {
    let mut cookies = self.cookies.lock();
    let entry = cookies.entry(domain.to_string()).or_default();
    entry.retain(|c| c.name != cookie.name || c.path != cookie.path);
    entry.push(cookie);
  }

  pub fn cookies_for(&self, domain: &str) -> Vec<Cookie> {
    self
      .cookies
      .lock()
      .get(domain)
      .cloned()
      .unwrap_or_default()
  }

  /// Drops everything; called between iterations unless `noCookiesReset`.
  pub fn clear(&self) {
    self.cookies.lock().clear();
  }
}

#[cfg(test)]
mod cookiejar_tests {
  use super::*;

  #[test]
  fn set_and_clear1() {
    let jar = CookieJar::new();
    jar.set(
      "example.com",
      Cookie {
        name: "sid".into(),
        value: "abc".into(),
        path: "/".into(),
        secure: false,
      },
    );
    assert_eq!(jar.cookies_for("example.com").len(), 1);

    // Same name+path replaces.
    jar.set(
      "example.com",
      Cookie {
        name: "sid".into(),
        value: "xyz".into(),
        path: "/".into(),
        secure: false,
      },
    );
    let got = jar.cookies_for("example.com");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].value, "xyz");

    jar.clear();
    assert!(jar.cookies_for("example.com").is_empty());
  }
}
