//! Logging utils.

use std::sync::Once;

/// Initialize stderr logging.
///
/// It uses the `DROVER_LOG` environment variable to control the logging
/// level. Defaults to `error`.
pub fn init() {
  static INITIALIZED: Once = Once::new();
  INITIALIZED.call_once(|| {
    let filter = tracing_subscriber::EnvFilter::try_from_env("DROVER_LOG")
      .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
      .with_level(true)
      .with_ansi(false)
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
  });
}
