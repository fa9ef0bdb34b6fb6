//! Converting v8 exceptions into typed script errors.

use crate::errext::ScriptError;

/// Renders a caught exception into a [`ScriptError`], pulling the `stack`
/// property when the thrown value carries one. `prefix` is prepended to
/// both renderings (used for `"Uncaught (in promise) "`).
pub fn exception_to_script_error(
  scope: &mut v8::HandleScope,
  exception: v8::Local<v8::Value>,
  prefix: Option<&str>,
) -> ScriptError {
  let mut message = exception.to_rust_string_lossy(scope);

  let mut stack = exception.to_object(scope).and_then(|obj| {
    let key = v8::String::new(scope, "stack")?;
    let value = obj.get(scope, key.into())?;
    if value.is_string() {
      Some(value.to_rust_string_lossy(scope))
    } else {
      None
    }
  });

  if let Some(prefix) = prefix {
    message = format!("{prefix}{message}");
    stack = stack.map(|s| format!("{prefix}{s}"));
  }

  ScriptError::new(message, stack)
}

/// Renders whatever the given try-catch scope holds; callers must have
/// checked `has_caught` first.
pub fn from_try_catch(
  tc_scope: &mut v8::TryCatch<v8::HandleScope>,
  prefix: Option<&str>,
) -> ScriptError {
  match tc_scope.exception() {
    Some(exception) => exception_to_script_error(tc_scope, exception, prefix),
    None => ScriptError::new("unknown script error".to_string(), None),
  }
}
