//! The per-VU `console`: native formatting of JavaScript values and the
//! logging sink with its optional secondary file writer.

use crate::js::binding::set_function_to;
use crate::js::JsRuntime;
use crate::prelude::*;

use parking_lot::Mutex;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
  Debug,
  Info,
  Warn,
  Error,
}

impl ConsoleLevel {
  fn as_str(&self) -> &'static str {
    match self {
      ConsoleLevel::Debug => "debug",
      ConsoleLevel::Info => "info",
      ConsoleLevel::Warn => "warning",
      ConsoleLevel::Error => "error",
    }
  }
}

/// Script log sink. Everything goes to the process logger with a fixed
/// `source=console` field; when `consoleOutput` is configured, lines are
/// also appended to that file in logfmt shape.
pub struct Console {
  file: Option<Mutex<std::fs::File>>,
}

impl Console {
  pub fn new() -> Self {
    Self { file: None }
  }

  /// Opens (append + create) the secondary output file.
  pub fn with_output_file(path: &str) -> AnyResult<Self> {
    let file = std::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(path)?;
    Ok(Self {
      file: Some(Mutex::new(file)),
    })
  }

  pub fn log(&self, level: ConsoleLevel, msg: &str) {
    match level {
      ConsoleLevel::Debug => debug!(target: "console", source = "console", "{msg}"),
      ConsoleLevel::Info => info!(target: "console", source = "console", "{msg}"),
      ConsoleLevel::Warn => warn!(target: "console", source = "console", "{msg}"),
      ConsoleLevel::Error => error!(target: "console", source = "console", "{msg}"),
    }
    if let Some(file) = &self.file {
      let mut file = file.lock();
      let _ = writeln!(file, "level={} msg={:?} source=console", level.as_str(), msg);
    }
  }
}

impl Default for Console {
  fn default() -> Self {
    Console::new()
  }
}

/// Installs the `console` object onto the global.
pub fn install(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>) {
  let template = v8::ObjectTemplate::new(scope);
  let console = template.new_instance(scope).unwrap();

  set_function_to(scope, console, "log", console_log);
  set_function_to(scope, console, "info", console_info);
  set_function_to(scope, console, "debug", console_debug);
  set_function_to(scope, console, "warn", console_warn);
  set_function_to(scope, console, "error", console_error);
  set_function_to(scope, console, "assert", console_assert);

  let key = v8::String::new(scope, "console").unwrap();
  global.set(scope, key.into(), console.into());
}

fn log_args(
  scope: &mut v8::HandleScope,
  args: &v8::FunctionCallbackArguments,
  level: ConsoleLevel,
  skip: i32,
  prefix: Option<String>,
) {
  let mut parts: Vec<String> = vec![];
  if let Some(prefix) = prefix {
    parts.push(prefix);
  }
  for i in skip..args.length() {
    parts.push(format_value(scope, args.get(i), true, &mut vec![]));
  }
  let msg = parts.join(" ");

  let console = JsRuntime::state(scope).borrow().bag.console.clone();
  console.log(level, &msg);
}

fn console_log(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  log_args(scope, &args, ConsoleLevel::Info, 0, None);
}

fn console_info(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  log_args(scope, &args, ConsoleLevel::Info, 0, None);
}

fn console_debug(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  log_args(scope, &args, ConsoleLevel::Debug, 0, None);
}

fn console_warn(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  log_args(scope, &args, ConsoleLevel::Warn, 0, None);
}

fn console_error(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  log_args(scope, &args, ConsoleLevel::Error, 0, None);
}

/// No-op on a truthy condition; otherwise logs the remaining arguments at
/// error level behind an `Assertion failed` prefix.
fn console_assert(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  if args.length() > 0 && args.get(0).boolean_value(scope) {
    return;
  }
  if args.length() > 1 && args.get(1).is_string() {
    let first = args.get(1).to_rust_string_lossy(scope);
    log_args(
      scope,
      &args,
      ConsoleLevel::Error,
      2,
      Some(format!("Assertion failed: {first}")),
    );
  } else {
    log_args(
      scope,
      &args,
      ConsoleLevel::Error,
      1,
      Some("Assertion failed".to_string()),
    );
  }
}

/// Renders one value the way `console.*` prints it. `top_level` strings are
/// bare; nested strings are JSON-quoted.
pub fn format_value<'s>(
  scope: &mut v8::HandleScope<'s>,
  value: v8::Local<'s, v8::Value>,
  top_level: bool,
  seen: &mut Vec<v8::Local<'s, v8::Object>>,
) -> String {
  if value.is_string() {
    let s = value.to_rust_string_lossy(scope);
    if top_level {
      return s;
    }
    return serde_json::to_string(&s).unwrap_or(s);
  }

  if value.is_function() {
    return "[object Function]".to_string();
  }

  if value.is_native_error() {
    if let Some(obj) = value.to_object(scope) {
      let key = v8::String::new(scope, "message").unwrap();
      if let Some(message) = obj.get(scope, key.into()) {
        return message.to_rust_string_lossy(scope);
      }
    }
  }

  if value.is_date() {
    let iso = call_method_string(scope, value, "toISOString");
    return format!("\"{}\"", iso.unwrap_or_else(|| value.to_rust_string_lossy(scope)));
  }

  if value.is_array_buffer() {
    let buf = v8::Local::<v8::ArrayBuffer>::try_from(value).unwrap();
    return format_array_buffer(&buf);
  }

  if value.is_typed_array() {
    return format_typed_array(scope, value, seen);
  }

  if value.is_array() {
    return format_array(scope, value, seen);
  }

  if value.is_object() && !value.is_null() {
    return format_object(scope, value, seen);
  }

  // Primitives: numbers, booleans, null, undefined, bigint, symbols.
  match value.to_detail_string(scope) {
    Some(s) => s.to_rust_string_lossy(scope),
    None => value.type_repr().to_string(),
  }
}

fn is_circular<'s>(
  obj: v8::Local<'s, v8::Object>,
  seen: &[v8::Local<'s, v8::Object>],
) -> bool {
  seen.iter().any(|prev| prev.strict_equals(obj.into()))
}

fn format_array<'s>(
  scope: &mut v8::HandleScope<'s>,
  value: v8::Local<'s, v8::Value>,
  seen: &mut Vec<v8::Local<'s, v8::Object>>,
) -> String {
  let arr = v8::Local::<v8::Array>::try_from(value).unwrap();
  let obj: v8::Local<v8::Object> = arr.into();
  if is_circular(obj, seen) {
    return "[Circular]".to_string();
  }
  seen.push(obj);

  let mut items = vec![];
  for i in 0..arr.length() {
    let item = arr
      .get_index(scope, i)
      .unwrap_or_else(|| v8::undefined(scope).into());
    items.push(format_value(scope, item, false, seen));
  }
  seen.pop();

  if items.is_empty() {
    return "[]".to_string();
  }
  format!("[ {} ]", items.join(", "))
}

fn format_object<'s>(
  scope: &mut v8::HandleScope<'s>,
  value: v8::Local<'s, v8::Value>,
  seen: &mut Vec<v8::Local<'s, v8::Object>>,
) -> String {
  let Some(obj) = value.to_object(scope) else {
    return value.to_rust_string_lossy(scope);
  };
  if is_circular(obj, seen) {
    return "[Circular]".to_string();
  }
  seen.push(obj);

  let mut parts = vec![];
  if let Some(names) = obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
  {
    for i in 0..names.length() {
      let Some(name) = names.get_index(scope, i) else {
        continue;
      };
      let key = name.to_rust_string_lossy(scope);
      let prop = obj
        .get(scope, name)
        .unwrap_or_else(|| v8::undefined(scope).into());
      parts.push(format!("{}: {}", key, format_value(scope, prop, false, seen)));
    }
  }
  seen.pop();

  if parts.is_empty() {
    return "{}".to_string();
  }
  format!("{{ {} }}", parts.join(", "))
}

fn format_typed_array<'s>(
  scope: &mut v8::HandleScope<'s>,
  value: v8::Local<'s, v8::Value>,
  seen: &mut Vec<v8::Local<'s, v8::Object>>,
) -> String {
  let kind = typed_array_kind(value);
  let ta = v8::Local::<v8::TypedArray>::try_from(value).unwrap();
  let length = ta.length();
  let obj: v8::Local<v8::Object> = ta.into();

  let mut items = vec![];
  for i in 0..length {
    let item = obj
      .get_index(scope, i as u32)
      .unwrap_or_else(|| v8::undefined(scope).into());
    items.push(format_value(scope, item, false, seen));
  }

  if items.is_empty() {
    return format!("{kind}({length}) []");
  }
  format!("{kind}({length}) [ {} ]", items.join(", "))
}

fn typed_array_kind(value: v8::Local<v8::Value>) -> &'static str {
  if value.is_int8_array() {
    "Int8Array"
  } else if value.is_uint8_array() {
    "Uint8Array"
  } else if value.is_uint8_clamped_array() {
    "Uint8ClampedArray"
  } else if value.is_int16_array() {
    "Int16Array"
  } else if value.is_uint16_array() {
    "Uint16Array"
  } else if value.is_int32_array() {
    "Int32Array"
  } else if value.is_uint32_array() {
    "Uint32Array"
  } else if value.is_float32_array() {
    "Float32Array"
  } else if value.is_float64_array() {
    "Float64Array"
  } else if value.is_big_int64_array() {
    "BigInt64Array"
  } else if value.is_big_uint64_array() {
    "BigUint64Array"
  } else {
    "TypedArray"
  }
}

fn format_array_buffer(buf: &v8::Local<v8::ArrayBuffer>) -> String {
  let len = buf.byte_length();
  let store = buf.get_backing_store();
  let mut hex = Vec::with_capacity(len);
  if let Some(data) = store.data() {
    let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) };
    for b in bytes {
      hex.push(format!("{b:02x}"));
    }
  }
  format!(
    "ArrayBuffer {{ [Uint8Contents]: <{}>, byteLength: {} }}",
    hex.join(" "),
    len
  )
}

fn call_method_string<'s>(
  scope: &mut v8::HandleScope<'s>,
  value: v8::Local<'s, v8::Value>,
  method: &str,
) -> Option<String> {
  let obj = value.to_object(scope)?;
  let key = v8::String::new(scope, method)?;
  let func = obj.get(scope, key.into())?;
  let func = v8::Local::<v8::Function>::try_from(func).ok()?;
  let result = func.call(scope, value, &[])?;
  Some(result.to_rust_string_lossy(scope))
}
