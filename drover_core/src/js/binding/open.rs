//! The `open()` global: init-context-only file reads, resolved relative to
//! the entrypoint module's directory.

use crate::errext::InitContextError;
use crate::fsext::{Fs, PathNeverRequestedError};
use crate::js::binding::{throw_error, throw_type_error};
use crate::js::loader::fs_key;
use crate::js::JsRuntime;
use crate::prelude::*;

pub fn open(
  scope: &mut v8::HandleScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = JsRuntime::state(scope);

  {
    let state = state_rc.borrow();
    if !state.bag.in_init_context {
      throw_error(scope, &InitContextError("open".to_string()).to_string());
      return;
    }
  }

  if args.length() == 0 || !args.get(0).is_string() {
    throw_type_error(scope, "open() requires a file path");
    return;
  }
  let path = args.get(0).to_rust_string_lossy(scope);
  let binary = args.length() > 1 && args.get(1).to_rust_string_lossy(scope) == "b";

  let (fs, url) = {
    let state = state_rc.borrow();
    let bag = &state.bag;

    // `open()` resolves against the entrypoint's directory, not the module
    // that contains the call. Warn once per Bundle when those differ.
    if let Some(current) = bag.module_dir_stack.last() {
      if let (Ok(current_dir), entry_dir) = (current.join("."), &bag.entrypoint_pwd) {
        if current_dir != *entry_dir {
          bag.open_relativity_warned.call_once(|| {
            warn!(
              "open() is resolved relative to the main script's directory ({}), \
               not the calling module's directory ({}); this behavior may change \
               in a future release",
              entry_dir, current_dir
            );
          });
        }
      }
    }

    let url = match bag.entrypoint_pwd.join(&path) {
      Ok(url) => url,
      Err(e) => {
        drop(state);
        throw_error(scope, &format!("invalid path {path:?}: {e}"));
        return;
      }
    };
    let Some(fs) = bag.filesystems.get(url.scheme()) else {
      drop(state);
      throw_error(scope, &format!("no filesystem for scheme {:?}", url.scheme()));
      return;
    };
    (fs, url)
  };

  let key = fs_key(&url);
  if fs.is_dir(&key) {
    throw_error(
      scope,
      &format!("open() can't be used with directories, path: \"{path}\""),
    );
    return;
  }

  let data = match fs.read_file(&key) {
    Ok(data) => data,
    Err(e) => {
      if e.downcast_ref::<PathNeverRequestedError>().is_some() {
        throw_error(
          scope,
          &format!(
            "open() can't be used with files that weren't previously opened \
             during initialization (__VU==0), path: \"{path}\""
          ),
        );
      } else {
        throw_error(scope, &e.to_string());
      }
      return;
    }
  };

  if binary {
    let store =
      v8::ArrayBuffer::new_backing_store_from_boxed_slice(data.into_boxed_slice());
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store.make_shared());
    rv.set(buffer.into());
  } else {
    let text = String::from_utf8_lossy(&data);
    let value = v8::String::new(scope, &text).unwrap();
    rv.set(value.into());
  }
}
