//! The root `k6` builtin: `sleep` and `group`.

use crate::js::binding::{get_host_property, set_function_to, set_property_to};
use crate::js::binding::exec;
use crate::modules::BuiltinModule;
use crate::prelude::*;

pub struct K6Module;

impl BuiltinModule for K6Module {
  fn new_module_instance<'s>(
    &self,
    scope: &mut v8::HandleScope<'s>,
  ) -> AnyResult<v8::Local<'s, v8::Object>> {
    let exports = v8::Object::new(scope);

    set_function_to(scope, exports, "sleep", exec::sleep);

    let group = get_host_property(scope, "__group")
      .ok_or_else(|| anyhow::anyhow!("runtime bootstrap did not install group()"))?;
    set_property_to(scope, exports, "group", group);

    Ok(exports)
  }
}
