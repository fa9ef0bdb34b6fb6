//! The `k6/timers` builtin: the timer globals re-exported as a module.

use crate::js::binding::{get_global, set_property_to};
use crate::modules::BuiltinModule;
use crate::prelude::*;

pub struct TimersModule;

impl BuiltinModule for TimersModule {
  fn new_module_instance<'s>(
    &self,
    scope: &mut v8::HandleScope<'s>,
  ) -> AnyResult<v8::Local<'s, v8::Object>> {
    let exports = v8::Object::new(scope);

    for name in ["setTimeout", "setInterval", "clearTimeout", "clearInterval"] {
      let value = get_global(scope, name)
        .ok_or_else(|| anyhow::anyhow!("runtime bootstrap did not install {name}"))?;
      set_property_to(scope, exports, name, value);
    }

    Ok(exports)
  }
}
