//! The `k6/data` builtin: the SharedArray constructor.

use crate::js::binding::{get_host_property, set_property_to};
use crate::modules::BuiltinModule;
use crate::prelude::*;

pub struct DataModule;

impl BuiltinModule for DataModule {
  fn new_module_instance<'s>(
    &self,
    scope: &mut v8::HandleScope<'s>,
  ) -> AnyResult<v8::Local<'s, v8::Object>> {
    let exports = v8::Object::new(scope);

    let ctor = get_host_property(scope, "__shared_array_ctor")
      .ok_or_else(|| anyhow::anyhow!("runtime bootstrap did not install SharedArray"))?;
    set_property_to(scope, exports, "SharedArray", ctor);

    Ok(exports)
  }
}
