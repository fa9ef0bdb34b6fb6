//! The `k6/execution` builtin: live VU/scenario introspection and
//! `test.abort`.

use crate::js::hook::execute_script;
use crate::modules::BuiltinModule;
use crate::prelude::*;

pub struct ExecutionModule;

const EXEC_BUILDER: &str = r#"
(function (host) {
  return {
    get vu() {
      return host.__exec_snapshot().vu;
    },
    get scenario() {
      return host.__exec_snapshot().scenario;
    },
    test: {
      abort(reason) {
        host.exec_test_abort(reason);
      },
    },
  };
})(globalThis.__InternalDroverGlobalObject)
"#;

impl BuiltinModule for ExecutionModule {
  fn new_module_instance<'s>(
    &self,
    scope: &mut v8::HandleScope<'s>,
  ) -> AnyResult<v8::Local<'s, v8::Object>> {
    let value = execute_script(scope, "drover:modules/execution", EXEC_BUILDER)?;
    value
      .to_object(scope)
      .ok_or_else(|| anyhow::anyhow!("execution module builder returned a non-object"))
  }
}
