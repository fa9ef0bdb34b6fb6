//! End-to-end scenarios driving full Runner/VU/event-loop stacks against
//! in-memory scripts.

use crate::bundle::RuntimeOptions;
use crate::errext::{classify, ExitCode, InterruptError};
use crate::events::{EventData, EventType};
use crate::metrics;
use crate::options::Options;
use crate::prelude::*;
use crate::runner::vu::VuActivationParams;
use crate::runner::{PreInitState, Runner};
use crate::test::constant::acquire_sequential_guard;
use crate::test::fixtures::{drain_samples, make_runner, make_runner_with, samples_channel};
use crate::test::log::init as test_log_init;
use crate::types::Duration as OptDuration;

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn run_iterations(runner: &Runner, vus: u64, iterations: u64) -> AnyResult<()> {
  for vu_id in 1..=vus {
    let (tx, _rx) = samples_channel();
    let mut vu = runner.new_vu(None, vu_id, vu_id, tx)?;
    let mut active = vu.activate(VuActivationParams::default());
    for _ in 0..iterations {
      active.run_once()?;
    }
  }
  Ok(())
}

#[test]
fn s1_minimal1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let runner = make_runner("export default function() {};").unwrap();
  assert_eq!(runner.get_options(), Options::default());
  assert_eq!(
    runner.bundle.callable_exports,
    HashSet::from_iter(["default".to_string()])
  );
}

#[test]
fn s2_invalid_options_type1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let err =
    make_runner("export let options = []; export default function(){};").unwrap_err();
  assert!(
    err.to_string().contains("invalid type: sequence"),
    "got: {err:#}"
  );
  let (code, _, _) = classify(&err);
  assert_eq!(code, ExitCode::InvalidConfig);
}

#[test]
fn s3_unknown_option_field1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  // Unknown fields warn but never fail the bundle.
  let runner = make_runner(
    "export let options = { something: { x: 1 } }; export default function(){};",
  )
  .unwrap();
  assert_eq!(runner.get_options(), Options::default());
}

#[test]
fn s4_stages1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let runner = make_runner(
    r#"export let options = { stages: [{duration:"10s", target:10},{duration:"5s"}] };
       export default function(){};"#,
  )
  .unwrap();
  let stages = runner.get_options().stages.unwrap();
  assert_eq!(stages.len(), 2);
  assert_eq!(stages[0].duration.as_std(), Duration::from_secs(10));
  assert_eq!(stages[0].target, Some(10));
  assert_eq!(stages[1].duration.as_std(), Duration::from_secs(5));
  assert_eq!(stages[1].target, None);
}

#[test]
fn s5_top_level_await_rejection1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let err = make_runner(
    "await Promise.resolve().then(() => { something }); export default () => {};",
  )
  .unwrap_err();
  assert!(
    err
      .to_string()
      .contains("ReferenceError: something is not defined"),
    "got: {err:#}"
  );
}

#[test]
fn s6_shared_array1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    import { SharedArray } from "k6/data";
    const users = new SharedArray("users", function () {
      const arr = [];
      for (let i = 0; i < 50; i++) {
        arr.push({ value: i, name: "user" + i });
      }
      return arr;
    });
    export default function () {
      if (users.length !== 50) { throw new Error("bad length: " + users.length); }
      if (users[2].value !== 2) { throw new Error("bad element"); }
      let seen = 0;
      for (const u of users) { seen++; }
      if (seen !== 50) { throw new Error("bad iteration: " + seen); }
    };
  "#;
  let runner = make_runner(script).unwrap();

  // The producer ran exactly once, during the first init.
  let stored = runner.bundle.shared_arrays.get("users").unwrap();
  assert_eq!(stored.len(), 50);

  run_iterations(&runner, 10, 10).unwrap();

  // Still the same single encoding after 10 VUs x 10 iterations.
  let after = runner.bundle.shared_arrays.get("users").unwrap();
  assert!(std::sync::Arc::ptr_eq(&stored, &after));
}

#[test]
fn s7_iteration_events1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let runner = make_runner("export default function() {};").unwrap();

  let (_sub_id, mut events_rx) = runner
    .preinit
    .events
    .subscribe(&[EventType::IterStart, EventType::IterEnd]);

  // Acknowledge in a background thread so emit-and-wait can proceed.
  let collector = std::thread::spawn(move || {
    let mut seen = vec![];
    while let Some(event) = events_rx.blocking_recv() {
      let data = match &event.data {
        EventData::Iteration(data) => data.clone(),
        other => panic!("unexpected event payload: {other:?}"),
      };
      seen.push((event.event_type, data));
      event.done();
    }
    seen
  });

  let (tx, _rx) = samples_channel();
  let mut vu = runner.new_vu(None, 7, 7, tx).unwrap();
  let mut active = vu.activate(VuActivationParams {
    scenario: Some("my-scenario".to_string()),
    ..Default::default()
  });
  active.run_once().unwrap();
  drop(active);
  drop(vu);
  drop(runner);

  let seen = collector.join().unwrap();
  assert_eq!(seen.len(), 2);
  assert_eq!(seen[0].0, EventType::IterStart);
  assert_eq!(seen[0].1.iteration, 0);
  assert_eq!(seen[0].1.vu_id, 7);
  assert_eq!(seen[0].1.scenario_name, "my-scenario");
  assert_eq!(seen[0].1.error, None);
  assert_eq!(seen[1].0, EventType::IterEnd);
  assert_eq!(seen[1].1.error, None);
}

#[test]
fn s8_setup_data_roundtrip1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export function setup() { return { k: 1 }; }
    export function teardown(data) {
      if (data.k !== 1) { throw new Error("teardown got: " + JSON.stringify(data)); }
    }
    export default function (data) {
      if (data.k !== 1) { throw new Error("iteration got: " + JSON.stringify(data)); }
    };
  "#;
  let runner = make_runner(script).unwrap();

  let token = CancellationToken::new();
  let (tx, _rx) = samples_channel();
  runner.setup(&token, tx).unwrap();
  assert_eq!(runner.get_setup_data().unwrap(), br#"{"k":1}"#);

  run_iterations(&runner, 1, 1).unwrap();

  let (tx, _rx) = samples_channel();
  runner.teardown(&token, tx).unwrap();
}

#[test]
fn instance_isolation1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  // Module-level state must be per-VU: each fresh VU starts from zero.
  let script = r#"
    let globalVar = 0;
    export default function () {
      globalVar++;
      if (globalVar !== __ITER + 1) {
        throw new Error("shared module state: " + globalVar + " vs " + __ITER);
      }
    };
  "#;
  let runner = make_runner(script).unwrap();
  run_iterations(&runner, 3, 4).unwrap();
}

#[test]
fn init_context_walls1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let cases = [
    (
      "export default function () { open(\"./data.txt\"); };",
      "the \"open\" function is only available in the init stage",
    ),
    (
      "export default function () { require(\"./lib.js\"); };",
      "the \"require\" function is only available in the init stage",
    ),
    (
      r#"import { SharedArray } from "k6/data";
         export default function () { new SharedArray("late", () => []); };"#,
      "new SharedArray must be called in the init context",
    ),
  ];

  for (script, expected) in cases {
    let runner = make_runner(script).unwrap();
    let (tx, _rx) = samples_channel();
    let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();
    let mut active = vu.activate(VuActivationParams::default());
    let err = active.run_once().unwrap_err();
    assert!(
      err.to_string().contains(expected),
      "script {script:?} produced: {err:#}"
    );
  }
}

#[test]
fn iter_counter1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    globalThis.__expected = 0;
    export default function () {
      if (__ITER !== globalThis.__expected) {
        throw new Error("__ITER was " + __ITER + ", expected " + globalThis.__expected);
      }
      globalThis.__expected++;
    };
  "#;
  let runner = make_runner(script).unwrap();
  run_iterations(&runner, 1, 5).unwrap();
}

#[test]
fn min_iteration_duration1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let runner = make_runner("export default function() {};").unwrap();
  let mut opts = runner.get_options();
  opts.min_iteration_duration = Some(OptDuration::from_millis(300));
  runner.set_options(&opts).unwrap();

  let (tx, _rx) = samples_channel();
  let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();
  let mut active = vu.activate(VuActivationParams::default());

  let started = Instant::now();
  active.run_once().unwrap();
  assert!(
    started.elapsed() >= Duration::from_millis(300),
    "iteration returned after {:?}",
    started.elapsed()
  );
}

#[test]
fn timer_order1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export default function () {
      const order = [];
      setTimeout(() => { order.push(1); }, 10);
      setTimeout(() => { order.push(2); }, 20);
      const cancelled = setTimeout(() => { order.push(99); }, 25);
      clearTimeout(cancelled);
      setTimeout(() => { order.push(3); }, 30);
      setTimeout(() => {
        order.push(4);
        if (order.join(",") !== "1,2,3,4") {
          throw new Error("bad timer order: " + order.join(","));
        }
      }, 40);
    };
  "#;
  let runner = make_runner(script).unwrap();
  run_iterations(&runner, 1, 3).unwrap();
}

#[test]
fn microtask_ordering1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  // Microtasks of one turn drain before any registered callback runs.
  let script = r#"
    export default function () {
      const order = [];
      Promise.resolve().then(() => order.push("m1"));
      setTimeout(() => {
        order.push("t1");
        if (order.join(",") !== "m1,m2,t1") {
          throw new Error("bad ordering: " + order.join(","));
        }
      }, 0);
      Promise.resolve().then(() => order.push("m2"));
    };
  "#;
  let runner = make_runner(script).unwrap();
  run_iterations(&runner, 1, 1).unwrap();
}

#[test]
fn shared_array_immutable1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    import { SharedArray } from "k6/data";
    const s = new SharedArray("frozen", () => [{ v: 1 }, { v: 2 }]);
    function expectTypeError(fn, what) {
      try {
        fn();
      } catch (e) {
        if (e instanceof TypeError) { return; }
        throw new Error(what + " threw " + e);
      }
      throw new Error(what + " did not throw");
    }
    export default function () {
      if (!Object.isFrozen(s[0])) { throw new Error("element not frozen"); }
      if (s[1].v !== 2) { throw new Error("bad element"); }
      expectTypeError(() => { s[0] = 5; }, "index assignment");
      expectTypeError(() => { s.length = 1; }, "length assignment");
      expectTypeError(() => { s.custom = 1; }, "property assignment");
    };
  "#;
  let runner = make_runner(script).unwrap();
  run_iterations(&runner, 2, 2).unwrap();
}

#[test]
fn shared_array_non_array1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let err = make_runner(
    r#"import { SharedArray } from "k6/data";
       const s = new SharedArray("nope", () => "not an array");
       export default function () {};"#,
  )
  .unwrap_err();
  assert!(
    err
      .to_string()
      .contains("only arrays can be made into SharedArray"),
    "got: {err:#}"
  );
}

#[test]
fn archive_roundtrip_options1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let esm = r#"export let options = { vus: 5, duration: "10s" };
               export default function () {};"#;
  let cjs = r#"module.exports.options = { vus: 5, duration: "10s" };
               module.exports.default = function () {};"#;

  let mut roundtripped = vec![];
  for script in [esm, cjs] {
    let runner = make_runner(script).unwrap();
    let archive = runner.make_archive();

    let json = archive.to_json().unwrap();
    let archive = crate::archive::Archive::from_json(&json).unwrap();

    let preinit = PreInitState::new(RuntimeOptions::default()).unwrap();
    let restored = Runner::from_archive(preinit, &archive).unwrap();
    assert_eq!(restored.get_options(), runner.get_options());
    assert!(restored.is_executable("default"));
    roundtripped.push(restored.get_options());
  }
  // ES-module and CommonJS declarations land on identical options.
  assert_eq!(roundtripped[0], roundtripped[1]);
  assert_eq!(roundtripped[0].vus, Some(5));
}

#[test]
fn setup_timeout1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export let options = { setupTimeout: "1s" };
    export function setup() { while (true) {} }
    export default function () {};
  "#;
  let runner = make_runner(script).unwrap();

  let token = CancellationToken::new();
  let (tx, _rx) = samples_channel();
  let err = runner.setup(&token, tx).unwrap_err();
  assert!(
    err.to_string().contains("setup execution timed out after"),
    "got: {err:#}"
  );
  let (code, _, hint) = classify(&err);
  assert_eq!(code, ExitCode::SetupTimeout);
  assert!(hint.unwrap().contains("setupTimeout"));
}

#[test]
fn test_abort1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    import exec from "k6/execution";
    export default function () {
      exec.test.abort("flaky backend");
      throw new Error("unreachable");
    };
  "#;
  let runner = make_runner(script).unwrap();
  let (tx, _rx) = samples_channel();
  let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();
  let mut active = vu.activate(VuActivationParams::default());

  let err = active.run_once().unwrap_err();
  let interrupt = err.downcast_ref::<InterruptError>().unwrap();
  assert_eq!(interrupt.reason, "test aborted: flaky backend");
  let (code, _, _) = classify(&err);
  assert_eq!(code, ExitCode::ScriptAborted);
}

#[test]
fn uncaught_rejection1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export default function () {
      Promise.reject(new Error("nope"));
    };
  "#;
  let runner = make_runner(script).unwrap();
  let (tx, _rx) = samples_channel();
  let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();
  let mut active = vu.activate(VuActivationParams::default());

  let err = active.run_once().unwrap_err();
  assert!(
    err.to_string().contains("Uncaught (in promise)"),
    "got: {err:#}"
  );
}

#[test]
fn activation_env1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export default function () {
      if (__ENV.STAGE !== "canary") { throw new Error("missing env: " + __ENV.STAGE); }
    };
  "#;
  let runner = make_runner(script).unwrap();
  let (tx, _rx) = samples_channel();
  let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();
  let mut active = vu.activate(VuActivationParams {
    env: HashMap::from_iter([("STAGE".to_string(), "canary".to_string())]),
    ..Default::default()
  });
  active.run_once().unwrap();
}

#[test]
fn iteration_samples1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    import { sleep } from "k6";
    export default function () { sleep(0.05); };
  "#;
  let runner = make_runner(script).unwrap();
  let (tx, mut rx) = samples_channel();
  let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();
  let mut active = vu.activate(VuActivationParams {
    scenario: Some("load".to_string()),
    ..Default::default()
  });
  active.run_once().unwrap();

  let samples = drain_samples(&mut rx);
  let duration_sample = samples
    .iter()
    .find(|s| s.metric.name == metrics::ITERATION_DURATION)
    .expect("iteration_duration emitted");
  assert!(duration_sample.value >= 50.0, "got {}", duration_sample.value);
  assert_eq!(duration_sample.tags.get("scenario").unwrap(), "load");

  let iterations_sample = samples
    .iter()
    .find(|s| s.metric.name == metrics::ITERATIONS)
    .expect("iterations emitted");
  assert_eq!(iterations_sample.value, 1.0);
}

#[test]
fn relative_imports1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    import { add } from "./lib/math.js";
    export default function () {
      if (add(2, 3) !== 5) { throw new Error("bad import"); }
    };
  "#;
  let lib = "export function add(a, b) { return a + b; }";
  let runner =
    make_runner_with(script, vec![("/test/lib/math.js", lib)], RuntimeOptions::default())
      .unwrap();
  run_iterations(&runner, 1, 1).unwrap();
}

#[test]
fn cyclic_imports1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    import { ping } from "./a.js";
    export default function () {
      if (ping() !== "pong") { throw new Error("cycle broken"); }
    };
  "#;
  let a = r#"
    import { pong } from "./b.js";
    export function ping() { return pong(); }
  "#;
  let b = r#"
    import { ping } from "./a.js";
    export function pong() { return "pong"; }
  "#;
  let runner = make_runner_with(
    script,
    vec![("/test/a.js", a), ("/test/b.js", b)],
    RuntimeOptions::default(),
  )
  .unwrap();
  run_iterations(&runner, 1, 1).unwrap();
}

#[test]
fn no_exported_functions1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let err = make_runner("export const answer = 42;").unwrap_err();
  assert!(
    err.to_string().contains("no exported functions in script"),
    "got: {err:#}"
  );
}

#[test]
fn handle_summary1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export function handleSummary(data) {
      return { "summary.txt": "metrics: " + Object.keys(data.metrics).length };
    }
    export default function () {};
  "#;
  let runner = make_runner(script).unwrap();

  let summary = crate::runner::Summary {
    metrics: serde_json::json!({
      "iterations": {"type": "counter", "contains": "default", "values": {"count": 3}},
    }),
    test_run_duration: Duration::from_secs(1),
    ..Default::default()
  };
  let (tx, _rx) = samples_channel();
  let outputs = runner.handle_summary(&summary, tx).unwrap();
  assert_eq!(outputs.get("summary.txt").unwrap(), b"metrics: 1");
}

#[test]
fn handle_summary_default1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let runner = make_runner("export default function () {};").unwrap();
  let summary = crate::runner::Summary {
    metrics: serde_json::json!({
      "iterations": {"type": "counter", "contains": "default", "values": {"count": 3}},
    }),
    test_run_duration: Duration::from_secs(1),
    ..Default::default()
  };
  let (tx, _rx) = samples_channel();
  let outputs = runner.handle_summary(&summary, tx).unwrap();
  let stdout = String::from_utf8(outputs.get("stdout").unwrap().clone()).unwrap();
  assert!(stdout.contains("iterations"), "got: {stdout}");
}

#[test]
fn run_context_cancellation1() {
  let _guard = acquire_sequential_guard();
  test_log_init();

  let script = r#"
    export default function () {
      while (true) {}
    };
  "#;
  let runner = make_runner(script).unwrap();
  let (tx, _rx) = samples_channel();
  let mut vu = runner.new_vu(None, 1, 1, tx).unwrap();

  let token = CancellationToken::new();
  let (deactivated_tx, deactivated_rx) = std::sync::mpsc::channel();
  let mut active = vu.activate(VuActivationParams {
    run_context: token.clone(),
    deactivate_callback: Some(Box::new(move || {
      let _ = deactivated_tx.send(());
    })),
    ..Default::default()
  });

  let canceller = std::thread::spawn(move || {
    std::thread::sleep(Duration::from_millis(200));
    token.cancel();
  });

  let err = active.run_once().unwrap_err();
  assert!(
    err.downcast_ref::<crate::errext::ContextCanceled>().is_some(),
    "got: {err:#}"
  );
  canceller.join().unwrap();
  deactivated_rx
    .recv_timeout(Duration::from_secs(5))
    .expect("deactivate callback invoked");
}
