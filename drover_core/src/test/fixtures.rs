//! Script and runner fixtures for unit tests.

use crate::bundle::{RuntimeOptions, Source};
use crate::fsext::{Fs, FsMap, MemFs};
use crate::metrics::{Sample, SampleSender};
use crate::prelude::*;
use crate::runner::{PreInitState, Runner};

use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use url::Url;

pub const SCRIPT_URL: &str = "file:///test/script.js";

/// An in-memory `file` filesystem holding the given files (paths like
/// `/test/lib.js`).
pub fn mem_filesystems(files: Vec<(&str, &str)>) -> FsMap {
  let mem: HashMap<String, Vec<u8>> = files
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
    .collect();
  let mut fses: HashMap<String, Arc<dyn Fs>> = HashMap::new();
  fses.insert("file".to_string(), Arc::new(MemFs::new(mem)));
  FsMap::new(fses)
}

pub fn make_runner(script: &str) -> AnyResult<Runner> {
  make_runner_with(script, vec![], RuntimeOptions::default())
}

pub fn make_runner_with(
  script: &str,
  extra_files: Vec<(&str, &str)>,
  rtopts: RuntimeOptions,
) -> AnyResult<Runner> {
  let mut files = vec![("/test/script.js", script)];
  files.extend(extra_files);
  let filesystems = mem_filesystems(files);

  let source = Source::new(
    Url::parse(SCRIPT_URL).unwrap(),
    script.as_bytes().to_vec(),
  );
  let preinit = PreInitState::new(rtopts)?;
  Runner::new(preinit, source, filesystems)
}

pub fn samples_channel() -> (SampleSender, UnboundedReceiver<Vec<Sample>>) {
  unbounded_channel()
}

/// Drains everything currently sitting in the sample channel.
pub fn drain_samples(rx: &mut UnboundedReceiver<Vec<Sample>>) -> Vec<Sample> {
  let mut all = vec![];
  while let Ok(batch) = rx.try_recv() {
    all.extend(batch);
  }
  all
}
