//! Reusable byte-buffer pool shared by all VUs of a run.

use bytes::BytesMut;
use parking_lot::Mutex;

const DEFAULT_BUF_CAPACITY: usize = 64 * 1024;
const MAX_POOLED: usize = 256;

/// Hands out cleared [`BytesMut`] buffers and takes them back for reuse so
/// iteration-heavy workloads don't re-allocate per request.
#[derive(Default)]
pub struct BufferPool {
  free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self) -> BytesMut {
    match self.free.lock().pop() {
      Some(buf) => buf,
      None => BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
    }
  }

  pub fn put(&self, mut buf: BytesMut) {
    buf.clear();
    let mut free = self.free.lock();
    if free.len() < MAX_POOLED {
      free.push(buf);
    }
  }
}

#[cfg(test)]
mod bufpool_tests {
  use super::*;

  #[test]
  fn reuse1() {
    let pool = BufferPool::new();
    let mut buf = pool.get();
    buf.extend_from_slice(b"payload");
    pool.put(buf);

    let buf = pool.get();
    assert!(buf.is_empty());
    assert!(buf.capacity() >= DEFAULT_BUF_CAPACITY);
  }
}
