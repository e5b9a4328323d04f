//! Bounded capture of the guest's stdout and stderr
//!
//! The guest always sees its writes succeed. Only the first `capacity` bytes
//! are kept; anything after that is dropped and the capture is marked
//! truncated.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use wasmtime_wasi::{HostOutputStream, StdoutStream, StreamResult, Subscribe};

/// Largest single write the guest is offered at once
const WRITE_PERMIT: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct Captured {
    buffer: Vec<u8>,
    truncated: bool,
}

/// An output stream that keeps a bounded prefix of what the guest writes
#[derive(Debug, Clone)]
pub struct CapturePipe {
    capacity: usize,
    shared: Arc<Mutex<Captured>>,
}

impl CapturePipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shared: Arc::new(Mutex::new(Captured::default())),
        }
    }

    /// Bytes kept so far
    pub fn contents(&self) -> Vec<u8> {
        self.lock().buffer.clone()
    }

    /// Whether any write was cut short
    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    fn append(&self, bytes: &[u8]) {
        let mut captured = self.lock();
        let room = self.capacity.saturating_sub(captured.buffer.len());
        let keep = room.min(bytes.len());
        captured.buffer.extend_from_slice(&bytes[..keep]);
        if keep < bytes.len() {
            captured.truncated = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StdoutStream for CapturePipe {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

#[async_trait]
impl Subscribe for CapturePipe {
    async fn ready(&mut self) {}
}

#[async_trait]
impl HostOutputStream for CapturePipe {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.append(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}
