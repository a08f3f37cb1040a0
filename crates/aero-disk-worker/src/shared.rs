use std::sync::{Arc, Mutex};

use crate::protocol::{ErrorKind, WorkerError};

/// Cloneable shared byte region backing `readInto` / `writeFrom`.
///
/// The stand-in for a shared-memory buffer owned jointly by the worker and
/// its peer. The worker only touches it while handling a request; the peer
/// must not mutate a window the worker currently owns.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("shared buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_window(&self, offset: u64, len: u64) -> Result<(usize, usize), WorkerError> {
        let total = self.len() as u64;
        let end = offset.checked_add(len).ok_or_else(|| {
            WorkerError::new(ErrorKind::Overflow, "shared window overflows")
        })?;
        if end > total {
            return Err(WorkerError::new(
                ErrorKind::OutOfRange,
                format!("shared window {offset}+{len} exceeds buffer of {total} bytes"),
            ));
        }
        Ok((offset as usize, len as usize))
    }

    /// Copies `data` into the window starting at `offset`.
    pub fn write_window(&self, offset: u64, data: &[u8]) -> Result<(), WorkerError> {
        let (offset, len) = self.check_window(offset, data.len() as u64)?;
        let mut guard = self.inner.lock().expect("shared buffer lock poisoned");
        guard[offset..offset + len].copy_from_slice(data);
        Ok(())
    }

    /// Copies the window starting at `offset` out into a fresh buffer.
    pub fn read_window(&self, offset: u64, len: u64) -> Result<Vec<u8>, WorkerError> {
        let (offset, len) = self.check_window(offset, len)?;
        let guard = self.inner.lock().expect("shared buffer lock poisoned");
        Ok(guard[offset..offset + len].to_vec())
    }

    /// Full copy of the buffer contents (test helper).
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("shared buffer lock poisoned").clone()
    }
}
