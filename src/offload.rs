//! Offload bridge for CPU-bound codec work
//!
//! Galois-field arithmetic over whole stripes is pure CPU; running it on
//! the driver task would hold the cooperative scheduler hostage. Work is
//! pushed to the blocking worker pool and the result comes back through a
//! single-shot completion handle the driver awaits, which is also the
//! driver's suspension point.
//!
//! Cancellation is coarse: an in-flight offload always runs to completion;
//! the driver only observes abort requests between stripes.

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Completion handle for one offloaded unit of work.
#[derive(Debug)]
pub struct OffloadHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> OffloadHandle<T> {
    /// Await the offloaded result.
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| Error::OffloadLost)
    }
}

/// Run `work` on the blocking worker pool, returning a completion handle.
///
/// The closure owns everything it touches; buffers travel into the worker
/// and come back inside the result.
pub fn offload<T, F>(work: F) -> OffloadHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        // receiver dropped means the driver is unwinding; nothing to do
        let _ = tx.send(work());
    });
    OffloadHandle { rx }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offload_returns_result() {
        let handle = offload(|| 21 * 2);
        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_offload_moves_buffers_through() {
        let buf = vec![1u8; 64];
        let handle = offload(move || {
            let mut buf = buf;
            buf.iter_mut().for_each(|b| *b ^= 0xff);
            buf
        });
        let buf = handle.wait().await.unwrap();
        assert!(buf.iter().all(|&b| b == 0xfe));
    }
}
