//! Cancellable request/response handles between callers and the worker.
//!
//! Every request gets an id and a cancellation token tracked in a
//! [`RequestTable`]. The worker checks the token before doing the work and
//! again before delivering; a cancelled request either never runs or has its
//! result dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};

pub type RequestId = u64;

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, CancellationToken>>,
}

/// In-flight requests keyed by id. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct RequestTable {
    inner: Arc<Inner>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new request and return both ends of it.
    pub fn issue<T>(&self) -> (CancelableRequest<T>, PendingRequest<T>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, token.clone());
        (
            CancelableRequest {
                id,
                token: token.clone(),
                rx,
                table: self.clone(),
            },
            PendingRequest {
                id,
                token,
                tx: Some(tx),
                table: self.clone(),
            },
        )
    }

    /// Cancel request `id`. Returns false if it already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.pending().remove(&id) {
            Some(token) => {
                token.cancel();
                debug!(request_id = id, "Request canceled");
                true
            }
            None => false,
        }
    }

    fn finish(&self, id: RequestId) {
        self.pending().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

/// The caller's end of a request.
#[derive(Debug)]
pub struct CancelableRequest<T> {
    id: RequestId,
    token: CancellationToken,
    rx: oneshot::Receiver<T>,
    table: RequestTable,
}

impl<T> CancelableRequest<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn cancel(&self) {
        self.table.cancel(self.id);
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the result. Resolves to `Canceled` if the request was
    /// cancelled and to `ShuttingDown` if the worker went away first.
    pub async fn wait(self) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(WaypointError::Canceled),
            result = self.rx => result.map_err(|_| WaypointError::ShuttingDown),
        }
    }
}

/// The worker's end of a request.
#[derive(Debug)]
pub struct PendingRequest<T> {
    id: RequestId,
    token: CancellationToken,
    tx: Option<oneshot::Sender<T>>,
    table: RequestTable,
}

impl<T> PendingRequest<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Deliver `value` unless the request was cancelled meanwhile.
    pub fn forward(mut self, value: T) {
        self.table.finish(self.id);
        if self.token.is_cancelled() {
            debug!(request_id = self.id, "Dropping result of canceled request");
            return;
        }
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped its handle.
            let _ = tx.send(value);
        }
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        self.table.finish(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_delivers() {
        let table = RequestTable::new();
        let (request, pending) = table.issue::<u32>();
        assert_eq!(table.len(), 1);
        pending.forward(7);
        assert_eq!(request.wait().await.unwrap(), 7);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_canceled_request_is_not_delivered() {
        let table = RequestTable::new();
        let (request, pending) = table.issue::<u32>();
        request.cancel();
        assert!(pending.is_canceled());
        pending.forward(7);
        assert!(matches!(request.wait().await, Err(WaypointError::Canceled)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_by_id() {
        let table = RequestTable::new();
        let (request, pending) = table.issue::<()>();
        assert!(table.cancel(request.id()));
        assert!(!table.cancel(request.id()));
        assert!(pending.is_canceled());
        assert!(request.is_canceled());
    }

    #[tokio::test]
    async fn test_dropped_worker_end_means_shutdown() {
        let table = RequestTable::new();
        let (request, pending) = table.issue::<u32>();
        drop(pending);
        assert!(matches!(request.wait().await, Err(WaypointError::ShuttingDown)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let table = RequestTable::new();
        let (a, _pa) = table.issue::<()>();
        let (b, _pb) = table.issue::<()>();
        assert_ne!(a.id(), b.id());
    }
}
