//! Pending requests resolved by the privileged UI
//!
//! A flow that needs user input calls [`PromiseRegistry::create`], hands the id to
//! the UI and awaits the returned [`DappPromise`]. Whoever is addressed with that id
//! resolves, rejects or cancels it exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    #[error("Unknown request id: {0}")]
    NotFound(String),
    #[error("Rejected by user")]
    Rejected,
    #[error("Request was canceled")]
    Canceled,
    #[error("Request was abandoned")]
    Abandoned,
}

struct PendingRequest<T> {
    resolve: oneshot::Sender<Result<T, PromiseError>>,
    canceled: Arc<AtomicBool>,
}

/// Awaitable side of a pending request.
pub struct DappPromise<T> {
    id: String,
    rx: oneshot::Receiver<Result<T, PromiseError>>,
    canceled: Arc<AtomicBool>,
}

impl<T> DappPromise<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Wait for resolution. There is no timeout; a dropped registry entry yields `Abandoned`.
    pub async fn wait(self) -> Result<T, PromiseError> {
        self.rx.await.map_err(|_| PromiseError::Abandoned)?
    }
}

pub struct PromiseRegistry<T> {
    pending: Mutex<HashMap<String, PendingRequest<T>>>,
}

impl<T: Send + 'static> Default for PromiseRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> PromiseRegistry<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self) -> (String, DappPromise<T>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let canceled = Arc::new(AtomicBool::new(false));

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                id.clone(),
                PendingRequest {
                    resolve: tx,
                    canceled: canceled.clone(),
                },
            );
        }
        debug!(promise_id = %id, "Pending request created");

        (id.clone(), DappPromise { id, rx, canceled })
    }

    fn take(&self, id: &str) -> Result<PendingRequest<T>, PromiseError> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(id))
            .ok_or_else(|| PromiseError::NotFound(id.to_string()))
    }

    fn settle(&self, id: &str, outcome: Result<T, PromiseError>) -> Result<(), PromiseError> {
        let request = self.take(id)?;
        if request.resolve.send(outcome).is_err() {
            warn!(promise_id = %id, "Pending request resolved after its waiter went away");
        }
        Ok(())
    }

    pub fn resolve(&self, id: &str, value: T) -> Result<(), PromiseError> {
        self.settle(id, Ok(value))
    }

    pub fn reject(&self, id: &str) -> Result<(), PromiseError> {
        self.settle(id, Err(PromiseError::Rejected))
    }

    pub fn cancel(&self, id: &str) -> Result<(), PromiseError> {
        let request = self.take(id)?;
        request.canceled.store(true, Ordering::SeqCst);
        let _ = request.resolve.send(Err(PromiseError::Canceled));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let registry: PromiseRegistry<u32> = PromiseRegistry::new();
        let (id, promise) = registry.create();
        assert_eq!(promise.id(), id);

        registry.resolve(&id, 7).unwrap();
        assert_eq!(registry.resolve(&id, 8), Err(PromiseError::NotFound(id.clone())));
        assert_eq!(promise.wait().await, Ok(7));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_requests_are_independent() {
        let registry: PromiseRegistry<&'static str> = PromiseRegistry::new();
        let (a, first) = registry.create();
        let (b, second) = registry.create();
        assert_ne!(a, b);

        registry.resolve(&b, "second").unwrap();
        registry.reject(&a).unwrap();
        assert_eq!(second.wait().await, Ok("second"));
        assert_eq!(first.wait().await, Err(PromiseError::Rejected));
    }

    #[tokio::test]
    async fn test_cancel_sets_flag() {
        let registry: PromiseRegistry<()> = PromiseRegistry::new();
        let (id, promise) = registry.create();
        registry.cancel(&id).unwrap();
        assert!(promise.is_canceled());
        assert_eq!(promise.wait().await, Err(PromiseError::Canceled));
    }

    #[tokio::test]
    async fn test_dropped_registry_abandons_waiter() {
        let registry: PromiseRegistry<()> = PromiseRegistry::new();
        let (_, promise) = registry.create();
        drop(registry);
        assert_eq!(promise.wait().await, Err(PromiseError::Abandoned));
    }
}
