//! Serializes use of the process-wide token source so that exactly one
//! request's factory is visible at a time.

use super::{BrokerError, GssProvider};
use crate::pgwire::TokenSourceRegistry;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::{Instant, timeout_at},
};
use tracing::{debug, instrument, warn};

#[derive(Debug)]
pub struct IsolationManager {
    registry: Arc<TokenSourceRegistry>,
    lease: Mutex<()>,
    slot_timeout: Duration,
}

/// Proof that the registry currently points at one request's factory.
/// Dropping it unregisters the factory, then releases the lease.
#[derive(Debug)]
pub struct ExclusiveSlot<'a> {
    registry: &'a TokenSourceRegistry,
    request_id: String,
    _lease: MutexGuard<'a, ()>,
}

impl Drop for ExclusiveSlot<'_> {
    fn drop(&mut self) {
        self.registry.clear(&self.request_id);
        debug!(request_id = %self.request_id, "exclusive slot released");
    }
}

impl IsolationManager {
    #[must_use]
    pub fn new(registry: Arc<TokenSourceRegistry>, slot_timeout: Duration) -> Self {
        Self {
            registry,
            lease: Mutex::new(()),
            slot_timeout,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TokenSourceRegistry> {
        &self.registry
    }

    /// True when no slot is held.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.lease.try_lock().is_ok()
    }

    /// Wait for the lease and register `factory`.
    ///
    /// # Errors
    /// `DeadlineExceeded` when the request deadline passes first,
    /// `SlotAcquireTimeout` when the slot timeout does.
    pub async fn acquire(
        &self,
        request_id: &str,
        factory: Arc<dyn GssProvider>,
        deadline: Instant,
    ) -> Result<ExclusiveSlot<'_>, BrokerError> {
        let slot_deadline = Instant::now() + self.slot_timeout;
        let lease = match timeout_at(deadline.min(slot_deadline), self.lease.lock()).await {
            Ok(lease) => lease,
            Err(_) if deadline <= slot_deadline => {
                warn!(request_id, "request deadline passed while waiting for the slot");
                return Err(BrokerError::DeadlineExceeded);
            }
            Err(_) => {
                warn!(request_id, "slot not acquired in time");
                return Err(BrokerError::SlotAcquireTimeout(self.slot_timeout));
            }
        };
        self.registry.register(request_id, factory);
        debug!(request_id, "exclusive slot acquired");
        Ok(ExclusiveSlot {
            registry: &self.registry,
            request_id: request_id.to_string(),
            _lease: lease,
        })
    }

    /// Run `body` while `factory` is the registered token source.
    ///
    /// # Errors
    /// Propagates `body`'s error, or `DeadlineExceeded` / `SlotAcquireTimeout`.
    #[instrument(skip(self, factory, body))]
    pub async fn with_exclusive_slot<T, F, Fut>(
        &self,
        request_id: &str,
        factory: Arc<dyn GssProvider>,
        deadline: Instant,
        body: F,
    ) -> Result<T, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let _slot = self.acquire(request_id, factory, deadline).await?;
        timeout_at(deadline, body())
            .await
            .map_err(|_| BrokerError::DeadlineExceeded)?
    }
}
