//! Process-wide GSS token source consulted by the wire client when a server
//! asks for GSS authentication.

use crate::broker::GssProvider;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::trace;

struct Registration {
    request_id: String,
    provider: Arc<dyn GssProvider>,
}

#[derive(Default)]
pub struct TokenSourceRegistry {
    current: RwLock<Option<Registration>>,
}

static GLOBAL: OnceLock<Arc<TokenSourceRegistry>> = OnceLock::new();

impl TokenSourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every connection in this process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    pub fn register(&self, request_id: &str, provider: Arc<dyn GssProvider>) {
        trace!(request_id, principal = %provider.principal(), "token source registered");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Registration {
            request_id: request_id.to_string(),
            provider,
        });
    }

    /// Remove the registration if it still belongs to `request_id`.
    pub fn clear(&self, request_id: &str) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current
            .as_ref()
            .is_some_and(|registration| registration.request_id == request_id)
        {
            *current = None;
            trace!(request_id, "token source cleared");
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn GssProvider>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|registration| Arc::clone(&registration.provider))
    }

    #[must_use]
    pub fn current_request(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|registration| registration.request_id.clone())
    }
}

impl std::fmt::Debug for TokenSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSourceRegistry")
            .field("current_request", &self.current_request())
            .finish()
    }
}
