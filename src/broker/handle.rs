use super::BrokerError;
use crate::krb5::{CredentialCache, Principal};
use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing::{debug, instrument};

/// Request-scoped pointer to a delegated `FILE:` credential cache.
///
/// The owning principal is learned on the first successful load and pinned
/// for the rest of the request.
#[derive(Debug)]
pub struct CredentialHandle {
    locator: PathBuf,
    principal: OnceLock<Principal>,
}

impl CredentialHandle {
    /// Accepts `FILE:<path>` or a bare absolute path.
    ///
    /// # Errors
    /// Returns `CredentialUnavailable` for empty values, other cache types
    /// (`KEYRING:`, `KCM:`, `MEMORY:`, `DIR:`) or relative paths.
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BrokerError::CredentialUnavailable(
                "empty credential cache locator".to_string(),
            ));
        }
        let path = match raw.split_once(':') {
            Some(("FILE", path)) => path,
            Some((kind, _)) if !kind.contains('/') => {
                return Err(BrokerError::CredentialUnavailable(format!(
                    "unsupported credential cache type `{kind}`"
                )));
            }
            _ => raw,
        };
        let locator = PathBuf::from(path);
        if !locator.is_absolute() {
            return Err(BrokerError::CredentialUnavailable(
                "credential cache path must be absolute".to_string(),
            ));
        }
        Ok(Self {
            locator,
            principal: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn locator(&self) -> &Path {
        &self.locator
    }

    /// The cache owner, known once the cache has been loaded.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.get()
    }

    /// Read and parse the cache.
    ///
    /// # Errors
    /// Returns `CredentialUnavailable` if the file is missing, unreadable,
    /// malformed, or now belongs to a different principal.
    #[instrument(skip(self), fields(locator = %self.locator.display()))]
    pub async fn load(&self) -> Result<CredentialCache, BrokerError> {
        let data = tokio::fs::read(&self.locator).await.map_err(|e| {
            BrokerError::CredentialUnavailable(format!("cannot read credential cache: {e}"))
        })?;
        let cache = CredentialCache::parse(&data)
            .map_err(|e| BrokerError::CredentialUnavailable(e.to_string()))?;

        match self.principal.get() {
            Some(owner) if *owner != cache.principal => {
                return Err(BrokerError::CredentialUnavailable(
                    "credential cache changed owner during the request".to_string(),
                ));
            }
            Some(_) => {}
            None => {
                debug!(principal = %cache.principal, "credential cache loaded");
                let _ = self.principal.set(cache.principal.clone());
            }
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{TempDir, write_cache};

    #[test]
    #[allow(clippy::unwrap_used)]
    fn accepts_file_prefix_and_bare_paths() {
        let prefixed = CredentialHandle::parse("FILE:/tmp/krb5cc_1000").unwrap();
        assert_eq!(prefixed.locator(), Path::new("/tmp/krb5cc_1000"));
        let bare = CredentialHandle::parse(" /tmp/krb5cc_1000 ").unwrap();
        assert_eq!(bare.locator(), Path::new("/tmp/krb5cc_1000"));
        assert!(bare.principal().is_none());
    }

    #[test]
    fn rejects_other_cache_types() {
        for raw in ["KEYRING:persistent:1000", "KCM:1000", "MEMORY:x", "", "krb5cc"] {
            assert!(
                matches!(
                    CredentialHandle::parse(raw),
                    Err(BrokerError::CredentialUnavailable(_))
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn load_pins_the_principal() {
        let dir = TempDir::new();
        let path = write_cache(&dir, "jdoe", chrono::Duration::hours(1));
        let handle = CredentialHandle::parse(&format!("FILE:{}", path.display())).unwrap();
        let cache = handle.load().await.unwrap();
        assert_eq!(cache.principal.primary(), "jdoe");
        assert_eq!(handle.principal().map(Principal::primary), Some("jdoe"));
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn missing_or_garbage_caches_are_unavailable() {
        let dir = TempDir::new();
        let missing = CredentialHandle::parse(&dir.path().join("nope").display().to_string()).unwrap();
        assert!(matches!(
            missing.load().await,
            Err(BrokerError::CredentialUnavailable(_))
        ));

        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, b"definitely not a ccache").unwrap();
        let handle = CredentialHandle::parse(&garbage.display().to_string()).unwrap();
        assert!(matches!(
            handle.load().await,
            Err(BrokerError::CredentialUnavailable(_))
        ));
    }
}
