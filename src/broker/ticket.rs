//! Service ticket acquisition and the per-(principal, SPN) memo cache.

use super::{
    BrokerError, CredentialHandle,
    spn::{self, HostResolver, IdentityResolver, ServiceTarget},
};
use crate::krb5::{
    self, Credential, CredentialCache, EncryptionKey, KdcTransport, Principal, RealmConfig,
    TcpTransport, kdc,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tracing::{debug, info, instrument};

/// A service ticket plus the session key needed to authenticate with it.
#[derive(Clone)]
pub struct ServiceTicket {
    pub spn: Principal,
    pub client: Principal,
    pub ticket: Vec<u8>,
    pub key: EncryptionKey,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ServiceTicket {
    #[must_use]
    pub fn from_credential(spn: &Principal, credential: &Credential) -> Self {
        Self {
            spn: spn.clone(),
            client: credential.client.clone(),
            ticket: credential.ticket.clone(),
            key: credential.key.clone(),
            start_time: credential.start_time,
            end_time: credential.end_time,
        }
    }

    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }
}

impl fmt::Debug for ServiceTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTicket")
            .field("spn", &self.spn)
            .field("client", &self.client)
            .field("ticket_len", &self.ticket.len())
            .field("key", &self.key)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .finish()
    }
}

/// Where fresh tickets come from when neither the memo cache nor the
/// delegated cache has one.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn issue(
        &self,
        cache: &CredentialCache,
        spn: &Principal,
        config: &RealmConfig,
    ) -> Result<ServiceTicket, BrokerError>;
}

/// Issues tickets with a TGS exchange against the realm's KDCs.
pub struct KdcTicketSource {
    transport: Arc<dyn KdcTransport>,
}

impl KdcTicketSource {
    #[must_use]
    pub fn new(transport: Arc<dyn KdcTransport>) -> Self {
        Self { transport }
    }

    #[must_use]
    pub fn tcp(timeout: Duration) -> Self {
        Self::new(Arc::new(TcpTransport::new(timeout)))
    }
}

#[async_trait]
impl TicketSource for KdcTicketSource {
    async fn issue(
        &self,
        cache: &CredentialCache,
        spn: &Principal,
        config: &RealmConfig,
    ) -> Result<ServiceTicket, BrokerError> {
        let failed = |source: krb5::Error| BrokerError::TicketIssuanceFailed {
            spn: spn.to_string(),
            source,
        };
        let now = Utc::now();
        let tgt = cache
            .tgt(&spn.realm)
            .ok_or_else(|| failed(krb5::Error::NoTgt(spn.realm.clone())))?;
        if tgt.end_time <= now {
            return Err(failed(krb5::Error::TgtExpired(tgt.end_time)));
        }
        let kdcs = config.kdcs(&spn.realm);
        let issued =
            kdc::request_service_ticket(self.transport.as_ref(), &kdcs, tgt, spn, now)
                .await
                .map_err(failed)?;
        info!(spn = %spn, end_time = %issued.end_time, "service ticket issued");
        Ok(ServiceTicket {
            spn: spn.clone(),
            client: issued.client,
            ticket: issued.ticket,
            key: issued.key,
            start_time: issued.start_time,
            end_time: issued.end_time,
        })
    }
}

type CacheKey = (Principal, Principal);

/// Concurrent reads, serialized writes; validity is checked on every read.
#[derive(Debug, Default)]
pub struct TicketCache {
    entries: RwLock<HashMap<CacheKey, Arc<ServiceTicket>>>,
}

impl TicketCache {
    #[must_use]
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<ServiceTicket>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|ticket| ticket.is_valid_at(now))
            .cloned()
    }

    pub fn insert(&self, key: CacheKey, ticket: Arc<ServiceTicket>, now: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, cached| cached.end_time > now);
        entries.insert(key, ticket);
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A ticket and whether it was served from the memo cache.
#[derive(Debug, Clone)]
pub struct TicketGrant {
    pub ticket: Arc<ServiceTicket>,
    pub memoized: bool,
}

pub struct TicketBroker {
    krb5_config: PathBuf,
    source: Arc<dyn TicketSource>,
    resolver: Arc<dyn HostResolver>,
    cache: TicketCache,
}

impl TicketBroker {
    #[must_use]
    pub fn new(krb5_config: impl Into<PathBuf>, source: Arc<dyn TicketSource>) -> Self {
        Self {
            krb5_config: krb5_config.into(),
            source,
            resolver: Arc::new(IdentityResolver),
            cache: TicketCache::default(),
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Obtain a ticket for `target` on behalf of the handle's principal.
    ///
    /// # Errors
    /// `CredentialUnavailable` when the cache cannot be used, `ConfigInvalid`
    /// when krb5.conf cannot be loaded, `TicketIssuanceFailed` when the KDC
    /// does not issue a ticket.
    #[instrument(skip_all, fields(service = %target.service, host = %target.host))]
    pub async fn get_ticket(
        &self,
        handle: &CredentialHandle,
        target: &ServiceTarget,
    ) -> Result<TicketGrant, BrokerError> {
        let cache = handle.load().await?;
        let now = Utc::now();
        if !cache.has_live_credentials(now) {
            return Err(BrokerError::CredentialUnavailable(format!(
                "no unexpired tickets for {}",
                cache.principal
            )));
        }
        let config = RealmConfig::load(&self.krb5_config)
            .await
            .map_err(|e| BrokerError::ConfigInvalid(e.to_string()))?;
        let spn = spn::resolve(target, self.resolver.as_ref(), &config, &cache.principal.realm)?;
        let key = (cache.principal.clone(), spn.clone());

        if let Some(ticket) = self.cache.get(&key, now) {
            debug!(spn = %spn, "service ticket served from memo cache");
            return Ok(TicketGrant {
                ticket,
                memoized: true,
            });
        }

        let ticket = match cache.find(&spn).filter(|c| c.is_valid_at(now)) {
            Some(credential) => {
                debug!(spn = %spn, "service ticket found in delegated cache");
                ServiceTicket::from_credential(&spn, credential)
            }
            None => self.source.issue(&cache, &spn, &config).await?,
        };
        let ticket = Arc::new(ticket);
        self.cache.insert(key, Arc::clone(&ticket), now);
        Ok(TicketGrant {
            ticket,
            memoized: false,
        })
    }

    /// Drop a memoized ticket, typically after the downstream rejected it.
    pub fn invalidate(&self, principal: &Principal, spn: &Principal) -> bool {
        let removed = self.cache.remove(&(principal.clone(), spn.clone()));
        if removed {
            debug!(principal = %principal, spn = %spn, "memoized ticket invalidated");
        }
        removed
    }

    #[must_use]
    pub fn cached_tickets(&self) -> usize {
        self.cache.len()
    }
}
