//! Per-request entry point: handle, ticket, token, handshake, downstream call.

use super::{
    BrokerError, CredentialHandle, GssProvider, IsolationManager, ProtectionFlags, ServiceTarget,
    TicketBroker, TicketGrant, TokenFactory, build_token,
};
use crate::{
    directory::NegotiateAdapter,
    pgwire::{PgValue, Row, WireGssAdapter},
};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;
use utoipa::ToSchema;

const IDENTITY_QUERY: &str = "select current_user, session_user, now()";

/// Who the database thinks we are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DbIdentity {
    pub current_user: String,
    pub session_user: String,
    #[schema(value_type = String, format = DateTime)]
    pub timestamp: DateTime<FixedOffset>,
}

impl DbIdentity {
    fn from_row(row: &Row) -> Result<Self, BrokerError> {
        let text = |name: &str| {
            row.get(name)
                .and_then(PgValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    BrokerError::DownstreamTransportError(format!(
                        "identity query returned no `{name}` column"
                    ))
                })
        };
        Ok(Self {
            current_user: text("current_user")?,
            session_user: text("session_user")?,
            timestamp: row
                .get("now")
                .and_then(PgValue::as_timestamp)
                .ok_or_else(|| {
                    BrokerError::DownstreamTransportError(
                        "identity query returned no timestamp".to_string(),
                    )
                })?,
        })
    }
}

/// Stateless across requests; everything request-scoped lives on the stack
/// of one call.
///
/// Retry rules: ticket issuance is retried once on a network failure. A
/// downstream authentication rejection always evicts the ticket from the
/// memo cache; the request is re-entered once only if that ticket was
/// memoized.
pub struct RequestOrchestrator {
    broker: Arc<TicketBroker>,
    isolation: Arc<IsolationManager>,
    directory: NegotiateAdapter,
    database: WireGssAdapter,
}

impl RequestOrchestrator {
    #[must_use]
    pub fn new(
        broker: Arc<TicketBroker>,
        isolation: Arc<IsolationManager>,
        directory: NegotiateAdapter,
        database: WireGssAdapter,
    ) -> Self {
        Self {
            broker,
            isolation,
            directory,
            database,
        }
    }

    #[must_use]
    pub fn broker(&self) -> &TicketBroker {
        &self.broker
    }

    #[must_use]
    pub fn isolation(&self) -> &IsolationManager {
        &self.isolation
    }

    /// Fetch a ticket, retrying once when the KDC was unreachable.
    async fn ticket(
        &self,
        handle: &CredentialHandle,
        target: &ServiceTarget,
        deadline: Instant,
    ) -> Result<TicketGrant, BrokerError> {
        let attempt = || timeout_at(deadline, self.broker.get_ticket(handle, target));
        match attempt().await.map_err(|_| BrokerError::DeadlineExceeded)? {
            Err(err) if err.is_transient() => {
                warn!("ticket issuance failed, retrying once: {err}");
                attempt().await.map_err(|_| BrokerError::DeadlineExceeded)?
            }
            other => other,
        }
    }

    /// Drop a ticket the downstream service rejected and report whether the
    /// request should be re-entered with a fresh one.
    ///
    /// A rejected ticket never survives in the cache. Only memoized grants
    /// are retried, and only once per request.
    fn should_reissue(&self, err: &BrokerError, grant: &TicketGrant, reentered: bool) -> bool {
        if !matches!(err, BrokerError::DownstreamAuthRejected(_)) {
            return false;
        }
        self.broker.invalidate(&grant.ticket.client, &grant.ticket.spn);
        if reentered || !grant.memoized {
            return false;
        }
        info!(spn = %grant.ticket.spn, "memoized ticket rejected, retrying with a fresh one");
        true
    }

    /// Look `uid` up in the directory as the handle's principal.
    ///
    /// # Errors
    /// Any [`BrokerError`]; see the retry rules on [`RequestOrchestrator`].
    #[instrument(skip(self, handle, deadline), fields(locator = %handle.locator().display()))]
    pub async fn user_show(
        &self,
        handle: &CredentialHandle,
        uid: &str,
        deadline: Instant,
    ) -> Result<Map<String, Value>, BrokerError> {
        let target = self.directory.target();
        let mut reentered = false;
        loop {
            let grant = self.ticket(handle, &target, deadline).await?;
            let token = build_token(&grant.ticket, ProtectionFlags::DIRECTORY)?;
            let login = timeout_at(deadline, self.directory.authenticate(&token))
                .await
                .map_err(|_| BrokerError::DeadlineExceeded)?;
            match login {
                Ok(cookie) => {
                    debug!(principal = %grant.ticket.client, "directory session ready");
                    return timeout_at(deadline, self.directory.user_show(&cookie, uid))
                        .await
                        .map_err(|_| BrokerError::DeadlineExceeded)?;
                }
                Err(err) if self.should_reissue(&err, &grant, reentered) => reentered = true,
                Err(err) => return Err(err),
            }
        }
    }

    /// Run the identity query on a fresh connection as the handle's
    /// principal.
    ///
    /// # Errors
    /// Any [`BrokerError`]; see the retry rules on [`RequestOrchestrator`].
    #[instrument(skip(self, handle, deadline), fields(locator = %handle.locator().display()))]
    pub async fn session_identity(
        &self,
        handle: &CredentialHandle,
        deadline: Instant,
    ) -> Result<Vec<DbIdentity>, BrokerError> {
        let target = self.database.params().target();
        let mut reentered = false;
        loop {
            let grant = self.ticket(handle, &target, deadline).await?;
            let user = grant.ticket.client.primary().to_string();
            let factory: Arc<dyn GssProvider> = Arc::new(TokenFactory::new(
                Arc::clone(&grant.ticket),
                target.clone(),
                ProtectionFlags::DATABASE,
            ));
            let request_id = Ulid::new().to_string();
            let registry = self.isolation.registry();
            let handshake = self
                .isolation
                .with_exclusive_slot(&request_id, factory, deadline, || {
                    self.database.authenticate(&user, registry)
                })
                .await;

            match handshake {
                Ok(mut conn) => {
                    // the slot is already released; the query runs in parallel
                    let rows = timeout_at(deadline, async move {
                        let rows = conn.execute(IDENTITY_QUERY, &[]).await?;
                        if let Err(err) = conn.close().await {
                            debug!("closing database connection failed: {err}");
                        }
                        Ok::<_, BrokerError>(rows)
                    })
                    .await
                    .map_err(|_| BrokerError::DeadlineExceeded)??;
                    return rows.iter().map(DbIdentity::from_row).collect();
                }
                Err(err) if self.should_reissue(&err, &grant, reentered) => reentered = true,
                Err(err) => return Err(err),
            }
        }
    }
}
