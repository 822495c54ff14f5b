use super::BrokerError;
use crate::krb5::{Principal, RealmConfig};

/// A downstream service as addressed by the caller, before canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTarget {
    pub service: String,
    pub host: String,
}

impl ServiceTarget {
    #[must_use]
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
        }
    }
}

/// Turns the host a caller dialed into the host part of the SPN.
pub trait HostResolver: Send + Sync {
    fn canonicalize(&self, host: &str) -> String;
}

/// Lowercase, trim, drop a trailing dot. No DNS lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl HostResolver for IdentityResolver {
    fn canonicalize(&self, host: &str) -> String {
        host.trim().trim_end_matches('.').to_ascii_lowercase()
    }
}

/// Build `service/host@REALM`, taking the realm from `[domain_realm]`, then
/// `default_realm`, then the client's own realm.
///
/// # Errors
/// Returns `ConfigInvalid` when the service or host is empty.
pub fn resolve(
    target: &ServiceTarget,
    resolver: &dyn HostResolver,
    config: &RealmConfig,
    client_realm: &str,
) -> Result<Principal, BrokerError> {
    let host = resolver.canonicalize(&target.host);
    if host.is_empty() || target.service.trim().is_empty() {
        return Err(BrokerError::ConfigInvalid(format!(
            "cannot form a service principal from `{}/{}`",
            target.service, target.host
        )));
    }
    let realm = config
        .realm_for_host(&host)
        .unwrap_or_else(|| client_realm.to_string());
    Ok(Principal::service(target.service.trim(), &host, &realm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_resolver_normalizes() {
        assert_eq!(
            IdentityResolver.canonicalize("  IPA.Example.COM. "),
            "ipa.example.com"
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn realm_falls_back_to_the_client() {
        let spn = resolve(
            &ServiceTarget::new("postgres", "DB.example.com."),
            &IdentityResolver,
            &RealmConfig::default(),
            "EXAMPLE.COM",
        )
        .unwrap();
        assert_eq!(spn.to_string(), "postgres/db.example.com@EXAMPLE.COM");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn domain_realm_wins() {
        let config =
            RealmConfig::parse("[domain_realm]\n .corp.test = CORP.TEST\n").unwrap();
        let spn = resolve(
            &ServiceTarget::new("HTTP", "ipa.corp.test"),
            &IdentityResolver,
            &config,
            "EXAMPLE.COM",
        )
        .unwrap();
        assert_eq!(spn.realm, "CORP.TEST");
    }

    #[test]
    fn empty_hosts_are_rejected() {
        assert!(matches!(
            resolve(
                &ServiceTarget::new("HTTP", " . "),
                &IdentityResolver,
                &RealmConfig::default(),
                "EXAMPLE.COM"
            ),
            Err(BrokerError::ConfigInvalid(_))
        ));
    }
}
