//! MIT `FILE:` credential caches (format version 4), read through
//! `kerberos_ccache` and mapped onto our principal and key types.

use super::{EncryptionKey, Error, Principal};
use chrono::{DateTime, Utc};
use kerberos_ccache::{CCache, CountedOctetString};

const VERSION_4: u16 = 0x0504;
const CONFIG_REALM: &str = "X-CACHECONF:";

/// One cached ticket together with its session key.
#[derive(Debug, Clone)]
pub struct Credential {
    pub client: Principal,
    pub server: Principal,
    pub key: EncryptionKey,
    pub auth_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub renew_till: Option<DateTime<Utc>>,
    pub flags: u32,
    pub ticket: Vec<u8>,
}

impl Credential {
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.end_time
    }

    fn from_cached(cached: &kerberos_ccache::Credential) -> Result<Self, Error> {
        let auth_time = timestamp(cached.time.authtime)?;
        let start_time = match cached.time.starttime {
            // valid from issuance
            0 => auth_time,
            secs => timestamp(secs)?,
        };
        Ok(Self {
            client: principal(&cached.client)?,
            server: principal(&cached.server)?,
            key: EncryptionKey::new(i32::from(cached.key.keytype), cached.key.keyvalue.clone()),
            auth_time,
            start_time,
            end_time: timestamp(cached.time.endtime)?,
            renew_till: match cached.time.renew_till {
                0 => None,
                secs => Some(timestamp(secs)?),
            },
            flags: cached.tktflags,
            ticket: cached.ticket.data.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CredentialCache {
    pub principal: Principal,
    pub credentials: Vec<Credential>,
}

impl CredentialCache {
    /// Parse the raw bytes of a credential cache file.
    ///
    /// # Errors
    /// Returns `Error::CCache` when the file is truncated, uses an unsupported
    /// format version, or holds non UTF-8 names.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        match data.get(..2) {
            Some(&[major, minor]) if u16::from_be_bytes([major, minor]) == VERSION_4 => {}
            Some(&[major, minor]) => {
                return Err(Error::CCache(format!(
                    "unsupported format version {:#06x}",
                    u16::from_be_bytes([major, minor])
                )));
            }
            _ => return Err(Error::CCache("truncated file".to_string())),
        }
        let (rest, cache) =
            CCache::parse(data).map_err(|e| Error::CCache(format!("{e:?}")))?;
        if !rest.is_empty() {
            return Err(Error::CCache(format!(
                "{} unreadable trailing bytes",
                rest.len()
            )));
        }

        let mut credentials = Vec::with_capacity(cache.credentials.len());
        for cached in &cache.credentials {
            let credential = Credential::from_cached(cached)?;
            if credential.server.realm != CONFIG_REALM {
                credentials.push(credential);
            }
        }
        Ok(Self {
            principal: principal(&cache.primary_principal)?,
            credentials,
        })
    }

    /// The cached ticket-granting ticket for `realm`, if any.
    #[must_use]
    pub fn tgt(&self, realm: &str) -> Option<&Credential> {
        self.find(&Principal::krbtgt(realm))
    }

    #[must_use]
    pub fn find(&self, server: &Principal) -> Option<&Credential> {
        self.credentials
            .iter()
            .find(|credential| credential.server.same_name(server))
    }

    /// True when at least one ticket is usable at `now`.
    #[must_use]
    pub fn has_live_credentials(&self, now: DateTime<Utc>) -> bool {
        self.credentials.iter().any(|c| c.is_valid_at(now))
    }
}

fn text(counted: &CountedOctetString) -> Result<String, Error> {
    String::from_utf8(counted.data.clone())
        .map_err(|_| Error::CCache("name is not valid UTF-8".to_string()))
}

fn principal(cached: &kerberos_ccache::Principal) -> Result<Principal, Error> {
    let components = cached
        .components
        .iter()
        .map(text)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Principal::new(
        i32::from_be_bytes(cached.name_type.to_be_bytes()),
        text(&cached.realm)?,
        components,
    ))
}

fn timestamp(secs: u32) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp(i64::from(secs), 0)
        .ok_or_else(|| Error::CCache(format!("invalid timestamp {secs}")))
}

/// Encoder used by tests to fabricate delegated caches.
#[cfg(test)]
pub(crate) mod testing {
    use super::{Credential, CredentialCache, VERSION_4};
    use crate::krb5::Principal;
    use chrono::{DateTime, Utc};

    fn put_data(out: &mut Vec<u8>, data: &[u8]) {
        out.extend_from_slice(&u32::try_from(data.len()).unwrap_or(u32::MAX).to_be_bytes());
        out.extend_from_slice(data);
    }

    fn put_principal(out: &mut Vec<u8>, principal: &Principal) {
        out.extend_from_slice(&principal.name_type.to_be_bytes());
        out.extend_from_slice(
            &u32::try_from(principal.components.len())
                .unwrap_or(u32::MAX)
                .to_be_bytes(),
        );
        put_data(out, principal.realm.as_bytes());
        for component in &principal.components {
            put_data(out, component.as_bytes());
        }
    }

    fn put_time(out: &mut Vec<u8>, at: Option<DateTime<Utc>>) {
        let secs = at.map_or(0, |t| u32::try_from(t.timestamp()).unwrap_or(0));
        out.extend_from_slice(&secs.to_be_bytes());
    }

    #[must_use]
    pub(crate) fn encode(cache: &CredentialCache) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&VERSION_4.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        put_principal(&mut out, &cache.principal);
        for credential in &cache.credentials {
            put_credential(&mut out, credential);
        }
        out
    }

    fn put_credential(out: &mut Vec<u8>, credential: &Credential) {
        put_principal(out, &credential.client);
        put_principal(out, &credential.server);
        out.extend_from_slice(
            &u16::try_from(credential.key.etype)
                .unwrap_or(0)
                .to_be_bytes(),
        );
        put_data(out, credential.key.value());
        put_time(out, Some(credential.auth_time));
        put_time(out, Some(credential.start_time));
        put_time(out, Some(credential.end_time));
        put_time(out, credential.renew_till);
        out.push(0);
        out.extend_from_slice(&credential.flags.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        put_data(out, &credential.ticket);
        put_data(out, &[]);
    }
}
