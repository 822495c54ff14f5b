//! GSS-API Kerberos initiator tokens built from a service ticket.

use super::{BrokerError, ServiceTarget, ServiceTicket};
use crate::krb5::{
    EncryptionKey, Principal,
    messages::{self, KU_AP_REQ_AUTH},
};
use base64ct::{Base64, Encoding};
use chrono::Utc;
use kerberos_asn1::ApReq;
use rand::Rng;
use std::{fmt, ops::BitOr, sync::Arc};

/// RFC 4121 context flags carried in the authenticator checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ProtectionFlags(u32);

impl ProtectionFlags {
    pub const DELEG: Self = Self(1);
    pub const MUTUAL: Self = Self(2);
    pub const REPLAY: Self = Self(4);
    pub const SEQUENCE: Self = Self(8);
    pub const CONF: Self = Self(16);
    pub const INTEG: Self = Self(32);

    /// What the directory adapter asks for.
    pub const DIRECTORY: Self = Self(Self::INTEG.0 | Self::CONF.0);
    /// What the database adapter asks for.
    pub const DATABASE: Self = Self(Self::INTEG.0 | Self::CONF.0 | Self::MUTUAL.0);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProtectionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One serialized initiator token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    bytes: Vec<u8>,
    flags: ProtectionFlags,
}

impl AuthToken {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn flags(&self) -> ProtectionFlags {
        self.flags
    }

    /// The value that follows `Negotiate ` in an Authorization header.
    #[must_use]
    pub fn to_base64(&self) -> String {
        Base64::encode_string(&self.bytes)
    }

    /// Recover the flags a token was built with.
    ///
    /// # Errors
    /// Returns `TokenEncodingFailed` if the token is not a krb5 initiator
    /// token, or the authenticator does not decrypt under `key`.
    pub fn decode_flags(token: &[u8], key: &EncryptionKey) -> Result<ProtectionFlags, BrokerError> {
        let encoding = |e: crate::krb5::Error| BrokerError::TokenEncodingFailed(e.to_string());
        let ap_req: ApReq =
            messages::decode(messages::gss_unwrap(token).map_err(encoding)?).map_err(encoding)?;
        let authenticator =
            messages::open_authenticator(&ap_req, key, KU_AP_REQ_AUTH).map_err(encoding)?;
        let checksum = authenticator.cksum.ok_or_else(|| {
            BrokerError::TokenEncodingFailed("authenticator carries no checksum".to_string())
        })?;
        Ok(ProtectionFlags(messages::gss_flags(&checksum).map_err(encoding)?))
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("len", &self.bytes.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Encode `ticket` and a fresh authenticator into an initiator token.
///
/// # Errors
/// Returns `TokenEncodingFailed` when integrity protection is not requested,
/// the ticket is not a DER ticket, or its session key uses an unsupported
/// enctype.
pub fn build_token(ticket: &ServiceTicket, flags: ProtectionFlags) -> Result<AuthToken, BrokerError> {
    if !flags.contains(ProtectionFlags::INTEG) {
        return Err(BrokerError::TokenEncodingFailed(
            "integrity protection must be requested".to_string(),
        ));
    }
    let authenticator = messages::authenticator(
        &ticket.client,
        Some(messages::gss_checksum(flags.bits())),
        Some(rand::thread_rng().r#gen::<u32>() & 0x3fff_ffff),
        Utc::now(),
    );
    let ap_options = if flags.contains(ProtectionFlags::MUTUAL) {
        messages::AP_OPTION_MUTUAL_REQUIRED
    } else {
        0
    };
    let ap_req = messages::ap_req(
        &ticket.ticket,
        &ticket.key,
        KU_AP_REQ_AUTH,
        &authenticator,
        ap_options,
    )
    .map_err(|e| BrokerError::TokenEncodingFailed(e.to_string()))?;
    Ok(AuthToken {
        bytes: messages::gss_wrap(&ap_req),
        flags,
    })
}

/// The seam a downstream client library calls into when a server asks for
/// GSS authentication.
pub trait GssProvider: Send + Sync {
    /// The first (and only) token for `service/host`.
    ///
    /// # Errors
    /// Returns an error when this provider cannot serve the requested target.
    fn init_token(&self, service: &str, host: &str) -> Result<Vec<u8>, BrokerError>;

    /// Feed a server token back. Returns `(done, next_token)`.
    ///
    /// # Errors
    /// Implementations supporting more rounds may fail here.
    fn continue_with(&self, _peer_token: &[u8]) -> Result<(bool, Option<Vec<u8>>), BrokerError> {
        Ok((true, None))
    }

    /// Whose credentials the tokens assert.
    fn principal(&self) -> &Principal;
}

/// Per-request token source bound to one ticket and one target.
#[derive(Debug, Clone)]
pub struct TokenFactory {
    ticket: Arc<ServiceTicket>,
    target: ServiceTarget,
    flags: ProtectionFlags,
}

impl TokenFactory {
    #[must_use]
    pub fn new(ticket: Arc<ServiceTicket>, target: ServiceTarget, flags: ProtectionFlags) -> Self {
        Self {
            ticket,
            target,
            flags,
        }
    }

    /// # Errors
    /// See [`build_token`].
    pub fn token(&self) -> Result<AuthToken, BrokerError> {
        build_token(&self.ticket, self.flags)
    }

    #[must_use]
    pub fn ticket(&self) -> &ServiceTicket {
        &self.ticket
    }

    fn serves(&self, service: &str, host: &str) -> bool {
        let normalize = |h: &str| h.trim().trim_end_matches('.').to_ascii_lowercase();
        self.target.service == service && normalize(&self.target.host) == normalize(host)
    }
}

impl GssProvider for TokenFactory {
    fn init_token(&self, service: &str, host: &str) -> Result<Vec<u8>, BrokerError> {
        if !self.serves(service, host) {
            return Err(BrokerError::TokenEncodingFailed(format!(
                "token source for {} cannot serve {service}/{host}",
                self.ticket.spn
            )));
        }
        Ok(self.token()?.into_bytes())
    }

    fn principal(&self) -> &Principal {
        &self.ticket.client
    }
}
