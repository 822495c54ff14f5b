use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed Kerberos message: {0}")]
    Asn1(String),
    #[error("credential cache: {0}")]
    CCache(String),
    #[error("krb5.conf: {0}")]
    Config(String),
    #[error("unsupported encryption type {0}")]
    UnsupportedEtype(i32),
    #[error("cipher unavailable: {0}")]
    Crypto(String),
    #[error("invalid key length")]
    KeyLength,
    #[error("ciphertext too short")]
    ShortCiphertext,
    #[error("integrity check failed")]
    Integrity,
    #[error("no ticket-granting ticket for realm {0}")]
    NoTgt(String),
    #[error("ticket-granting ticket expired at {0}")]
    TgtExpired(DateTime<Utc>),
    #[error("no KDC configured for realm {0}")]
    NoKdc(String),
    #[error("unable to reach a KDC for realm {realm}: {source}")]
    Network {
        realm: String,
        #[source]
        source: std::io::Error,
    },
    #[error("KDC returned {name} ({code}): {text}")]
    Kdc {
        code: i32,
        name: &'static str,
        text: String,
    },
    #[error("unexpected KDC reply: {0}")]
    Protocol(String),
}

impl Error {
    /// Failures worth one more attempt: the KDC could not be reached, or it
    /// answered with a generic/try-later error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Kdc { code, .. } => matches!(*code, KRB_ERR_GENERIC | KDC_ERR_SVC_UNAVAILABLE),
            _ => false,
        }
    }

    pub(crate) fn asn1(err: impl std::fmt::Debug) -> Self {
        Self::Asn1(format!("{err:?}"))
    }

    pub(crate) fn kdc(code: i32, text: Option<String>) -> Self {
        Self::Kdc {
            code,
            name: kdc_error_name(code),
            text: text.unwrap_or_else(|| "no details".to_string()),
        }
    }
}

const KRB_ERR_GENERIC: i32 = 60;
const KDC_ERR_SVC_UNAVAILABLE: i32 = 29;

fn kdc_error_name(code: i32) -> &'static str {
    match code {
        6 => "KDC_ERR_C_PRINCIPAL_UNKNOWN",
        7 => "KDC_ERR_S_PRINCIPAL_UNKNOWN",
        12 => "KDC_ERR_POLICY",
        14 => "KDC_ERR_ETYPE_NOSUPP",
        18 => "KDC_ERR_CLIENT_REVOKED",
        20 => "KDC_ERR_TGT_REVOKED",
        KDC_ERR_SVC_UNAVAILABLE => "KDC_ERR_SVC_UNAVAILABLE",
        31 => "KRB_AP_ERR_BAD_INTEGRITY",
        32 => "KRB_AP_ERR_TKT_EXPIRED",
        33 => "KRB_AP_ERR_TKT_NYV",
        34 => "KRB_AP_ERR_REPEAT",
        37 => "KRB_AP_ERR_SKEW",
        41 => "KRB_AP_ERR_MODIFIED",
        KRB_ERR_GENERIC => "KRB_ERR_GENERIC",
        68 => "KDC_ERR_WRONG_REALM",
        _ => "KRB_ERR_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdc_error_display_names_the_code() {
        let err = Error::kdc(7, Some("Server not found in Kerberos database".to_string()));
        assert_eq!(
            err.to_string(),
            "KDC returned KDC_ERR_S_PRINCIPAL_UNKNOWN (7): Server not found in Kerberos database"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn network_and_generic_errors_are_transient() {
        let network = Error::Network {
            realm: "EXAMPLE.COM".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        };
        assert!(network.is_transient());
        assert!(Error::kdc(60, None).is_transient());
        assert!(!Error::kdc(37, None).is_transient());
    }
}
