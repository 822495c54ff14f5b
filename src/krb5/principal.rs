use super::Error;
use std::{fmt, str::FromStr};

pub const NT_PRINCIPAL: i32 = 1;
pub const NT_SRV_INST: i32 = 2;
pub const NT_SRV_HST: i32 = 3;

/// A Kerberos principal name. Derived equality includes the name type; use
/// [`Principal::same_name`] to compare names only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub name_type: i32,
    pub realm: String,
    pub components: Vec<String>,
}

impl Principal {
    #[must_use]
    pub fn new(name_type: i32, realm: impl Into<String>, components: Vec<String>) -> Self {
        Self {
            name_type,
            realm: realm.into(),
            components,
        }
    }

    /// `service/host@REALM`, the form used for downstream service tickets.
    #[must_use]
    pub fn service(service: &str, host: &str, realm: &str) -> Self {
        Self::new(
            NT_SRV_HST,
            realm,
            vec![service.to_string(), host.to_string()],
        )
    }

    /// `krbtgt/REALM@REALM`.
    #[must_use]
    pub fn krbtgt(realm: &str) -> Self {
        Self::new(
            NT_SRV_INST,
            realm,
            vec!["krbtgt".to_string(), realm.to_string()],
        )
    }

    /// First name component, used as the database role for delegated users.
    #[must_use]
    pub fn primary(&self) -> &str {
        self.components.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.components.join("/")
    }

    /// Compare realm and components, ignoring the name type hint.
    #[must_use]
    pub fn same_name(&self, other: &Self) -> bool {
        self.realm == other.realm && self.components == other.components
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), self.realm)
    }
}

impl FromStr for Principal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, realm) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::Config(format!("principal `{s}` has no realm")))?;
        if name.is_empty() || realm.is_empty() {
            return Err(Error::Config(format!("invalid principal `{s}`")));
        }
        let components: Vec<String> = name.split('/').map(str::to_string).collect();
        let name_type = if components.len() > 1 {
            NT_SRV_HST
        } else {
            NT_PRINCIPAL
        };
        Ok(Self::new(name_type, realm, components))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parses_user_and_service_names() {
        let user: Principal = "jdoe@EXAMPLE.COM".parse().unwrap();
        assert_eq!(user.primary(), "jdoe");
        assert_eq!(user.name_type, NT_PRINCIPAL);

        let service: Principal = "HTTP/ipa.example.com@EXAMPLE.COM".parse().unwrap();
        assert_eq!(service, Principal::service("HTTP", "ipa.example.com", "EXAMPLE.COM"));
        assert_eq!(service.to_string(), "HTTP/ipa.example.com@EXAMPLE.COM");
    }

    #[test]
    fn rejects_names_without_realm() {
        assert!("jdoe".parse::<Principal>().is_err());
        assert!("jdoe@".parse::<Principal>().is_err());
    }

    #[test]
    fn krbtgt_names_the_realm_twice() {
        let tgt = Principal::krbtgt("EXAMPLE.COM");
        assert_eq!(tgt.to_string(), "krbtgt/EXAMPLE.COM@EXAMPLE.COM");
        assert!(tgt.same_name(&Principal::new(
            NT_PRINCIPAL,
            "EXAMPLE.COM",
            vec!["krbtgt".into(), "EXAMPLE.COM".into()]
        )));
    }
}
