//! The subset of `krb5.conf` needed to find KDCs: `[libdefaults]
//! default_realm`, `[realms]` kdc entries and `[domain_realm]`.

use super::Error;
use std::{collections::HashMap, path::Path};

const DEFAULT_KDC_PORT: u16 = 88;

#[derive(Debug, Clone, Default)]
pub struct RealmConfig {
    default_realm: Option<String>,
    kdcs: HashMap<String, Vec<String>>,
    domain_realm: Vec<(String, String)>,
}

impl RealmConfig {
    /// Read and parse a krb5.conf file.
    ///
    /// # Errors
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// # Errors
    /// Returns `Error::Config` on unbalanced braces or malformed relations.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut section: Option<String> = None;
        let mut realm: Option<String> = None;
        let mut depth = 0usize;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let lineno = index + 1;
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with("include") || line.starts_with("module") {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                if depth != 0 {
                    return Err(Error::Config(format!(
                        "line {lineno}: section header inside a group"
                    )));
                }
                let name = name.strip_suffix(']').ok_or_else(|| {
                    Error::Config(format!("line {lineno}: unterminated section header"))
                })?;
                section = Some(name.trim().to_ascii_lowercase());
                continue;
            }
            if line.starts_with('}') {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    Error::Config(format!("line {lineno}: unbalanced closing brace"))
                })?;
                if depth == 0 {
                    realm = None;
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "line {lineno}: expected `name = value`"
                )));
            };
            let (key, value) = (key.trim(), value.trim());
            let Some(current) = section.as_deref() else {
                return Err(Error::Config(format!(
                    "line {lineno}: relation outside of a section"
                )));
            };

            if value == "{" {
                depth += 1;
                if current == "realms" && depth == 1 {
                    config.kdcs.entry(key.to_string()).or_default();
                    realm = Some(key.to_string());
                }
                continue;
            }

            match (current, depth) {
                ("libdefaults", 0) if key == "default_realm" => {
                    config.default_realm = Some(value.to_string());
                }
                ("realms", 1) if key == "kdc" => {
                    if let Some(name) = &realm {
                        config
                            .kdcs
                            .entry(name.clone())
                            .or_default()
                            .push(with_default_port(value));
                    }
                }
                ("domain_realm", 0) => {
                    config
                        .domain_realm
                        .push((key.to_ascii_lowercase(), value.to_string()));
                }
                _ => {}
            }
        }

        if depth != 0 {
            return Err(Error::Config("unterminated group".to_string()));
        }
        Ok(config)
    }

    #[must_use]
    pub fn default_realm(&self) -> Option<&str> {
        self.default_realm.as_deref()
    }

    /// Map a host to its realm: exact `[domain_realm]` entries win, then the
    /// longest matching `.domain` suffix, then `default_realm`.
    #[must_use]
    pub fn realm_for_host(&self, host: &str) -> Option<String> {
        let host = host.to_ascii_lowercase();
        if let Some((_, realm)) = self.domain_realm.iter().find(|(key, _)| *key == host) {
            return Some(realm.clone());
        }
        self.domain_realm
            .iter()
            .filter(|(key, _)| key.starts_with('.') && host.ends_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, realm)| realm.clone())
            .or_else(|| self.default_realm.clone())
    }

    /// KDC addresses for `realm` as `host:port`, in configuration order.
    #[must_use]
    pub fn kdcs(&self, realm: &str) -> Vec<String> {
        self.kdcs.get(realm).cloned().unwrap_or_default()
    }
}

fn with_default_port(kdc: &str) -> String {
    let kdc = kdc
        .strip_prefix("tcp/")
        .or_else(|| kdc.strip_prefix("udp/"))
        .unwrap_or(kdc);
    let has_port = if kdc.starts_with('[') {
        !kdc.ends_with(']')
    } else {
        kdc.contains(':')
    };
    if has_port {
        kdc.to_string()
    } else {
        format!("{kdc}:{DEFAULT_KDC_PORT}")
    }
}
