use crate::broker::{BrokerError, ServiceTarget};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use url::Url;

const DEFAULT_KRBSRVNAME: &str = "postgres";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to reach the database. The user is never taken from the
/// DSN; it is always the delegated principal's primary name.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub ssl_mode: PgSslMode,
    pub krbsrvname: String,
    pub ca_bundle: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl ConnectParams {
    /// Parse a `postgres://` URL. `sslmode`, `sslrootcert`, `krbsrvname` and
    /// `connect_timeout` (seconds) are read from the query string.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` when the DSN is not a usable PostgreSQL URL.
    pub fn from_dsn(dsn: &str) -> Result<Self, BrokerError> {
        let invalid = |e: &dyn fmt::Display| BrokerError::ConfigInvalid(format!("invalid database DSN: {e}"));
        let url = Url::parse(dsn).map_err(|e| invalid(&e))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(invalid(&format!("unsupported scheme `{}`", url.scheme())));
        }
        let options = PgConnectOptions::from_str(dsn).map_err(|e| invalid(&e))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid(&"missing host"));
        }

        let mut krbsrvname = DEFAULT_KRBSRVNAME.to_string();
        let mut ca_bundle = None;
        let mut connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "krbsrvname" if !value.is_empty() => krbsrvname = value.into_owned(),
                "sslrootcert" if !value.is_empty() => ca_bundle = Some(PathBuf::from(value.as_ref())),
                "connect_timeout" => {
                    let secs: u64 = value.parse().map_err(|e| invalid(&e))?;
                    connect_timeout = Duration::from_secs(secs.max(1));
                }
                _ => {}
            }
        }

        Ok(Self {
            host: options.get_host().to_string(),
            port: options.get_port(),
            database: options.get_database().map(str::to_string),
            ssl_mode: options.get_ssl_mode(),
            krbsrvname,
            ca_bundle,
            connect_timeout,
        })
    }

    /// A CA bundle given on the command line wins over `sslrootcert`.
    #[must_use]
    pub fn with_ca_bundle(mut self, ca_bundle: Option<PathBuf>) -> Self {
        if ca_bundle.is_some() {
            self.ca_bundle = ca_bundle;
        }
        self
    }

    /// The service the database authenticates as: `krbsrvname/host`.
    #[must_use]
    pub fn target(&self) -> ServiceTarget {
        ServiceTarget::new(&self.krbsrvname, &self.host)
    }

    pub(crate) fn requires_tls(&self) -> bool {
        matches!(
            self.ssl_mode,
            PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull
        )
    }

    pub(crate) fn attempts_tls(&self) -> bool {
        !matches!(self.ssl_mode, PgSslMode::Disable | PgSslMode::Allow)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("krbsrvname", &self.krbsrvname)
            .field("ca_bundle", &self.ca_bundle)
            .finish_non_exhaustive()
    }
}
