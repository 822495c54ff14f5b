use crate::cli::{
    actions::{Action, server::Args},
    commands::kerberos::DEFAULT_KRB5_CONFIG,
};
use anyhow::{Context, Result};
use axum::http::HeaderName;
use std::{env, path::PathBuf, time::Duration};

fn seconds(matches: &clap::ArgMatches, id: &str, default: u64) -> Duration {
    Duration::from_secs(matches.get_one::<u64>(id).copied().unwrap_or(default))
}

/// Explicit argument first, then the legacy variable.
fn path_or_env(matches: &clap::ArgMatches, id: &str, fallback_var: &str) -> Option<PathBuf> {
    matches
        .get_one::<String>(id)
        .cloned()
        .or_else(|| env::var(fallback_var).ok().filter(|value| !value.is_empty()))
        .map(PathBuf::from)
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(9080);

    let directory_url = matches
        .get_one::<String>("directory-url")
        .cloned()
        .context("missing required argument: --directory-url")?;

    let pg_dsn = matches
        .get_one::<String>("pg-dsn")
        .cloned()
        .context("missing required argument: --pg-dsn")?;

    let ccache_header = matches
        .get_one::<String>("ccache-header")
        .map_or("X_krb5ccname", String::as_str);
    let ccache_header = HeaderName::from_bytes(ccache_header.as_bytes())
        .with_context(|| format!("invalid --ccache-header: {ccache_header}"))?;

    let krb5_config = path_or_env(matches, "krb5-config", "KRB5_CONFIG_PATH")
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KRB5_CONFIG));

    Ok(Action::Server(Args {
        port,
        directory_url,
        pg_dsn,
        pg_ca_bundle: matches.get_one::<String>("pg-ca-bundle").map(PathBuf::from),
        krb5_config,
        keytab: path_or_env(matches, "keytab", "KRB5_KEYTAB_PATH"),
        ccache_header,
        request_timeout: seconds(matches, "request-timeout-seconds", 8),
        slot_timeout: seconds(matches, "slot-timeout-seconds", 5),
        kdc_timeout: seconds(matches, "kdc-timeout-seconds", 5),
    }))
}
