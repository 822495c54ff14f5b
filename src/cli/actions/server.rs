use crate::{
    api::{self, ApiState},
    broker::{IsolationManager, KdcTicketSource, RequestOrchestrator, TicketBroker},
    directory::NegotiateAdapter,
    krb5::RealmConfig,
    pgwire::{ConnectParams, TokenSourceRegistry, WireGssAdapter},
};
use anyhow::{Context, Result};
use axum::http::HeaderName;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub directory_url: String,
    pub pg_dsn: String,
    pub pg_ca_bundle: Option<PathBuf>,
    pub krb5_config: PathBuf,
    pub keytab: Option<PathBuf>,
    pub ccache_header: HeaderName,
    pub request_timeout: Duration,
    pub slot_timeout: Duration,
    pub kdc_timeout: Duration,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the Kerberos configuration, keytab, directory URL or
/// DSN is unusable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let realms = RealmConfig::load(&args.krb5_config).await.with_context(|| {
        format!(
            "Could not load Kerberos configuration from {}",
            args.krb5_config.display()
        )
    })?;
    debug!(
        "Default realm: {}",
        realms.default_realm().unwrap_or("none")
    );

    if let Some(keytab) = &args.keytab {
        tokio::fs::File::open(keytab)
            .await
            .with_context(|| format!("Keytab {} is not readable", keytab.display()))?;
    }

    let broker = Arc::new(TicketBroker::new(
        args.krb5_config.clone(),
        Arc::new(KdcTicketSource::tcp(args.kdc_timeout)),
    ));
    let isolation = Arc::new(IsolationManager::new(
        TokenSourceRegistry::global(),
        args.slot_timeout,
    ));
    let directory = NegotiateAdapter::new(&args.directory_url, args.request_timeout)
        .context("Invalid directory URL")?;
    let params = ConnectParams::from_dsn(&args.pg_dsn)
        .context("Invalid PostgreSQL DSN")?
        .with_ca_bundle(args.pg_ca_bundle.clone());
    let database =
        WireGssAdapter::new(params).context("Could not prepare the PostgreSQL TLS client")?;

    let state = ApiState {
        orchestrator: Arc::new(RequestOrchestrator::new(
            broker, isolation, directory, database,
        )),
        ccache_header: args.ccache_header,
        request_timeout: args.request_timeout,
    };

    api::new(args.port, state).await
}

fn log_startup_args(args: &Args) {
    let path_or = |path: Option<&PathBuf>, fallback: &str| {
        path.map_or_else(|| fallback.to_string(), |p| p.display().to_string())
    };
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("directory_url", args.directory_url.clone()),
        ("pg_dsn", redact_dsn(&args.pg_dsn)),
        ("pg_ca_bundle", path_or(args.pg_ca_bundle.as_ref(), "native roots")),
        ("krb5_config", args.krb5_config.display().to_string()),
        ("keytab", path_or(args.keytab.as_ref(), "none")),
        ("ccache_header", args.ccache_header.to_string()),
        ("request_timeout", format!("{}s", args.request_timeout.as_secs())),
        ("slot_timeout", format!("{}s", args.slot_timeout.as_secs())),
        ("kdc_timeout", format!("{}s", args.kdc_timeout.as_secs())),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", kdelegate_banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn kdelegate_banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    KDELEGATE_BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.chars().take(7).collect()
}

const KDELEGATE_BANNER: &str = r"
    .--.
   /.-. '----------.
   \'-' .--'--''-'-'   K D E L E G A T E {VERSION}
    '--'";
