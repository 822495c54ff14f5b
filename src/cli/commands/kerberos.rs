use clap::{Arg, Command};

pub const DEFAULT_KRB5_CONFIG: &str = "/etc/krb5.conf";
pub const DEFAULT_CCACHE_HEADER: &str = "X_krb5ccname";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("krb5-config")
                .long("krb5-config")
                .help("Path to krb5.conf")
                .long_help(
                    "Path to krb5.conf (default realm, KDC list, domain_realm). \
                     Falls back to KRB5_CONFIG_PATH, then /etc/krb5.conf.",
                )
                .env("KDELEGATE_KRB5_CONFIG"),
        )
        .arg(
            Arg::new("keytab")
                .long("keytab")
                .help("Service keytab used by the inbound SSO layer")
                .long_help(
                    "Service keytab used by the inbound SSO layer. Only checked for \
                     readability at startup. Falls back to KRB5_KEYTAB_PATH.",
                )
                .env("KDELEGATE_KEYTAB"),
        )
        .arg(
            Arg::new("ccache-header")
                .long("ccache-header")
                .help("Request header carrying the delegated credential cache")
                .default_value(DEFAULT_CCACHE_HEADER)
                .env("KDELEGATE_CCACHE_HEADER"),
        )
        .arg(
            Arg::new("kdc-timeout-seconds")
                .long("kdc-timeout-seconds")
                .help("Per-KDC connect and read timeout")
                .default_value("5")
                .env("KDELEGATE_KDC_TIMEOUT_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
