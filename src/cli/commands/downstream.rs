use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("directory-url")
                .long("directory-url")
                .help("FreeIPA base URL, e.g. https://ipa.example.com")
                .long_help(
                    "FreeIPA base URL. Its host forms the directory service principal \
                     HTTP/<host>.",
                )
                .env("KDELEGATE_DIRECTORY_URL")
                .required(true),
        )
        .arg(
            Arg::new("pg-dsn")
                .long("pg-dsn")
                .help("PostgreSQL connection URL")
                .long_help(
                    "PostgreSQL connection URL (host, port, database, sslmode, krbsrvname, \
                     sslrootcert). The user is always the delegated principal, so none is \
                     needed in the DSN.",
                )
                .env("KDELEGATE_PG_DSN")
                .required(true),
        )
        .arg(
            Arg::new("pg-ca-bundle")
                .long("pg-ca-bundle")
                .help("PEM bundle of CAs trusted for the PostgreSQL TLS handshake")
                .env("KDELEGATE_PG_CA_BUNDLE"),
        )
        .arg(
            Arg::new("slot-timeout-seconds")
                .long("slot-timeout-seconds")
                .help("How long a request may wait for the exclusive handshake slot")
                .default_value("5")
                .env("KDELEGATE_SLOT_TIMEOUT_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
