//! # kdelegate (Delegated Kerberos credential broker)
//!
//! `kdelegate` sits behind an SSO front end that has already authenticated
//! the user and stored their delegated credentials in a per-request
//! credential cache. For each request it reads that cache, obtains service
//! tickets from the KDC with the delegated TGT and calls downstream services
//! as the user:
//!
//! - **Directory:** FreeIPA JSON-RPC, authenticated with HTTP Negotiate and
//!   an `ipa_session` cookie.
//! - **Database:** PostgreSQL, authenticated with GSSAPI on the wire protocol.
//!
//! ## Isolation
//!
//! The PostgreSQL handshake draws its token from one process-wide
//! registration point. Requests take turns on an exclusive slot around the
//! register, handshake, unregister window so a connection can never be
//! opened with another request's credentials. Everything else (ticket
//! issuance, directory calls, queries after authentication) runs in
//! parallel.
//!
//! ## Ticket memoization
//!
//! Service tickets are cached per (principal, service principal) until they
//! expire. A cached ticket that the downstream rejects is dropped and the
//! request is retried once with a freshly issued one.

pub mod api;
pub mod broker;
pub mod cli;
pub mod directory;
pub mod krb5;
pub mod pgwire;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
