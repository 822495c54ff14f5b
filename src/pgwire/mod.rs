//! A pool-free PostgreSQL v3 client that authenticates with delegated
//! Kerberos credentials.

mod connection;
mod params;
pub mod protocol;
mod registry;
mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use self::connection::{
    AuthenticatedConnection, HandshakeState, RowStream, WireGssAdapter, tls_config,
};
pub use self::params::ConnectParams;
pub use self::registry::TokenSourceRegistry;
pub use self::value::{Column, PgValue, Row};
