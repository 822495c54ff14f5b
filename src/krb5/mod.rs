//! Kerberos V5 client plumbing: credential caches, realm configuration, the
//! AES enctypes and the TGS exchange used to obtain service tickets from a
//! delegated TGT.

pub mod ccache;
pub mod config;
pub mod crypto;
mod error;
pub mod kdc;
pub mod messages;
mod principal;
#[cfg(test)]
pub(crate) mod testing;

pub use self::ccache::{Credential, CredentialCache};
pub use self::config::RealmConfig;
pub use self::crypto::{EncType, EncryptionKey};
pub use self::error::Error;
pub use self::kdc::{IssuedTicket, KdcTransport, TcpTransport};
pub use self::principal::{NT_PRINCIPAL, NT_SRV_HST, NT_SRV_INST, Principal};
