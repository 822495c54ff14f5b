//! The delegation-scoped credential broker: turns a per-request credential
//! cache into service tickets and GSS initiator tokens, and serializes use
//! of the process-wide token source.

mod error;
mod handle;
mod isolation;
mod orchestrator;
mod spn;
mod ticket;
mod token;

pub use self::error::{BrokerError, ErrorKind};
pub use self::handle::CredentialHandle;
pub use self::isolation::{ExclusiveSlot, IsolationManager};
pub use self::orchestrator::{DbIdentity, RequestOrchestrator};
pub use self::spn::{HostResolver, IdentityResolver, ServiceTarget, resolve as resolve_spn};
pub use self::ticket::{
    KdcTicketSource, ServiceTicket, TicketBroker, TicketCache, TicketGrant, TicketSource,
};
pub use self::token::{AuthToken, GssProvider, ProtectionFlags, TokenFactory, build_token};
