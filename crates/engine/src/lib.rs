//! TimeBank handshake engine.
//!
//! Turns an expressed interest in a service into a completed, balance-settling
//! exchange of hours between two members. The crate is layered:
//!
//! - [`machine`]: pure transition logic over [`HandshakeRecord`]s
//! - [`Engine`]: member operations that drive the machine against a
//!   [`TimebankStorage`] backend, one snapshot per transition
//! - dispute resolution, feedback and admin operations as further
//!   `impl Engine` blocks
//! - [`Ledger`]: direct access to balances, reservations and transfers
//! - [`EventSink`]: where domain events go once a snapshot has committed

pub mod admin;
pub mod catalog;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod machine;
pub mod policy;
pub mod reputation;
pub mod sweep;

pub use catalog::{InMemoryCatalog, ServiceCatalog, ServiceKind, ServiceListing};
pub use engine::{Actor, Engine, HandshakeFilter, NewReport};
pub use error::EngineError;
pub use events::{BroadcastSink, DomainEvent, EventSink, HandshakeEvent, NoopSink, TracingSink};
pub use ledger::Ledger;
pub use machine::{Action, Effect, MachineError, NoShowParty, Party, Resolution, Transition};
pub use policy::Policy;
pub use reputation::FeedbackInput;
pub use sweep::spawn_sweeper;

pub use timebank_storage::{
    AccountRecord, AuditRecord, FeedbackRecord, HandshakeRecord, HandshakeStatus, ReportRecord,
    ReportStatus, ReportType, ResolutionAction, Role, TimebankStorage, TransferRecord,
    TransitionRecord, WarningRecord,
};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Format a timestamp as RFC 3339, the format every stored record uses.
pub(crate) fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// A fresh random identifier for handshakes, reports and audit rows.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
