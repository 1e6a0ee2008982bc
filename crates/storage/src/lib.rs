pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use record::{
    AccountRecord, AuditRecord, CounterDelta, FeedbackRecord, HandshakeRecord, HandshakeStatus,
    ReportRecord, ReportStatus, ReportType, ReservationRecord, ResolutionAction, Role,
    TransferRecord, TransitionRecord, WarningRecord,
};
pub use traits::{HandshakeQuery, TimebankStorage};
