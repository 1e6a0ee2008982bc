use rust_decimal::Decimal;

/// All errors that can be returned by a TimebankStorage implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another snapshot modified
    /// the row first. The expected version was not found at commit time.
    #[error("concurrent conflict on {kind} {id}: expected version {expected_version}")]
    ConcurrentConflict {
        kind: &'static str,
        id: String,
        expected_version: i64,
    },

    /// No row with the given key.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A row with this key already exists, or a uniqueness constraint
    /// (open interest per service and requester, feedback per rater) was hit.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// A ledger mutation would overdraw the account.
    #[error("insufficient balance for {user_id}: required {required}, available {available}")]
    InsufficientBalance {
        user_id: String,
        required: Decimal,
        available: Decimal,
    },

    /// An hour or counter amount left the representable range.
    #[error("{kind} out of range for {id}")]
    Overflow { kind: &'static str, id: String },

    /// A backend-specific storage error (I/O, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
