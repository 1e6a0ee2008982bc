use rust_decimal::Decimal;
use timebank_storage::StorageError;

use crate::machine::MachineError;

/// Errors returned by engine operations.
///
/// Every variant carries a stable machine-readable [`code`](EngineError::code)
/// alongside its human-readable message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The handshake or report is not in a status that permits the action.
    #[error("{0}")]
    InvalidState(String),

    /// The caller may not perform the action.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("insufficient balance for {user_id}: required {required}, available {available}")]
    InsufficientBalance {
        user_id: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("{0}")]
    NotFound(String),

    /// No caller identity, or the identity is not a known member.
    #[error("{0}")]
    Unauthenticated(String),

    /// A request argument is malformed.
    #[error("{0}")]
    InvalidInput(String),

    /// Optimistic retries were exhausted without a successful commit.
    #[error("{0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Unauthenticated(_) => "UNAUTHENTICATED",
            EngineError::InvalidInput(_) => "INVALID_INPUT",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => EngineError::NotFound(e.to_string()),
            StorageError::AlreadyExists { kind, .. } if kind == "open interest" => {
                EngineError::AlreadyExists(
                    "an open handshake already exists for this service".to_string(),
                )
            }
            StorageError::AlreadyExists { .. } => EngineError::AlreadyExists(e.to_string()),
            StorageError::InsufficientBalance {
                user_id,
                required,
                available,
            } => EngineError::InsufficientBalance {
                user_id,
                required,
                available,
            },
            StorageError::ConcurrentConflict { .. } => EngineError::Conflict(e.to_string()),
            StorageError::Overflow { .. } => EngineError::InvalidInput(e.to_string()),
            StorageError::Backend(msg) => EngineError::Storage(msg),
        }
    }
}

impl From<MachineError> for EngineError {
    fn from(e: MachineError) -> Self {
        match e {
            MachineError::InvalidState(msg) => EngineError::InvalidState(msg),
            MachineError::Forbidden(msg) => EngineError::Forbidden(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_stable_codes() {
        let cases = [
            (
                StorageError::NotFound {
                    kind: "handshake",
                    id: "h1".into(),
                },
                "NOT_FOUND",
            ),
            (
                StorageError::AlreadyExists {
                    kind: "feedback",
                    id: "h1/alice".into(),
                },
                "ALREADY_EXISTS",
            ),
            (
                StorageError::InsufficientBalance {
                    user_id: "alice".into(),
                    required: Decimal::from(2),
                    available: Decimal::ONE,
                },
                "INSUFFICIENT_BALANCE",
            ),
            (
                StorageError::ConcurrentConflict {
                    kind: "handshake",
                    id: "h1".into(),
                    expected_version: 3,
                },
                "CONFLICT",
            ),
            (
                StorageError::Overflow {
                    kind: "balance",
                    id: "bob".into(),
                },
                "INVALID_INPUT",
            ),
            (StorageError::Backend("disk full".into()), "STORAGE_ERROR"),
        ];
        for (err, code) in cases {
            assert_eq!(EngineError::from(err).code(), code);
        }
    }

    #[test]
    fn open_interest_violation_reads_as_duplicate_interest() {
        let err = EngineError::from(StorageError::AlreadyExists {
            kind: "open interest",
            id: "svc-1/alice".into(),
        });
        assert_eq!(err.code(), "ALREADY_EXISTS");
        assert!(err.to_string().contains("open handshake"));
    }

    #[test]
    fn machine_errors_keep_their_message() {
        let err = EngineError::from(MachineError::Forbidden("only the provider may accept".into()));
        assert_eq!(err.code(), "FORBIDDEN");
        assert_eq!(err.to_string(), "only the provider may accept");
    }
}
