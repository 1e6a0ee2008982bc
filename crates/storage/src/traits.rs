use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::StorageError;
use crate::record::{
    AccountRecord, AuditRecord, CounterDelta, FeedbackRecord, HandshakeRecord, HandshakeStatus,
    ReportRecord, ReportStatus, ReservationRecord, TransferRecord, TransitionRecord,
    WarningRecord,
};

/// Filters for [`TimebankStorage::list_handshakes`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeQuery {
    /// Match handshakes where this user is the provider or the receiver.
    pub participant: Option<String>,
    pub service_id: Option<String>,
    pub status: Option<HandshakeStatus>,
    /// Maximum number of results (0 = no limit).
    pub limit: usize,
}

impl HandshakeQuery {
    pub fn matches(&self, record: &HandshakeRecord) -> bool {
        self.participant
            .as_deref()
            .map_or(true, |p| record.provider_id == p || record.receiver_id == p)
            && self
                .service_id
                .as_deref()
                .map_or(true, |s| record.service_id == s)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// The storage trait for the handshake engine.
///
/// A `TimebankStorage` implementation hosts both the handshake repository
/// and the ledger, so that a handshake status change and the balance
/// movement it triggers commit together.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// Mutations staged in a snapshot are invisible to every reader until the
/// commit succeeds. A failed commit applies nothing. Dropping a snapshot
/// without committing discards it.
///
/// ## OCC Conflict Detection
///
/// `update_handshake` and `update_report` are conditional on
/// `version = expected_version`. A stale version makes the call (or the
/// commit, if another snapshot won in between) fail with
/// `StorageError::ConcurrentConflict`.
///
/// ## Ledger Constraints
///
/// Ledger mutations are validated when the snapshot commits, against the
/// state produced by the mutations staged before them:
/// - `reserve` fails with `InsufficientBalance` when the account's
///   available balance is below the requested hours.
/// - `transfer` is idempotent on `idempotency_key`; a replay is a no-op.
///   It consumes the reservation that carries the same key and fails with
///   `InsufficientBalance` rather than drive the payer's balance negative.
/// - `adjust_balance` fails with `InsufficientBalance` rather than drive a
///   balance negative.
///
/// ## Uniqueness
///
/// - At most one non-terminal handshake per `(service_id, requester_id)`.
/// - At most one feedback row per `(handshake_id, rater_id)`.
///
/// Both violations surface as `StorageError::AlreadyExists`.
#[async_trait]
pub trait TimebankStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, applying every staged mutation atomically.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all staged mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Handshake repository (within snapshot) ───────────────────────────────

    /// Insert a new handshake.
    ///
    /// Fails with `AlreadyExists` if the id is taken or the requester already
    /// has a non-terminal handshake on the same service.
    async fn insert_handshake(
        &self,
        snapshot: &mut Self::Snapshot,
        record: HandshakeRecord,
    ) -> Result<(), StorageError>;

    /// Replace a handshake, conditional on its current version.
    ///
    /// Returns the new version number on success.
    async fn update_handshake(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        record: HandshakeRecord,
    ) -> Result<i64, StorageError>;

    /// Record a handshake status change. Must share the snapshot of the
    /// `update_handshake`/`insert_handshake` call it describes.
    async fn insert_transition(
        &self,
        snapshot: &mut Self::Snapshot,
        record: TransitionRecord,
    ) -> Result<(), StorageError>;

    // ── Reports and feedback (within snapshot) ───────────────────────────────

    async fn insert_report(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ReportRecord,
    ) -> Result<(), StorageError>;

    /// Replace a report, conditional on its current version.
    async fn update_report(
        &self,
        snapshot: &mut Self::Snapshot,
        expected_version: i64,
        record: ReportRecord,
    ) -> Result<i64, StorageError>;

    /// Insert feedback. Fails with `AlreadyExists` on a duplicate
    /// `(handshake_id, rater_id)`.
    async fn insert_feedback(
        &self,
        snapshot: &mut Self::Snapshot,
        record: FeedbackRecord,
    ) -> Result<(), StorageError>;

    // ── Ledger (within snapshot) ──────────────────────────────────────────────

    async fn create_account(
        &self,
        snapshot: &mut Self::Snapshot,
        record: AccountRecord,
    ) -> Result<(), StorageError>;

    async fn reserve(
        &self,
        snapshot: &mut Self::Snapshot,
        reservation: ReservationRecord,
    ) -> Result<(), StorageError>;

    /// Release the reservation held under `key`. Releasing an unknown key is a no-op.
    async fn release(&self, snapshot: &mut Self::Snapshot, key: &str) -> Result<(), StorageError>;

    async fn transfer(
        &self,
        snapshot: &mut Self::Snapshot,
        transfer: TransferRecord,
    ) -> Result<(), StorageError>;

    async fn adjust_karma(
        &self,
        snapshot: &mut Self::Snapshot,
        user_id: &str,
        delta: i64,
    ) -> Result<(), StorageError>;

    async fn adjust_balance(
        &self,
        snapshot: &mut Self::Snapshot,
        user_id: &str,
        delta: Decimal,
    ) -> Result<(), StorageError>;

    async fn bump_counters(
        &self,
        snapshot: &mut Self::Snapshot,
        user_id: &str,
        delta: CounterDelta,
    ) -> Result<(), StorageError>;

    async fn set_active(
        &self,
        snapshot: &mut Self::Snapshot,
        user_id: &str,
        active: bool,
    ) -> Result<(), StorageError>;

    // ── Audit trail (within snapshot) ─────────────────────────────────────────

    async fn insert_audit(
        &self,
        snapshot: &mut Self::Snapshot,
        record: AuditRecord,
    ) -> Result<(), StorageError>;

    async fn insert_warning(
        &self,
        snapshot: &mut Self::Snapshot,
        record: WarningRecord,
    ) -> Result<(), StorageError>;

    // ── Query operations (committed state only) ───────────────────────────────

    async fn get_handshake(&self, id: &str) -> Result<HandshakeRecord, StorageError>;

    /// List handshakes matching the query, oldest first.
    async fn list_handshakes(
        &self,
        query: &HandshakeQuery,
    ) -> Result<Vec<HandshakeRecord>, StorageError>;

    async fn list_transitions(
        &self,
        handshake_id: &str,
    ) -> Result<Vec<TransitionRecord>, StorageError>;

    async fn get_report(&self, id: &str) -> Result<ReportRecord, StorageError>;

    /// List reports, optionally filtered by status, oldest first.
    async fn list_reports(
        &self,
        status: Option<ReportStatus>,
    ) -> Result<Vec<ReportRecord>, StorageError>;

    /// Reports whose `related_handshake_id` is `handshake_id`.
    async fn reports_for_handshake(
        &self,
        handshake_id: &str,
    ) -> Result<Vec<ReportRecord>, StorageError>;

    async fn list_feedback(&self, handshake_id: &str)
        -> Result<Vec<FeedbackRecord>, StorageError>;

    async fn get_account(&self, user_id: &str) -> Result<AccountRecord, StorageError>;

    async fn list_accounts(&self) -> Result<Vec<AccountRecord>, StorageError>;

    async fn get_reservation(&self, key: &str)
        -> Result<Option<ReservationRecord>, StorageError>;

    async fn get_transfer(&self, key: &str) -> Result<Option<TransferRecord>, StorageError>;

    /// List transfers, optionally only those paid or received by `user_id`.
    async fn list_transfers(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, StorageError>;

    /// List audit records, optionally only those about `subject_id`.
    async fn list_audit(&self, subject_id: Option<&str>)
        -> Result<Vec<AuditRecord>, StorageError>;

    async fn list_warnings(&self, user_id: &str) -> Result<Vec<WarningRecord>, StorageError>;
}
