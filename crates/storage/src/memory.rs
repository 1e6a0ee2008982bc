//! In-memory `TimebankStorage` backend with optional JSON state-file persistence.
//!
//! Snapshots stage mutations as a list of operations. `commit_snapshot`
//! applies them in order to a copy of the committed tables and swaps the copy
//! in only if every operation succeeds, which gives all-or-nothing commits and
//! per-row optimistic concurrency. Commits are serialized by an async gate;
//! the table mutex itself is only held for the clone and the swap, never
//! across an `.await`.
//!
//! With a state file, each commit rewrites the whole file on the blocking
//! pool before the swap. Commit latency therefore grows with the table size,
//! which suits the single-process deployments this backend targets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::record::{
    AccountRecord, AuditRecord, CounterDelta, FeedbackRecord, HandshakeRecord, ReportRecord,
    ReportStatus, ReservationRecord, TransferRecord, TransitionRecord, WarningRecord,
};
use crate::traits::{HandshakeQuery, TimebankStorage};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    handshakes: BTreeMap<String, HandshakeRecord>,
    transitions: Vec<TransitionRecord>,
    reports: BTreeMap<String, ReportRecord>,
    /// Keyed by `"{handshake_id}/{rater_id}"`.
    feedback: BTreeMap<String, FeedbackRecord>,
    accounts: BTreeMap<String, AccountRecord>,
    reservations: BTreeMap<String, ReservationRecord>,
    transfers: BTreeMap<String, TransferRecord>,
    audit: Vec<AuditRecord>,
    warnings: Vec<WarningRecord>,
}

/// A mutation staged in a [`MemorySnapshot`].
#[derive(Debug, Clone)]
enum Staged {
    InsertHandshake(HandshakeRecord),
    UpdateHandshake {
        expected_version: i64,
        record: HandshakeRecord,
    },
    InsertTransition(TransitionRecord),
    InsertReport(ReportRecord),
    UpdateReport {
        expected_version: i64,
        record: ReportRecord,
    },
    InsertFeedback(FeedbackRecord),
    CreateAccount(AccountRecord),
    Reserve(ReservationRecord),
    Release(String),
    Transfer(TransferRecord),
    AdjustKarma(String, i64),
    AdjustBalance(String, Decimal),
    BumpCounters(String, CounterDelta),
    SetActive(String, bool),
    InsertAudit(AuditRecord),
    InsertWarning(WarningRecord),
}

/// An open transaction against [`MemoryStorage`].
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    staged: Vec<Staged>,
}

impl MemorySnapshot {
    /// Number of mutations staged so far.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

/// In-memory storage backend.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
    commit_gate: Arc<tokio::sync::Mutex<()>>,
    state_file: Option<PathBuf>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a storage backed by a JSON state file.
    ///
    /// Loads the file if it exists; every successful commit rewrites it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = std::fs::read(&path)
                .map_err(|e| StorageError::Backend(format!("read {}: {e}", path.display())))?;
            serde_json::from_slice(&raw)
                .map_err(|e| StorageError::Backend(format!("parse {}: {e}", path.display())))?
        } else {
            Tables::default()
        };
        tracing::info!(path = %path.display(), "opened state file");
        Ok(Self {
            tables: Arc::new(Mutex::new(tables)),
            commit_gate: Arc::default(),
            state_file: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_string()))
    }

    /// Write `tables` to the state file, if any, and hand them back.
    async fn persist(&self, tables: Tables) -> Result<Tables, StorageError> {
        let Some(path) = self.state_file.clone() else {
            return Ok(tables);
        };
        tokio::task::spawn_blocking(move || {
            write_state(&path, &tables)?;
            Ok::<_, StorageError>(tables)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("state writer: {e}")))?
    }

    /// Stage a version-checked mutation, failing fast if the committed
    /// version has already moved on.
    fn check_version(
        &self,
        kind: &'static str,
        id: &str,
        current: Option<i64>,
        expected_version: i64,
    ) -> Result<(), StorageError> {
        match current {
            None => Err(StorageError::NotFound {
                kind,
                id: id.to_string(),
            }),
            Some(v) if v != expected_version => Err(StorageError::ConcurrentConflict {
                kind,
                id: id.to_string(),
                expected_version,
            }),
            Some(_) => Ok(()),
        }
    }
}

fn write_state(path: &Path, tables: &Tables) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(tables)
        .map_err(|e| StorageError::Backend(format!("serialize state: {e}")))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .map_err(|e| StorageError::Backend(format!("write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| StorageError::Backend(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

fn feedback_key(handshake_id: &str, rater_id: &str) -> String {
    format!("{handshake_id}/{rater_id}")
}

fn account_mut<'a>(
    accounts: &'a mut BTreeMap<String, AccountRecord>,
    user_id: &str,
) -> Result<&'a mut AccountRecord, StorageError> {
    accounts.get_mut(user_id).ok_or_else(|| StorageError::NotFound {
        kind: "account",
        id: user_id.to_string(),
    })
}

fn overflow(kind: &'static str, user_id: &str) -> StorageError {
    StorageError::Overflow {
        kind,
        id: user_id.to_string(),
    }
}

fn add_hours(
    kind: &'static str,
    user_id: &str,
    a: Decimal,
    b: Decimal,
) -> Result<Decimal, StorageError> {
    a.checked_add(b).ok_or_else(|| overflow(kind, user_id))
}

fn sub_hours(
    kind: &'static str,
    user_id: &str,
    a: Decimal,
    b: Decimal,
) -> Result<Decimal, StorageError> {
    a.checked_sub(b).ok_or_else(|| overflow(kind, user_id))
}

fn add_count(kind: &'static str, user_id: &str, a: u64, b: u64) -> Result<u64, StorageError> {
    a.checked_add(b).ok_or_else(|| overflow(kind, user_id))
}

impl Tables {
    fn apply(&mut self, op: Staged) -> Result<(), StorageError> {
        match op {
            Staged::InsertHandshake(record) => {
                if self.handshakes.contains_key(&record.id) {
                    return Err(StorageError::AlreadyExists {
                        kind: "handshake",
                        id: record.id,
                    });
                }
                if !record.status.is_terminal() {
                    let open = self.handshakes.values().any(|h| {
                        !h.status.is_terminal()
                            && h.service_id == record.service_id
                            && h.requester_id == record.requester_id
                    });
                    if open {
                        return Err(StorageError::AlreadyExists {
                            kind: "open interest",
                            id: format!("{}/{}", record.service_id, record.requester_id),
                        });
                    }
                }
                self.handshakes.insert(record.id.clone(), record);
            }
            Staged::UpdateHandshake {
                expected_version,
                mut record,
            } => {
                let current = self
                    .handshakes
                    .get_mut(&record.id)
                    .ok_or_else(|| StorageError::NotFound {
                        kind: "handshake",
                        id: record.id.clone(),
                    })?;
                if current.version != expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        kind: "handshake",
                        id: record.id,
                        expected_version,
                    });
                }
                record.version = expected_version + 1;
                *current = record;
            }
            Staged::InsertTransition(record) => self.transitions.push(record),
            Staged::InsertReport(record) => {
                if self.reports.contains_key(&record.id) {
                    return Err(StorageError::AlreadyExists {
                        kind: "report",
                        id: record.id,
                    });
                }
                self.reports.insert(record.id.clone(), record);
            }
            Staged::UpdateReport {
                expected_version,
                mut record,
            } => {
                let current =
                    self.reports
                        .get_mut(&record.id)
                        .ok_or_else(|| StorageError::NotFound {
                            kind: "report",
                            id: record.id.clone(),
                        })?;
                if current.version != expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        kind: "report",
                        id: record.id,
                        expected_version,
                    });
                }
                record.version = expected_version + 1;
                *current = record;
            }
            Staged::InsertFeedback(record) => {
                let key = feedback_key(&record.handshake_id, &record.rater_id);
                if self.feedback.contains_key(&key) {
                    return Err(StorageError::AlreadyExists {
                        kind: "feedback",
                        id: key,
                    });
                }
                self.feedback.insert(key, record);
            }
            Staged::CreateAccount(record) => {
                if self.accounts.contains_key(&record.user_id) {
                    return Err(StorageError::AlreadyExists {
                        kind: "account",
                        id: record.user_id,
                    });
                }
                self.accounts.insert(record.user_id.clone(), record);
            }
            Staged::Reserve(reservation) => {
                if reservation.hours <= Decimal::ZERO {
                    return Err(StorageError::Backend(format!(
                        "reservation {} must hold a positive amount",
                        reservation.key
                    )));
                }
                if self.reservations.contains_key(&reservation.key) {
                    return Err(StorageError::AlreadyExists {
                        kind: "reservation",
                        id: reservation.key,
                    });
                }
                let account = account_mut(&mut self.accounts, &reservation.user_id)?;
                if account.available() < reservation.hours {
                    return Err(StorageError::InsufficientBalance {
                        user_id: reservation.user_id,
                        required: reservation.hours,
                        available: account.available(),
                    });
                }
                account.reserved = add_hours(
                    "reserved",
                    &reservation.user_id,
                    account.reserved,
                    reservation.hours,
                )?;
                account.version += 1;
                self.reservations
                    .insert(reservation.key.clone(), reservation);
            }
            Staged::Release(key) => {
                if let Some(reservation) = self.reservations.remove(&key) {
                    let account = account_mut(&mut self.accounts, &reservation.user_id)?;
                    account.reserved =
                        sub_hours("reserved", &reservation.user_id, account.reserved, reservation.hours)?
                            .max(Decimal::ZERO);
                    account.version += 1;
                }
            }
            Staged::Transfer(transfer) => {
                if self.transfers.contains_key(&transfer.idempotency_key) {
                    return Ok(());
                }
                if transfer.hours <= Decimal::ZERO {
                    return Err(StorageError::Backend(format!(
                        "transfer {} must move a positive amount",
                        transfer.idempotency_key
                    )));
                }
                if !self.accounts.contains_key(&transfer.to_user) {
                    return Err(StorageError::NotFound {
                        kind: "account",
                        id: transfer.to_user,
                    });
                }
                let held = self
                    .reservations
                    .get(&transfer.idempotency_key)
                    .filter(|r| r.user_id == transfer.from_user)
                    .map(|r| r.hours);
                let payer = account_mut(&mut self.accounts, &transfer.from_user)?;
                // Hours held for other handshakes are not spendable here.
                let spendable = add_hours(
                    "balance",
                    &transfer.from_user,
                    payer.available(),
                    held.unwrap_or(Decimal::ZERO),
                )?;
                if spendable < transfer.hours {
                    return Err(StorageError::InsufficientBalance {
                        user_id: transfer.from_user,
                        required: transfer.hours,
                        available: spendable,
                    });
                }
                payer.balance =
                    sub_hours("balance", &transfer.from_user, payer.balance, transfer.hours)?;
                if let Some(hours) = held {
                    payer.reserved =
                        sub_hours("reserved", &transfer.from_user, payer.reserved, hours)?
                            .max(Decimal::ZERO);
                    self.reservations.remove(&transfer.idempotency_key);
                }
                payer.version += 1;
                let payee = account_mut(&mut self.accounts, &transfer.to_user)?;
                payee.balance =
                    add_hours("balance", &transfer.to_user, payee.balance, transfer.hours)?;
                payee.version += 1;
                self.transfers
                    .insert(transfer.idempotency_key.clone(), transfer);
            }
            Staged::AdjustKarma(user_id, delta) => {
                let account = account_mut(&mut self.accounts, &user_id)?;
                account.karma = account.karma.saturating_add(delta);
                account.version += 1;
            }
            Staged::AdjustBalance(user_id, delta) => {
                let account = account_mut(&mut self.accounts, &user_id)?;
                let next = add_hours("balance", &user_id, account.balance, delta)?;
                // Held hours stay covered.
                if next < account.reserved {
                    return Err(StorageError::InsufficientBalance {
                        user_id,
                        required: -delta,
                        available: account.available(),
                    });
                }
                account.balance = next;
                account.version += 1;
            }
            Staged::BumpCounters(user_id, delta) => {
                let account = account_mut(&mut self.accounts, &user_id)?;
                account.punctual_count =
                    add_count("punctual_count", &user_id, account.punctual_count, delta.punctual)?;
                account.helpful_count =
                    add_count("helpful_count", &user_id, account.helpful_count, delta.helpful)?;
                account.kind_count =
                    add_count("kind_count", &user_id, account.kind_count, delta.kind)?;
                account.karma = account.karma.saturating_add(delta.karma);
                account.version += 1;
            }
            Staged::SetActive(user_id, active) => {
                let account = account_mut(&mut self.accounts, &user_id)?;
                account.is_active = active;
                account.version += 1;
            }
            Staged::InsertAudit(record) => self.audit.push(record),
            Staged::InsertWarning(record) => self.warnings.push(record),
        }
        Ok(())
    }
}

#[async_trait]
impl TimebankStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        if snapshot.is_empty() {
            return Ok(());
        }
        let _gate = self.commit_gate.lock().await;
        let mut next = self.lock()?.clone();
        for op in snapshot.staged {
            next.apply(op)?;
        }
        let next = self.persist(next).await?;
        *self.lock()? = next;
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_handshake(
        &self,
        snapshot: &mut MemorySnapshot,
        record: HandshakeRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::InsertHandshake(record));
        Ok(())
    }

    async fn update_handshake(
        &self,
        snapshot: &mut MemorySnapshot,
        expected_version: i64,
        record: HandshakeRecord,
    ) -> Result<i64, StorageError> {
        let current = self.lock()?.handshakes.get(&record.id).map(|h| h.version);
        self.check_version("handshake", &record.id, current, expected_version)?;
        snapshot.staged.push(Staged::UpdateHandshake {
            expected_version,
            record,
        });
        Ok(expected_version + 1)
    }

    async fn insert_transition(
        &self,
        snapshot: &mut MemorySnapshot,
        record: TransitionRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::InsertTransition(record));
        Ok(())
    }

    async fn insert_report(
        &self,
        snapshot: &mut MemorySnapshot,
        record: ReportRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::InsertReport(record));
        Ok(())
    }

    async fn update_report(
        &self,
        snapshot: &mut MemorySnapshot,
        expected_version: i64,
        record: ReportRecord,
    ) -> Result<i64, StorageError> {
        let current = self.lock()?.reports.get(&record.id).map(|r| r.version);
        self.check_version("report", &record.id, current, expected_version)?;
        snapshot.staged.push(Staged::UpdateReport {
            expected_version,
            record,
        });
        Ok(expected_version + 1)
    }

    async fn insert_feedback(
        &self,
        snapshot: &mut MemorySnapshot,
        record: FeedbackRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::InsertFeedback(record));
        Ok(())
    }

    async fn create_account(
        &self,
        snapshot: &mut MemorySnapshot,
        record: AccountRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::CreateAccount(record));
        Ok(())
    }

    async fn reserve(
        &self,
        snapshot: &mut MemorySnapshot,
        reservation: ReservationRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::Reserve(reservation));
        Ok(())
    }

    async fn release(&self, snapshot: &mut MemorySnapshot, key: &str) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::Release(key.to_string()));
        Ok(())
    }

    async fn transfer(
        &self,
        snapshot: &mut MemorySnapshot,
        transfer: TransferRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::Transfer(transfer));
        Ok(())
    }

    async fn adjust_karma(
        &self,
        snapshot: &mut MemorySnapshot,
        user_id: &str,
        delta: i64,
    ) -> Result<(), StorageError> {
        snapshot
            .staged
            .push(Staged::AdjustKarma(user_id.to_string(), delta));
        Ok(())
    }

    async fn adjust_balance(
        &self,
        snapshot: &mut MemorySnapshot,
        user_id: &str,
        delta: Decimal,
    ) -> Result<(), StorageError> {
        snapshot
            .staged
            .push(Staged::AdjustBalance(user_id.to_string(), delta));
        Ok(())
    }

    async fn bump_counters(
        &self,
        snapshot: &mut MemorySnapshot,
        user_id: &str,
        delta: CounterDelta,
    ) -> Result<(), StorageError> {
        snapshot
            .staged
            .push(Staged::BumpCounters(user_id.to_string(), delta));
        Ok(())
    }

    async fn set_active(
        &self,
        snapshot: &mut MemorySnapshot,
        user_id: &str,
        active: bool,
    ) -> Result<(), StorageError> {
        snapshot
            .staged
            .push(Staged::SetActive(user_id.to_string(), active));
        Ok(())
    }

    async fn insert_audit(
        &self,
        snapshot: &mut MemorySnapshot,
        record: AuditRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::InsertAudit(record));
        Ok(())
    }

    async fn insert_warning(
        &self,
        snapshot: &mut MemorySnapshot,
        record: WarningRecord,
    ) -> Result<(), StorageError> {
        snapshot.staged.push(Staged::InsertWarning(record));
        Ok(())
    }

    async fn get_handshake(&self, id: &str) -> Result<HandshakeRecord, StorageError> {
        self.lock()?
            .handshakes
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind: "handshake",
                id: id.to_string(),
            })
    }

    async fn list_handshakes(
        &self,
        query: &HandshakeQuery,
    ) -> Result<Vec<HandshakeRecord>, StorageError> {
        let tables = self.lock()?;
        let mut rows: Vec<HandshakeRecord> = tables
            .handshakes
            .values()
            .filter(|h| query.matches(h))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if query.limit > 0 {
            rows.truncate(query.limit);
        }
        Ok(rows)
    }

    async fn list_transitions(
        &self,
        handshake_id: &str,
    ) -> Result<Vec<TransitionRecord>, StorageError> {
        Ok(self
            .lock()?
            .transitions
            .iter()
            .filter(|t| t.handshake_id == handshake_id)
            .cloned()
            .collect())
    }

    async fn get_report(&self, id: &str) -> Result<ReportRecord, StorageError> {
        self.lock()?
            .reports
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind: "report",
                id: id.to_string(),
            })
    }

    async fn list_reports(
        &self,
        status: Option<ReportStatus>,
    ) -> Result<Vec<ReportRecord>, StorageError> {
        let tables = self.lock()?;
        let mut rows: Vec<ReportRecord> = tables
            .reports
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn reports_for_handshake(
        &self,
        handshake_id: &str,
    ) -> Result<Vec<ReportRecord>, StorageError> {
        let tables = self.lock()?;
        let mut rows: Vec<ReportRecord> = tables
            .reports
            .values()
            .filter(|r| r.related_handshake_id.as_deref() == Some(handshake_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn list_feedback(
        &self,
        handshake_id: &str,
    ) -> Result<Vec<FeedbackRecord>, StorageError> {
        Ok(self
            .lock()?
            .feedback
            .values()
            .filter(|f| f.handshake_id == handshake_id)
            .cloned()
            .collect())
    }

    async fn get_account(&self, user_id: &str) -> Result<AccountRecord, StorageError> {
        self.lock()?
            .accounts
            .get(user_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind: "account",
                id: user_id.to_string(),
            })
    }

    async fn list_accounts(&self) -> Result<Vec<AccountRecord>, StorageError> {
        Ok(self.lock()?.accounts.values().cloned().collect())
    }

    async fn get_reservation(
        &self,
        key: &str,
    ) -> Result<Option<ReservationRecord>, StorageError> {
        Ok(self.lock()?.reservations.get(key).cloned())
    }

    async fn get_transfer(&self, key: &str) -> Result<Option<TransferRecord>, StorageError> {
        Ok(self.lock()?.transfers.get(key).cloned())
    }

    async fn list_transfers(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, StorageError> {
        Ok(self
            .lock()?
            .transfers
            .values()
            .filter(|t| user_id.map_or(true, |u| t.from_user == u || t.to_user == u))
            .cloned()
            .collect())
    }

    async fn list_audit(
        &self,
        subject_id: Option<&str>,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|a| subject_id.map_or(true, |s| a.subject_id == s))
            .cloned()
            .collect())
    }

    async fn list_warnings(&self, user_id: &str) -> Result<Vec<WarningRecord>, StorageError> {
        Ok(self
            .lock()?
            .warnings
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }
}
