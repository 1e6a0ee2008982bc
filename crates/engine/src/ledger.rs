//! Ledger façade over the storage backend.
//!
//! Each [`Ledger`] call runs in its own snapshot. The engine does not go
//! through the façade for handshake settlement: it stages the same storage
//! mutations (see [`stage_effects`]) into the snapshot that carries the
//! handshake update, so status and balances commit together.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use timebank_storage::{
    AccountRecord, ReservationRecord, StorageError, TimebankStorage, TransferRecord,
};

use crate::error::EngineError;
use crate::machine::Effect;
use crate::policy::Policy;
use crate::rfc3339;

/// Balance, reservation and karma operations for a single storage backend.
pub struct Ledger<S> {
    storage: Arc<S>,
}

impl<S> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: TimebankStorage> Ledger<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Hold `hours` of `user_id`'s balance under `key`.
    pub async fn reserve(&self, key: &str, user_id: &str, hours: Decimal) -> Result<(), EngineError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage
            .reserve(
                &mut snapshot,
                ReservationRecord {
                    key: key.to_string(),
                    user_id: user_id.to_string(),
                    hours,
                },
            )
            .await;
        finish(storage, snapshot, staged).await?;
        Ok(())
    }

    /// Drop the hold under `key`. Unknown keys are ignored.
    pub async fn release(&self, key: &str) -> Result<(), EngineError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage.release(&mut snapshot, key).await;
        finish(storage, snapshot, staged).await?;
        Ok(())
    }

    /// Move `hours` between two members, at most once per `idempotency_key`.
    ///
    /// Returns the transfer on record for the key, which for a replay is the
    /// original one.
    pub async fn transfer(
        &self,
        from_user: &str,
        to_user: &str,
        hours: Decimal,
        idempotency_key: &str,
    ) -> Result<TransferRecord, EngineError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage
            .transfer(
                &mut snapshot,
                TransferRecord {
                    idempotency_key: idempotency_key.to_string(),
                    from_user: from_user.to_string(),
                    to_user: to_user.to_string(),
                    hours,
                    at: rfc3339(OffsetDateTime::now_utc()),
                },
            )
            .await;
        finish(storage, snapshot, staged).await?;
        storage
            .get_transfer(idempotency_key)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("transfer {idempotency_key} vanished")))
    }

    /// Add `delta` to a member's karma and return the new score.
    pub async fn adjust_karma(&self, user_id: &str, delta: i64) -> Result<i64, EngineError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage.adjust_karma(&mut snapshot, user_id, delta).await;
        finish(storage, snapshot, staged).await?;
        Ok(storage.get_account(user_id).await?.karma)
    }

    /// Add `delta` to a member's balance and return the new balance.
    pub async fn adjust_balance(&self, user_id: &str, delta: Decimal) -> Result<Decimal, EngineError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage.adjust_balance(&mut snapshot, user_id, delta).await;
        finish(storage, snapshot, staged).await?;
        Ok(storage.get_account(user_id).await?.balance)
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Decimal, EngineError> {
        Ok(self.storage.get_account(user_id).await?.balance)
    }

    pub async fn get_account(&self, user_id: &str) -> Result<AccountRecord, EngineError> {
        Ok(self.storage.get_account(user_id).await?)
    }

    pub async fn list_transfers(&self, user_id: Option<&str>) -> Result<Vec<TransferRecord>, EngineError> {
        Ok(self.storage.list_transfers(user_id).await?)
    }
}

/// Commit `snapshot` if staging succeeded, otherwise abort it and hand back
/// the staging error.
pub(crate) async fn finish<S: TimebankStorage, T>(
    storage: &S,
    snapshot: S::Snapshot,
    staged: Result<T, StorageError>,
) -> Result<T, StorageError> {
    match staged {
        Ok(value) => {
            storage.commit_snapshot(snapshot).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = storage.abort_snapshot(snapshot).await;
            Err(e)
        }
    }
}

/// Stage the ledger side of a transition into `snapshot`.
pub(crate) async fn stage_effects<S: TimebankStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    effects: &[Effect],
    policy: &Policy,
    now: &str,
) -> Result<(), StorageError> {
    for effect in effects {
        match effect {
            Effect::Reserve {
                key,
                user_id,
                hours,
            } => {
                if policy.reserve_on_interest {
                    storage
                        .reserve(
                            snapshot,
                            ReservationRecord {
                                key: key.clone(),
                                user_id: user_id.clone(),
                                hours: *hours,
                            },
                        )
                        .await?;
                }
            }
            Effect::Release { key } => storage.release(snapshot, key).await?,
            Effect::Settle {
                key,
                from_user,
                to_user,
                hours,
            } => {
                storage
                    .transfer(
                        snapshot,
                        TransferRecord {
                            idempotency_key: key.clone(),
                            from_user: from_user.clone(),
                            to_user: to_user.clone(),
                            hours: *hours,
                            at: now.to_string(),
                        },
                    )
                    .await?
            }
            Effect::Penalize { user_id } => {
                if policy.no_show_karma_penalty != 0 {
                    storage
                        .adjust_karma(snapshot, user_id, -policy.no_show_karma_penalty)
                        .await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timebank_storage::{MemoryStorage, Role};

    async fn ledger_with(accounts: &[(&str, i64)]) -> Ledger<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        let mut snapshot = storage.begin_snapshot().await.unwrap();
        for (user, balance) in accounts {
            storage
                .create_account(
                    &mut snapshot,
                    AccountRecord::new(user, Role::Member, Decimal::from(*balance)),
                )
                .await
                .unwrap();
        }
        storage.commit_snapshot(snapshot).await.unwrap();
        Ledger::new(storage)
    }

    #[tokio::test]
    async fn transfer_replay_returns_original() {
        let ledger = ledger_with(&[("alice", 5), ("bob", 0)]).await;
        let first = ledger
            .transfer("alice", "bob", Decimal::from(2), "hs-1")
            .await
            .unwrap();
        let replay = ledger
            .transfer("alice", "bob", Decimal::from(2), "hs-1")
            .await
            .unwrap();
        assert_eq!(first, replay);
        assert_eq!(ledger.get_balance("alice").await.unwrap(), Decimal::from(3));
        assert_eq!(ledger.get_balance("bob").await.unwrap(), Decimal::from(2));
        assert_eq!(ledger.list_transfers(Some("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overdraft_leaves_balances_untouched() {
        let ledger = ledger_with(&[("alice", 1), ("bob", 0)]).await;
        let err = ledger
            .transfer("alice", "bob", Decimal::from(2), "hs-1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
        assert_eq!(ledger.get_balance("alice").await.unwrap(), Decimal::ONE);
    }

    #[tokio::test]
    async fn reservation_limits_available_balance() {
        let ledger = ledger_with(&[("alice", 3)]).await;
        ledger.reserve("hs-1", "alice", Decimal::from(2)).await.unwrap();
        let err = ledger
            .reserve("hs-2", "alice", Decimal::from(2))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

        ledger.release("hs-1").await.unwrap();
        ledger.release("hs-1").await.unwrap();
        ledger.reserve("hs-2", "alice", Decimal::from(2)).await.unwrap();
        let account = ledger.get_account("alice").await.unwrap();
        assert_eq!(account.reserved, Decimal::from(2));
    }

    #[tokio::test]
    async fn karma_and_balance_adjustments_report_new_values() {
        let ledger = ledger_with(&[("alice", 1)]).await;
        assert_eq!(ledger.adjust_karma("alice", -5).await.unwrap(), -5);
        assert_eq!(
            ledger.adjust_balance("alice", Decimal::from(4)).await.unwrap(),
            Decimal::from(5)
        );
        let err = ledger
            .adjust_balance("alice", Decimal::from(-6))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let ledger = ledger_with(&[]).await;
        let err = ledger.get_balance("ghost").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
