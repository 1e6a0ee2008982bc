//! Administrative operations on members and reports.
//!
//! Every mutation writes an audit row in the same snapshot as its effect.

use rust_decimal::Decimal;
use serde_json::json;
use time::OffsetDateTime;
use timebank_storage::{
    AccountRecord, AuditRecord, ReportRecord, ReportStatus, Role, StorageError, TimebankStorage,
    WarningRecord,
};

use crate::engine::{Actor, Engine};
use crate::error::EngineError;
use crate::events::DomainEvent;
use crate::ledger::finish;
use crate::{new_id, rfc3339};

pub(crate) fn audit_record(
    actor: &Actor,
    action: &str,
    subject_id: &str,
    detail: serde_json::Value,
    now: &str,
) -> AuditRecord {
    AuditRecord {
        id: new_id(),
        actor_id: actor.user_id.clone(),
        action: action.to_string(),
        subject_id: subject_id.to_string(),
        detail,
        at: now.to_string(),
    }
}

impl<S: TimebankStorage> Engine<S> {
    pub async fn warn_user(
        &self,
        actor: &Actor,
        user_id: &str,
        message: &str,
    ) -> Result<WarningRecord, EngineError> {
        actor.require_admin()?;
        if message.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "a warning needs a message".to_string(),
            ));
        }
        self.storage.get_account(user_id).await?;
        let now = rfc3339(OffsetDateTime::now_utc());
        let warning = WarningRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            issued_by: actor.user_id.clone(),
            message: message.to_string(),
            created_at: now.clone(),
        };

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.insert_warning(&mut snapshot, warning.clone()).await?;
            storage
                .insert_audit(
                    &mut snapshot,
                    audit_record(actor, "warn_user", user_id, json!({ "warning_id": warning.id }), &now),
                )
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        tracing::info!(user_id, admin = %actor.user_id, "user warned");
        self.events.emit(DomainEvent::UserWarned {
            user_id: user_id.to_string(),
            message: warning.message.clone(),
        });
        Ok(warning)
    }

    pub async fn ban_user(&self, actor: &Actor, user_id: &str) -> Result<AccountRecord, EngineError> {
        actor.require_admin()?;
        if actor.user_id == user_id {
            return Err(EngineError::InvalidInput(
                "an admin cannot ban themselves".to_string(),
            ));
        }
        let account = self.set_active(actor, user_id, false).await?;
        self.events.emit(DomainEvent::UserBanned {
            user_id: user_id.to_string(),
        });
        Ok(account)
    }

    pub async fn unban_user(&self, actor: &Actor, user_id: &str) -> Result<AccountRecord, EngineError> {
        let account = self.set_active(actor, user_id, true).await?;
        self.events.emit(DomainEvent::UserUnbanned {
            user_id: user_id.to_string(),
        });
        Ok(account)
    }

    async fn set_active(
        &self,
        actor: &Actor,
        user_id: &str,
        active: bool,
    ) -> Result<AccountRecord, EngineError> {
        actor.require_admin()?;
        self.storage.get_account(user_id).await?;
        let now = rfc3339(OffsetDateTime::now_utc());
        let action = if active { "unban_user" } else { "ban_user" };

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.set_active(&mut snapshot, user_id, active).await?;
            storage
                .insert_audit(&mut snapshot, audit_record(actor, action, user_id, json!({}), &now))
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        tracing::info!(user_id, admin = %actor.user_id, active, "account activity changed");
        Ok(self.storage.get_account(user_id).await?)
    }

    /// Add `delta` to a member's karma; returns the new karma.
    pub async fn adjust_karma(
        &self,
        actor: &Actor,
        user_id: &str,
        delta: i64,
    ) -> Result<i64, EngineError> {
        actor.require_admin()?;
        self.storage.get_account(user_id).await?;
        let now = rfc3339(OffsetDateTime::now_utc());

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.adjust_karma(&mut snapshot, user_id, delta).await?;
            storage
                .insert_audit(
                    &mut snapshot,
                    audit_record(actor, "adjust_karma", user_id, json!({ "delta": delta }), &now),
                )
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        let karma = self.storage.get_account(user_id).await?.karma;
        tracing::info!(user_id, admin = %actor.user_id, delta, karma, "karma adjusted");
        Ok(karma)
    }

    /// Add `delta` hours to a member's balance; returns the new balance.
    ///
    /// Refused with `InsufficientBalance` if the balance would drop below the
    /// hours held for open handshakes, and with `InvalidInput` if it would
    /// leave the representable range.
    pub async fn adjust_balance(
        &self,
        actor: &Actor,
        user_id: &str,
        delta: Decimal,
    ) -> Result<Decimal, EngineError> {
        actor.require_admin()?;
        self.storage.get_account(user_id).await?;
        let now = rfc3339(OffsetDateTime::now_utc());

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.adjust_balance(&mut snapshot, user_id, delta).await?;
            storage
                .insert_audit(
                    &mut snapshot,
                    audit_record(
                        actor,
                        "adjust_balance",
                        user_id,
                        json!({ "delta": delta.to_string() }),
                        &now,
                    ),
                )
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        let balance = self.storage.get_account(user_id).await?.balance;
        tracing::info!(user_id, admin = %actor.user_id, %delta, %balance, "balance adjusted");
        Ok(balance)
    }

    pub async fn get_reports(
        &self,
        actor: &Actor,
        status: Option<ReportStatus>,
    ) -> Result<Vec<ReportRecord>, EngineError> {
        actor.require_admin()?;
        Ok(self.storage.list_reports(status).await?)
    }

    /// Audit rows, optionally only those about `subject_id`.
    pub async fn audit_log(
        &self,
        actor: &Actor,
        subject_id: Option<&str>,
    ) -> Result<Vec<AuditRecord>, EngineError> {
        actor.require_admin()?;
        Ok(self.storage.list_audit(subject_id).await?)
    }

    /// Provision a member's ledger row.
    pub async fn open_account(
        &self,
        actor: &Actor,
        user_id: &str,
        role: Role,
        balance: Decimal,
    ) -> Result<AccountRecord, EngineError> {
        actor.require_admin()?;
        if user_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("user id must not be empty".to_string()));
        }
        if balance < Decimal::ZERO {
            return Err(EngineError::InvalidInput(
                "opening balance must not be negative".to_string(),
            ));
        }
        let now = rfc3339(OffsetDateTime::now_utc());
        let account = AccountRecord::new(user_id, role, balance);

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.create_account(&mut snapshot, account.clone()).await?;
            storage
                .insert_audit(
                    &mut snapshot,
                    audit_record(
                        actor,
                        "open_account",
                        user_id,
                        json!({ "role": role, "balance": balance.to_string() }),
                        &now,
                    ),
                )
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        tracing::info!(user_id, admin = %actor.user_id, %balance, "account opened");
        Ok(account)
    }

    /// Create a configured account at startup. Returns `false` if it
    /// already exists, leaving the stored row untouched.
    pub async fn seed_account(&self, account: AccountRecord) -> Result<bool, EngineError> {
        let storage = &*self.storage;
        let user_id = account.user_id.clone();
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage.create_account(&mut snapshot, account).await;
        match finish(storage, snapshot, staged).await {
            Ok(()) => {
                tracing::debug!(user_id, "seeded account");
                Ok(true)
            }
            Err(StorageError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
