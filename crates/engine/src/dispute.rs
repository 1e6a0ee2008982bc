//! Dispute resolution.
//!
//! Admin operations over no-show reports. Pausing and resolving drive the
//! same state machine as member actions, with the admin acting as
//! [`Party::Admin`](crate::machine::Party::Admin). A resolution commits the
//! report update, the handshake transition, its ledger effects, any karma
//! penalty and the audit row in one snapshot. The report update is
//! conditional on the report's version, so of two racing resolutions only
//! one commits; the other finds the handshake terminal and is rejected.

use serde_json::json;
use time::OffsetDateTime;
use timebank_storage::{
    AuditRecord, HandshakeRecord, ReportRecord, ReportStatus, ResolutionAction, StorageError,
    TimebankStorage,
};

use crate::admin::audit_record;
use crate::engine::{Acting, Actor, Companion, Engine};
use crate::error::EngineError;
use crate::events::DomainEvent;
use crate::ledger::finish;
use crate::machine::{Action, NoShowParty, Resolution};
use crate::rfc3339;

impl<S: TimebankStorage> Engine<S> {
    /// Freeze a disputed handshake while an admin investigates.
    pub async fn pause_for_investigation(
        &self,
        actor: &Actor,
        handshake_id: &str,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_admin()?;
        let now = rfc3339(OffsetDateTime::now_utc());
        self.drive(
            actor,
            handshake_id,
            Action::Pause,
            Acting::Admin,
            |current: &HandshakeRecord| {
                Ok(vec![Companion::Audit(audit_record(
                    actor,
                    "pause_for_investigation",
                    &current.id,
                    json!({ "from": current.status }),
                    &now,
                ))])
            },
        )
        .await
    }

    /// Pause the handshake a no-show report disputes.
    pub async fn pause_report(
        &self,
        actor: &Actor,
        report_id: &str,
    ) -> Result<ReportRecord, EngineError> {
        actor.require_admin()?;
        let report = self.storage.get_report(report_id).await?;
        let handshake_id = open_dispute(&report)?;
        self.pause_for_investigation(actor, handshake_id).await?;
        Ok(report)
    }

    /// Resolve the pending no-show dispute on a handshake.
    pub async fn resolve(
        &self,
        actor: &Actor,
        handshake_id: &str,
        action: ResolutionAction,
        notes: Option<String>,
    ) -> Result<ReportRecord, EngineError> {
        actor.require_admin()?;
        let disputes: Vec<ReportRecord> = self
            .storage
            .reports_for_handshake(handshake_id)
            .await?
            .into_iter()
            .filter(ReportRecord::is_dispute)
            .collect();
        match disputes
            .iter()
            .rev()
            .find(|r| r.status == ReportStatus::Pending)
        {
            Some(report) => self.resolve_report(actor, &report.id, action, notes).await,
            None if !disputes.is_empty() => Err(EngineError::InvalidState(format!(
                "the dispute on handshake {handshake_id} is already resolved"
            ))),
            None => Err(EngineError::NotFound(format!(
                "no no-show report for handshake {handshake_id}"
            ))),
        }
    }

    /// Resolve a report.
    ///
    /// For a no-show dispute `action` must be `confirm_no_show` or `dismiss`
    /// and the linked handshake is settled accordingly. Content reports accept
    /// any action and have no ledger effect.
    pub async fn resolve_report(
        &self,
        actor: &Actor,
        report_id: &str,
        action: ResolutionAction,
        notes: Option<String>,
    ) -> Result<ReportRecord, EngineError> {
        actor.require_admin()?;
        let report = self.storage.get_report(report_id).await?;
        if report.status == ReportStatus::Resolved {
            return Err(already_resolved(&report));
        }
        let now = rfc3339(OffsetDateTime::now_utc());
        let resolved = ReportRecord {
            status: ReportStatus::Resolved,
            resolution_action: action,
            resolution_notes: notes,
            resolved_by: Some(actor.user_id.clone()),
            resolved_at: Some(now.clone()),
            version: report.version + 1,
            ..report.clone()
        };
        let audit = audit_record(
            actor,
            "resolve_report",
            &report.id,
            json!({
                "action": action,
                "handshake_id": report.related_handshake_id,
            }),
            &now,
        );

        let handshake_id = match report.related_handshake_id.as_deref() {
            Some(id) if report.is_dispute() => id,
            _ => {
                self.resolve_content_report(&report, resolved.clone(), audit)
                    .await?;
                tracing::info!(report_id, action = ?action, "content report resolved");
                self.events.emit(DomainEvent::ReportResolved {
                    report: resolved.clone(),
                });
                return Ok(resolved);
            }
        };

        let handshake = self.storage.get_handshake(handshake_id).await?;
        let resolution = match action {
            ResolutionAction::ConfirmNoShow => {
                let no_show = if report.reported_user_id.as_deref()
                    == Some(handshake.receiver_id.as_str())
                {
                    NoShowParty::Receiver
                } else {
                    NoShowParty::Provider
                };
                Resolution::ConfirmNoShow(no_show)
            }
            ResolutionAction::Dismiss => Resolution::Dismiss,
            ResolutionAction::None => {
                return Err(EngineError::InvalidInput(
                    "a no-show dispute is resolved with confirm_no_show or dismiss".to_string(),
                ))
            }
        };

        let mut writes = vec![
            Companion::UpdateReport {
                expected_version: report.version,
                record: resolved.clone(),
            },
            Companion::Audit(audit),
        ];
        if resolution == Resolution::Dismiss && self.policy.frivolous_report_penalty != 0 {
            writes.push(Companion::Karma {
                user_id: report.reporter_id.clone(),
                delta: -self.policy.frivolous_report_penalty,
            });
        }

        self.drive(
            actor,
            handshake_id,
            Action::Resolve(resolution),
            Acting::Admin,
            |_: &HandshakeRecord| Ok(writes.clone()),
        )
        .await
        .map_err(|e| match e {
            // The handshake moved on because another resolution won.
            EngineError::InvalidState(_) => already_resolved(&report),
            other => other,
        })?;

        tracing::info!(report_id, handshake_id, action = ?action, "dispute resolved");
        self.events.emit(DomainEvent::ReportResolved {
            report: resolved.clone(),
        });
        Ok(resolved)
    }

    async fn resolve_content_report(
        &self,
        report: &ReportRecord,
        resolved: ReportRecord,
        audit: AuditRecord,
    ) -> Result<(), EngineError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage
                .update_report(&mut snapshot, report.version, resolved)
                .await?;
            storage.insert_audit(&mut snapshot, audit).await
        }
        .await;
        match finish(storage, snapshot, staged).await {
            Ok(()) => Ok(()),
            Err(StorageError::ConcurrentConflict { .. }) => Err(already_resolved(report)),
            Err(e) => Err(e.into()),
        }
    }
}

/// The handshake a pending dispute report refers to.
fn open_dispute(report: &ReportRecord) -> Result<&str, EngineError> {
    if report.status == ReportStatus::Resolved {
        return Err(already_resolved(report));
    }
    match report.related_handshake_id.as_deref() {
        Some(id) if report.is_dispute() => Ok(id),
        _ => Err(EngineError::InvalidState(format!(
            "report {} is not a no-show dispute",
            report.id
        ))),
    }
}

fn already_resolved(report: &ReportRecord) -> EngineError {
    EngineError::InvalidState(format!("report {} is already resolved", report.id))
}
