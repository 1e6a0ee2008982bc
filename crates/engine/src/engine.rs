//! Member-facing handshake operations.
//!
//! Every operation that changes a handshake follows the same loop:
//! 1. Read the committed record
//! 2. Ask the state machine for the transition
//! 3. Stage the handshake update (conditional on the version read in 1),
//!    its transition row, the ledger effects and any companion writes into
//!    one snapshot and commit
//! 4. On `ConcurrentConflict`, start again from 1
//!
//! Events are published only after step 3 commits.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use timebank_storage::{
    AccountRecord, AuditRecord, HandshakeQuery, HandshakeRecord, HandshakeStatus, ReportRecord,
    ReportStatus, ReportType, ResolutionAction, Role, StorageError, TimebankStorage,
    TransitionRecord,
};

use crate::catalog::ServiceCatalog;
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink, HandshakeEvent, NoopSink};
use crate::ledger::{self, finish, Ledger};
use crate::machine::{self, Action, Effect, Party, Transition};
use crate::policy::Policy;
use crate::{new_id, rfc3339};

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
    pub is_active: bool,
}

impl Actor {
    pub fn from_account(account: &AccountRecord) -> Self {
        Self {
            user_id: account.user_id.clone(),
            role: account.role,
            is_active: account.is_active,
        }
    }

    /// The engine acting on its own behalf, e.g. the pending-expiry sweep.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            role: Role::Admin,
            is_active: true,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub(crate) fn require_active(&self) -> Result<(), EngineError> {
        if self.is_active {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "account {} is suspended",
                self.user_id
            )))
        }
    }

    pub(crate) fn require_admin(&self) -> Result<(), EngineError> {
        self.require_active()?;
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden(
                "this operation requires an admin".to_string(),
            ))
        }
    }
}

/// Filters accepted by [`Engine::list_handshakes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeFilter {
    pub status: Option<HandshakeStatus>,
    pub service_id: Option<String>,
    /// Maximum number of results (0 = no limit).
    pub limit: usize,
}

/// A content report filed by a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReport {
    pub report_type: ReportType,
    pub reported_user_id: Option<String>,
    pub reported_service_id: Option<String>,
    pub description: String,
}

/// Writes committed alongside a handshake transition.
#[derive(Debug, Clone)]
pub(crate) enum Companion {
    InsertReport(ReportRecord),
    UpdateReport {
        expected_version: i64,
        record: ReportRecord,
    },
    Karma {
        user_id: String,
        delta: i64,
    },
    Audit(AuditRecord),
}

/// Whether the machine sees the caller as a party or as an admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acting {
    Member,
    Admin,
}

/// The handshake engine.
pub struct Engine<S: TimebankStorage> {
    pub(crate) storage: Arc<S>,
    pub(crate) catalog: Arc<dyn ServiceCatalog>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) policy: Policy,
}

impl<S: TimebankStorage> Engine<S> {
    pub fn new(storage: Arc<S>, catalog: Arc<dyn ServiceCatalog>, policy: Policy) -> Self {
        Self {
            storage,
            catalog,
            events: Arc::new(NoopSink),
            policy,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn ledger(&self) -> Ledger<S> {
        Ledger::new(Arc::clone(&self.storage))
    }

    /// Resolve a user id supplied by the authenticating gateway.
    ///
    /// Suspended members still authenticate; their operations are refused
    /// with `Forbidden`.
    pub async fn authenticate(&self, user_id: &str) -> Result<Actor, EngineError> {
        if user_id.is_empty() {
            return Err(EngineError::Unauthenticated(
                "missing user identity".to_string(),
            ));
        }
        match self.storage.get_account(user_id).await {
            Ok(account) => Ok(Actor::from_account(&account)),
            Err(StorageError::NotFound { .. }) => Err(EngineError::Unauthenticated(format!(
                "unknown user {user_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// The caller's own ledger row.
    pub async fn account(&self, actor: &Actor) -> Result<AccountRecord, EngineError> {
        self.ledger().get_account(&actor.user_id).await
    }

    // ── Handshake lifecycle ──────────────────────────────────────────────────

    /// Open a pending handshake on `service_id` with the caller as requester.
    pub async fn express_interest(
        &self,
        actor: &Actor,
        service_id: &str,
        scheduled_time: Option<String>,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_active()?;
        let listing = self
            .catalog
            .get_service(service_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("service not found: {service_id}")))?;
        let now = rfc3339(OffsetDateTime::now_utc());
        let opening = machine::open(&listing, &actor.user_id, new_id(), scheduled_time, &now)?;
        let record = opening.record;

        self.storage.get_account(&record.provider_id).await?;
        let payer = self.storage.get_account(&record.receiver_id).await?;
        let available = payer.available();
        if !self.policy.reserve_on_interest && available < record.hours {
            return Err(EngineError::InsufficientBalance {
                user_id: payer.user_id,
                required: record.hours,
                available,
            });
        }

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.insert_handshake(&mut snapshot, record.clone()).await?;
            storage
                .insert_transition(
                    &mut snapshot,
                    transition_row(&actor.user_id, "express_interest", None, &record, &now),
                )
                .await?;
            ledger::stage_effects(storage, &mut snapshot, &opening.effects, &self.policy, &now)
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        tracing::info!(
            handshake_id = %record.id,
            service_id = %record.service_id,
            actor = %actor.user_id,
            to = %record.status,
            "handshake created"
        );
        self.publish(&opening.events, &record, None);
        Ok(record)
    }

    pub async fn accept(
        &self,
        actor: &Actor,
        handshake_id: &str,
        scheduled_time: Option<String>,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_active()?;
        self.drive(
            actor,
            handshake_id,
            Action::Accept { scheduled_time },
            Acting::Member,
            no_companions,
        )
        .await
    }

    pub async fn decline(
        &self,
        actor: &Actor,
        handshake_id: &str,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_active()?;
        self.drive(
            actor,
            handshake_id,
            Action::Decline,
            Acting::Member,
            no_companions,
        )
        .await
    }

    /// Withdraw the caller's own pending interest.
    pub async fn cancel(
        &self,
        actor: &Actor,
        handshake_id: &str,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_active()?;
        self.drive(
            actor,
            handshake_id,
            Action::Cancel,
            Acting::Member,
            no_companions,
        )
        .await
    }

    /// Record the caller's confirmation that the service took place.
    ///
    /// The second confirmation completes the handshake and settles the hours
    /// in the same commit. Repeating a confirmation is a no-op. If the payer
    /// cannot cover the hours, the confirmation is kept, the handshake stays
    /// uncompleted and `InsufficientBalance` is returned; the next
    /// confirmation by either party retries the settlement.
    pub async fn confirm_complete(
        &self,
        actor: &Actor,
        handshake_id: &str,
        hours: Option<Decimal>,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_active()?;
        self.drive(
            actor,
            handshake_id,
            Action::Confirm { hours },
            Acting::Member,
            no_companions,
        )
        .await
    }

    /// Dispute a handshake, filing a no-show report against the counterparty.
    pub async fn report_no_show(
        &self,
        actor: &Actor,
        handshake_id: &str,
        reason: &str,
    ) -> Result<ReportRecord, EngineError> {
        actor.require_active()?;
        let report_id = new_id();
        let now = rfc3339(OffsetDateTime::now_utc());
        self.drive(
            actor,
            handshake_id,
            Action::ReportNoShow,
            Acting::Member,
            |current: &HandshakeRecord| {
                let reported = if current.provider_id == actor.user_id {
                    &current.receiver_id
                } else {
                    &current.provider_id
                };
                Ok(vec![Companion::InsertReport(ReportRecord {
                    id: report_id.clone(),
                    report_type: ReportType::NoShow,
                    reporter_id: actor.user_id.clone(),
                    reported_user_id: Some(reported.clone()),
                    reported_service_id: Some(current.service_id.clone()),
                    related_handshake_id: Some(current.id.clone()),
                    description: reason.to_string(),
                    status: ReportStatus::Pending,
                    resolution_action: ResolutionAction::None,
                    resolution_notes: None,
                    resolved_by: None,
                    created_at: now.clone(),
                    resolved_at: None,
                    version: 0,
                })])
            },
        )
        .await?;
        Ok(self.storage.get_report(&report_id).await?)
    }

    /// File a content report about a member or a listing. Content reports
    /// never move hours.
    pub async fn file_report(
        &self,
        actor: &Actor,
        report: NewReport,
    ) -> Result<ReportRecord, EngineError> {
        actor.require_active()?;
        if report.reported_user_id.is_none() && report.reported_service_id.is_none() {
            return Err(EngineError::InvalidInput(
                "a report must name a user or a service".to_string(),
            ));
        }
        if let Some(user_id) = &report.reported_user_id {
            self.storage.get_account(user_id).await?;
        }
        let record = ReportRecord {
            id: new_id(),
            report_type: report.report_type,
            reporter_id: actor.user_id.clone(),
            reported_user_id: report.reported_user_id,
            reported_service_id: report.reported_service_id,
            related_handshake_id: None,
            description: report.description,
            status: ReportStatus::Pending,
            resolution_action: ResolutionAction::None,
            resolution_notes: None,
            resolved_by: None,
            created_at: rfc3339(OffsetDateTime::now_utc()),
            resolved_at: None,
            version: 0,
        };
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = storage.insert_report(&mut snapshot, record.clone()).await;
        finish(storage, snapshot, staged).await?;
        tracing::info!(report_id = %record.id, reporter = %actor.user_id, "report filed");
        Ok(record)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// A handshake visible to the caller: parties and admins only.
    pub async fn get_handshake(
        &self,
        actor: &Actor,
        handshake_id: &str,
    ) -> Result<HandshakeRecord, EngineError> {
        actor.require_active()?;
        let record = self.storage.get_handshake(handshake_id).await?;
        if Party::of(&record, &actor.user_id, actor.role) == Party::Outsider {
            return Err(EngineError::Forbidden(format!(
                "not a party to handshake {handshake_id}"
            )));
        }
        Ok(record)
    }

    /// Members see the handshakes they take part in; admins see all.
    pub async fn list_handshakes(
        &self,
        actor: &Actor,
        filter: HandshakeFilter,
    ) -> Result<Vec<HandshakeRecord>, EngineError> {
        actor.require_active()?;
        let query = HandshakeQuery {
            participant: (!actor.is_admin()).then(|| actor.user_id.clone()),
            service_id: filter.service_id,
            status: filter.status,
            limit: filter.limit,
        };
        Ok(self.storage.list_handshakes(&query).await?)
    }

    /// Status history of a handshake, oldest first.
    pub async fn transitions(
        &self,
        actor: &Actor,
        handshake_id: &str,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        self.get_handshake(actor, handshake_id).await?;
        Ok(self.storage.list_transitions(handshake_id).await?)
    }

    // ── Transition loop ──────────────────────────────────────────────────────

    /// Apply `action` to a handshake, retrying on concurrent modification.
    ///
    /// `companions` is called once per attempt with the record the attempt
    /// read, and its writes commit in the same snapshot as the transition.
    pub(crate) async fn drive<F>(
        &self,
        actor: &Actor,
        handshake_id: &str,
        action: Action,
        acting: Acting,
        companions: F,
    ) -> Result<HandshakeRecord, EngineError>
    where
        F: Fn(&HandshakeRecord) -> Result<Vec<Companion>, EngineError> + Send + Sync,
    {
        let attempts = self.policy.max_conflict_retries.max(1);
        for attempt in 1..=attempts {
            let now = rfc3339(OffsetDateTime::now_utc());
            let current = self.storage.get_handshake(handshake_id).await?;
            let party = match acting {
                Acting::Member => Party::of(&current, &actor.user_id, actor.role),
                Acting::Admin => Party::Admin,
            };
            let (next, effects, events, fallback) =
                match machine::transition(&current, &action, party, &now)? {
                    Transition::Unchanged => return Ok(current),
                    Transition::Step {
                        next,
                        effects,
                        events,
                        fallback,
                    } => (next, effects, events, fallback),
                };
            let writes = companions(&current)?;
            let report_id = writes.iter().find_map(|c| match c {
                Companion::InsertReport(report) => Some(report.id.clone()),
                _ => None,
            });

            let committed = self
                .commit_step(actor, &action, &current, next, &effects, writes, &now)
                .await;
            match (committed, fallback) {
                (Ok(record), _) => {
                    tracing::info!(
                        handshake_id = %record.id,
                        from = %current.status,
                        to = %record.status,
                        actor = %actor.user_id,
                        action = action.name(),
                        "handshake transition"
                    );
                    self.publish(&events, &record, report_id);
                    return Ok(record);
                }
                (Err(StorageError::ConcurrentConflict { .. }), _) => {
                    tracing::debug!(handshake_id, attempt, "conflicting update, retrying");
                }
                (
                    Err(StorageError::InsufficientBalance {
                        user_id,
                        required,
                        available,
                    }),
                    Some(fallback),
                ) => {
                    tracing::warn!(
                        handshake_id,
                        payer = %user_id,
                        %required,
                        %available,
                        "settlement stalled for lack of balance"
                    );
                    match self
                        .commit_step(actor, &action, &current, fallback, &[], Vec::new(), &now)
                        .await
                    {
                        Ok(_) => {
                            return Err(EngineError::InsufficientBalance {
                                user_id,
                                required,
                                available,
                            })
                        }
                        Err(StorageError::ConcurrentConflict { .. }) => {
                            tracing::debug!(handshake_id, attempt, "conflicting update, retrying");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                (Err(e), _) => {
                    if !matches!(e, StorageError::InsufficientBalance { .. }) {
                        tracing::warn!(handshake_id, error = %e, "transition failed");
                    }
                    return Err(e.into());
                }
            }
        }
        Err(EngineError::Conflict(format!(
            "handshake {handshake_id} kept changing; gave up after {attempts} attempts"
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_step(
        &self,
        actor: &Actor,
        action: &Action,
        current: &HandshakeRecord,
        next: HandshakeRecord,
        effects: &[Effect],
        companions: Vec<Companion>,
        now: &str,
    ) -> Result<HandshakeRecord, StorageError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            let version = storage
                .update_handshake(&mut snapshot, current.version, next.clone())
                .await?;
            let record = HandshakeRecord { version, ..next };
            storage
                .insert_transition(
                    &mut snapshot,
                    transition_row(&actor.user_id, action.name(), Some(current), &record, now),
                )
                .await?;
            ledger::stage_effects(storage, &mut snapshot, effects, &self.policy, now).await?;
            for companion in companions {
                stage_companion(storage, &mut snapshot, companion).await?;
            }
            Ok::<_, StorageError>(record)
        }
        .await;
        finish(storage, snapshot, staged).await
    }

    fn publish(&self, events: &[HandshakeEvent], record: &HandshakeRecord, report_id: Option<String>) {
        for event in events {
            let event = match (event, &report_id) {
                (HandshakeEvent::Disputed, Some(id)) => DomainEvent::HandshakeDisputed {
                    handshake: record.clone(),
                    report_id: Some(id.clone()),
                },
                _ => DomainEvent::handshake(*event, record.clone()),
            };
            self.events.emit(event);
        }
    }
}

fn no_companions(_: &HandshakeRecord) -> Result<Vec<Companion>, EngineError> {
    Ok(Vec::new())
}

async fn stage_companion<S: TimebankStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    companion: Companion,
) -> Result<(), StorageError> {
    match companion {
        Companion::InsertReport(record) => storage.insert_report(snapshot, record).await,
        Companion::UpdateReport {
            expected_version,
            record,
        } => storage
            .update_report(snapshot, expected_version, record)
            .await
            .map(|_| ()),
        Companion::Karma { user_id, delta } => storage.adjust_karma(snapshot, &user_id, delta).await,
        Companion::Audit(record) => storage.insert_audit(snapshot, record).await,
    }
}

fn transition_row(
    actor_id: &str,
    action: &str,
    from: Option<&HandshakeRecord>,
    to: &HandshakeRecord,
    now: &str,
) -> TransitionRecord {
    TransitionRecord {
        id: new_id(),
        handshake_id: to.id.clone(),
        actor_id: actor_id.to_string(),
        action: action.to_string(),
        from_status: from.map(|h| h.status),
        to_status: to.status,
        from_version: from.map_or(0, |h| h.version),
        to_version: to.version,
        at: now.to_string(),
    }
}
