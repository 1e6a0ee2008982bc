//! Handshake state machine.
//!
//! Pure transition logic: given the current handshake record, an action and
//! the caller's relation to the handshake, compute the next record together
//! with the ledger effects and events the change implies, or reject the
//! action. Nothing here touches storage; the engine applies a [`Transition`]
//! inside a single snapshot.
//!
//! Transitions:
//!
//! | From | Action | Party | To |
//! |---|---|---|---|
//! | pending | accept | owner | accepted |
//! | pending | decline | owner | cancelled |
//! | pending | cancel | requester | cancelled |
//! | pending | expire | admin (sweep) | cancelled |
//! | accepted, *_confirmed | confirm | provider / receiver | *_confirmed or completed |
//! | pending, accepted, stalled | report no-show | provider / receiver | disputed |
//! | disputed | pause | admin | paused |
//! | disputed, paused | resolve | admin | completed or cancelled |

use rust_decimal::Decimal;
use timebank_storage::{HandshakeRecord, HandshakeStatus, Role};

use crate::catalog::ServiceListing;
use crate::events::HandshakeEvent;

// ──────────────────────────────────────────────
// Types
// ──────────────────────────────────────────────

/// Why the machine rejected an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Forbidden(String),
}

/// The caller's relation to a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Provider,
    Receiver,
    /// An admin who is not a party to the handshake, or the system itself.
    Admin,
    Outsider,
}

impl Party {
    /// Resolve a member's relation to `record`. An admin who is also a
    /// party is treated as that party.
    pub fn of(record: &HandshakeRecord, user_id: &str, role: Role) -> Party {
        if record.provider_id == user_id {
            Party::Provider
        } else if record.receiver_id == user_id {
            Party::Receiver
        } else if role == Role::Admin {
            Party::Admin
        } else {
            Party::Outsider
        }
    }

    fn user_id<'a>(&self, record: &'a HandshakeRecord) -> Option<&'a str> {
        match self {
            Party::Provider => Some(&record.provider_id),
            Party::Receiver => Some(&record.receiver_id),
            Party::Admin | Party::Outsider => None,
        }
    }
}

/// Which side of a disputed handshake failed to show up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoShowParty {
    Provider,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ConfirmNoShow(NoShowParty),
    Dismiss,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Accept { scheduled_time: Option<String> },
    Decline,
    Cancel,
    Expire,
    Confirm { hours: Option<Decimal> },
    ReportNoShow,
    Pause,
    Resolve(Resolution),
}

impl Action {
    /// Name recorded in the transition history.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Accept { .. } => "accept",
            Action::Decline => "decline",
            Action::Cancel => "cancel",
            Action::Expire => "expire",
            Action::Confirm { .. } => "confirm_complete",
            Action::ReportNoShow => "report_no_show",
            Action::Pause => "pause_for_investigation",
            Action::Resolve(Resolution::ConfirmNoShow(_)) => "resolve_confirm_no_show",
            Action::Resolve(Resolution::Dismiss) => "resolve_dismiss",
        }
    }
}

/// A ledger side effect of a transition, keyed by the handshake id.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hold `hours` of the payer's balance.
    Reserve {
        key: String,
        user_id: String,
        hours: Decimal,
    },
    /// Drop the hold, if any.
    Release { key: String },
    /// Move `hours` from the payer to the provider, consuming the hold.
    Settle {
        key: String,
        from_user: String,
        to_user: String,
        hours: Decimal,
    },
    /// Apply the no-show karma penalty to `user_id`.
    Penalize { user_id: String },
}

/// Outcome of a valid action.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The action was already applied; nothing to persist.
    Unchanged,
    Step {
        next: HandshakeRecord,
        effects: Vec<Effect>,
        events: Vec<HandshakeEvent>,
        /// Record to persist instead of `next` when settlement fails for
        /// lack of balance: the confirmation is kept, completion is not.
        fallback: Option<HandshakeRecord>,
    },
}

/// A newly created handshake and the effects of creating it.
#[derive(Debug, Clone, PartialEq)]
pub struct Opening {
    pub record: HandshakeRecord,
    pub effects: Vec<Effect>,
    pub events: Vec<HandshakeEvent>,
}

// ──────────────────────────────────────────────
// Creation
// ──────────────────────────────────────────────

/// Express interest in `listing` on behalf of `requester_id`.
///
/// The receiver is always the payer, so the reservation is taken from the
/// receiver whichever side the requester ends up on.
pub fn open(
    listing: &ServiceListing,
    requester_id: &str,
    handshake_id: String,
    scheduled_time: Option<String>,
    now: &str,
) -> Result<Opening, MachineError> {
    if listing.owner_id == requester_id {
        return Err(MachineError::InvalidState(
            "cannot express interest in your own service".to_string(),
        ));
    }
    if listing.hours <= Decimal::ZERO {
        return Err(MachineError::InvalidState(format!(
            "service {} has no positive hour amount",
            listing.id
        )));
    }
    let (provider_id, receiver_id) = listing.parties(requester_id);
    let record = HandshakeRecord {
        id: handshake_id,
        service_id: listing.id.clone(),
        provider_id,
        receiver_id,
        requester_id: requester_id.to_string(),
        hours: listing.hours,
        status: HandshakeStatus::Pending,
        provider_confirmed: false,
        receiver_confirmed: false,
        scheduled_time,
        created_at: now.to_string(),
        updated_at: now.to_string(),
        resolved_at: None,
        version: 0,
    };
    let effects = vec![Effect::Reserve {
        key: record.id.clone(),
        user_id: record.receiver_id.clone(),
        hours: record.hours,
    }];
    Ok(Opening {
        record,
        effects,
        events: vec![HandshakeEvent::Created],
    })
}

// ──────────────────────────────────────────────
// Transitions
// ──────────────────────────────────────────────

/// Compute the result of applying `action` to `current` as `party`.
pub fn transition(
    current: &HandshakeRecord,
    action: &Action,
    party: Party,
    now: &str,
) -> Result<Transition, MachineError> {
    match action {
        Action::Accept { scheduled_time } => accept(current, scheduled_time.as_deref(), party, now),
        Action::Decline => {
            require_owner(current, party, "decline")?;
            cancel_pending(current, action, now)
        }
        Action::Cancel => {
            if party.user_id(current) != Some(current.requester_id.as_str()) {
                return Err(MachineError::Forbidden(
                    "only the requester may withdraw interest".to_string(),
                ));
            }
            cancel_pending(current, action, now)
        }
        Action::Expire => {
            require_admin(party, "expire a handshake")?;
            cancel_pending(current, action, now)
        }
        Action::Confirm { hours } => confirm(current, *hours, party, now),
        Action::ReportNoShow => report_no_show(current, party, now),
        Action::Pause => {
            require_admin(party, "pause a dispute")?;
            match current.status {
                HandshakeStatus::Disputed => Ok(step(
                    advance(current, HandshakeStatus::Paused, now),
                    Vec::new(),
                    vec![HandshakeEvent::Paused],
                )),
                HandshakeStatus::Paused => Ok(Transition::Unchanged),
                _ => Err(not_allowed(current, action)),
            }
        }
        Action::Resolve(resolution) => resolve(current, *resolution, party, now),
    }
}

fn accept(
    current: &HandshakeRecord,
    scheduled_time: Option<&str>,
    party: Party,
    now: &str,
) -> Result<Transition, MachineError> {
    require_owner(current, party, "accept")?;
    match current.status {
        HandshakeStatus::Pending => {
            let mut next = advance(current, HandshakeStatus::Accepted, now);
            if let Some(time) = scheduled_time {
                next.scheduled_time = Some(time.to_string());
            }
            Ok(step(next, Vec::new(), vec![HandshakeEvent::Accepted]))
        }
        HandshakeStatus::Accepted => Ok(Transition::Unchanged),
        _ => Err(not_allowed(
            current,
            &Action::Accept {
                scheduled_time: None,
            },
        )),
    }
}

fn cancel_pending(
    current: &HandshakeRecord,
    action: &Action,
    now: &str,
) -> Result<Transition, MachineError> {
    if current.status != HandshakeStatus::Pending {
        return Err(not_allowed(current, action));
    }
    Ok(step(
        advance(current, HandshakeStatus::Cancelled, now),
        vec![release(current)],
        vec![HandshakeEvent::Cancelled],
    ))
}

fn confirm(
    current: &HandshakeRecord,
    hours: Option<Decimal>,
    party: Party,
    now: &str,
) -> Result<Transition, MachineError> {
    let as_provider = match party {
        Party::Provider => true,
        Party::Receiver => false,
        Party::Admin | Party::Outsider => {
            return Err(MachineError::Forbidden(
                "only the provider or the receiver may confirm completion".to_string(),
            ))
        }
    };
    let own_flag = if as_provider {
        current.provider_confirmed
    } else {
        current.receiver_confirmed
    };
    match current.status {
        HandshakeStatus::Completed if own_flag => return Ok(Transition::Unchanged),
        HandshakeStatus::Accepted
        | HandshakeStatus::ProviderConfirmed
        | HandshakeStatus::ReceiverConfirmed => {}
        _ => return Err(not_allowed(current, &Action::Confirm { hours: None })),
    }

    let stalled = current.provider_confirmed && current.receiver_confirmed;
    if own_flag && !stalled {
        return Ok(Transition::Unchanged);
    }

    // Only a confirmation that changes the record is checked against the agreed hours.
    if let Some(hours) = hours {
        if hours != current.hours {
            return Err(MachineError::InvalidState(format!(
                "confirmed hours {hours} differ from the agreed {}",
                current.hours
            )));
        }
    }

    let mut confirmed = current.clone();
    confirmed.updated_at = now.to_string();
    if as_provider {
        confirmed.provider_confirmed = true;
    } else {
        confirmed.receiver_confirmed = true;
    }

    if confirmed.provider_confirmed && confirmed.receiver_confirmed {
        // Stalled retries have already persisted both flags.
        let fallback = (!stalled).then(|| confirmed.clone());
        return Ok(Transition::Step {
            next: advance(&confirmed, HandshakeStatus::Completed, now),
            effects: vec![settle(current)],
            events: vec![HandshakeEvent::Completed],
            fallback,
        });
    }

    confirmed.status = if as_provider {
        HandshakeStatus::ProviderConfirmed
    } else {
        HandshakeStatus::ReceiverConfirmed
    };
    Ok(step(confirmed, Vec::new(), Vec::new()))
}

fn report_no_show(
    current: &HandshakeRecord,
    party: Party,
    now: &str,
) -> Result<Transition, MachineError> {
    if !matches!(party, Party::Provider | Party::Receiver) {
        return Err(MachineError::Forbidden(
            "only a party to the handshake may report a no-show".to_string(),
        ));
    }
    let stalled = current.provider_confirmed
        && current.receiver_confirmed
        && !current.status.is_terminal();
    let open = matches!(
        current.status,
        HandshakeStatus::Pending | HandshakeStatus::Accepted
    );
    if !open && !stalled {
        return Err(not_allowed(current, &Action::ReportNoShow));
    }
    Ok(step(
        advance(current, HandshakeStatus::Disputed, now),
        Vec::new(),
        vec![HandshakeEvent::Disputed],
    ))
}

fn resolve(
    current: &HandshakeRecord,
    resolution: Resolution,
    party: Party,
    now: &str,
) -> Result<Transition, MachineError> {
    require_admin(party, "resolve a dispute")?;
    if !matches!(
        current.status,
        HandshakeStatus::Disputed | HandshakeStatus::Paused
    ) {
        return Err(not_allowed(current, &Action::Resolve(resolution)));
    }
    let completed = || advance(current, HandshakeStatus::Completed, now);
    let transition = match resolution {
        Resolution::ConfirmNoShow(NoShowParty::Receiver) => step(
            completed(),
            vec![
                settle(current),
                Effect::Penalize {
                    user_id: current.receiver_id.clone(),
                },
            ],
            vec![HandshakeEvent::Completed],
        ),
        Resolution::ConfirmNoShow(NoShowParty::Provider) => step(
            advance(current, HandshakeStatus::Cancelled, now),
            vec![
                release(current),
                Effect::Penalize {
                    user_id: current.provider_id.clone(),
                },
            ],
            vec![HandshakeEvent::Cancelled],
        ),
        Resolution::Dismiss => step(
            completed(),
            vec![settle(current)],
            vec![HandshakeEvent::Completed],
        ),
    };
    Ok(transition)
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn step(next: HandshakeRecord, effects: Vec<Effect>, events: Vec<HandshakeEvent>) -> Transition {
    Transition::Step {
        next,
        effects,
        events,
        fallback: None,
    }
}

/// Copy `current` into `status`, stamping `updated_at` and, for terminal
/// statuses, `resolved_at`.
fn advance(current: &HandshakeRecord, status: HandshakeStatus, now: &str) -> HandshakeRecord {
    let mut next = current.clone();
    next.status = status;
    next.updated_at = now.to_string();
    if status.is_terminal() {
        next.resolved_at = Some(now.to_string());
    }
    next
}

fn settle(record: &HandshakeRecord) -> Effect {
    Effect::Settle {
        key: record.id.clone(),
        from_user: record.receiver_id.clone(),
        to_user: record.provider_id.clone(),
        hours: record.hours,
    }
}

fn release(record: &HandshakeRecord) -> Effect {
    Effect::Release {
        key: record.id.clone(),
    }
}

/// The owner is whichever party did not express interest.
fn require_owner(current: &HandshakeRecord, party: Party, verb: &str) -> Result<(), MachineError> {
    match party.user_id(current) {
        Some(id) if id != current.requester_id => Ok(()),
        _ => Err(MachineError::Forbidden(format!(
            "only the service owner may {verb} this handshake"
        ))),
    }
}

fn require_admin(party: Party, what: &str) -> Result<(), MachineError> {
    if party == Party::Admin {
        Ok(())
    } else {
        Err(MachineError::Forbidden(format!("only an admin may {what}")))
    }
}

fn not_allowed(current: &HandshakeRecord, action: &Action) -> MachineError {
    MachineError::InvalidState(format!(
        "cannot {} handshake {} in status {}",
        action.name(),
        current.id,
        current.status
    ))
}
