use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a handshake.
///
/// `Completed` and `Cancelled` are terminal: a record in either status is
/// never updated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Pending,
    Accepted,
    ProviderConfirmed,
    ReceiverConfirmed,
    Completed,
    Cancelled,
    Disputed,
    Paused,
}

impl HandshakeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeStatus::Completed | HandshakeStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeStatus::Pending => "pending",
            HandshakeStatus::Accepted => "accepted",
            HandshakeStatus::ProviderConfirmed => "provider_confirmed",
            HandshakeStatus::ReceiverConfirmed => "receiver_confirmed",
            HandshakeStatus::Completed => "completed",
            HandshakeStatus::Cancelled => "cancelled",
            HandshakeStatus::Disputed => "disputed",
            HandshakeStatus::Paused => "paused",
        }
    }

    /// Parse the wire name produced by [`HandshakeStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "pending" => HandshakeStatus::Pending,
            "accepted" => HandshakeStatus::Accepted,
            "provider_confirmed" => HandshakeStatus::ProviderConfirmed,
            "receiver_confirmed" => HandshakeStatus::ReceiverConfirmed,
            "completed" => HandshakeStatus::Completed,
            "cancelled" => HandshakeStatus::Cancelled,
            "disputed" => HandshakeStatus::Disputed,
            "paused" => HandshakeStatus::Paused,
            _ => return None,
        };
        Some(status)
    }
}

impl std::fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handshake row as stored in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRecord {
    pub id: String,
    pub service_id: String,
    pub provider_id: String,
    pub receiver_id: String,
    /// The member who expressed interest. Equal to `receiver_id` for offers
    /// and `provider_id` for needs.
    pub requester_id: String,
    pub hours: Decimal,
    pub status: HandshakeStatus,
    pub provider_confirmed: bool,
    pub receiver_confirmed: bool,
    pub scheduled_time: Option<String>,
    /// RFC 3339 timestamp string.
    pub created_at: String,
    /// RFC 3339 timestamp string.
    pub updated_at: String,
    /// RFC 3339 timestamp string. Set when the handshake reaches a terminal status.
    pub resolved_at: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

/// A member's ledger row: balance, reservations, karma and feedback counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user_id: String,
    pub role: Role,
    pub is_active: bool,
    pub balance: Decimal,
    /// Sum of all open reservations held against `balance`.
    pub reserved: Decimal,
    pub karma: i64,
    pub punctual_count: u64,
    pub helpful_count: u64,
    pub kind_count: u64,
    pub version: i64,
}

impl AccountRecord {
    /// A fresh active account with no reservations or counters.
    pub fn new(user_id: &str, role: Role, balance: Decimal) -> Self {
        Self {
            user_id: user_id.to_string(),
            role,
            is_active: true,
            balance,
            reserved: Decimal::ZERO,
            karma: 0,
            punctual_count: 0,
            helpful_count: 0,
            kind_count: 0,
            version: 0,
        }
    }

    /// Balance not held by any reservation.
    pub fn available(&self) -> Decimal {
        self.balance.saturating_sub(self.reserved)
    }
}

/// Hours held against a payer's balance for one handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// The handshake id the hours are held for.
    pub key: String,
    pub user_id: String,
    pub hours: Decimal,
}

/// A settled movement of hours between two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// The handshake id. At most one transfer exists per key.
    pub idempotency_key: String,
    pub from_user: String,
    pub to_user: String,
    pub hours: Decimal,
    /// RFC 3339 timestamp string.
    pub at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    NoShow,
    InappropriateContent,
    Spam,
    ServiceIssue,
    Scam,
    Harassment,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Resolved,
}

impl ReportStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReportStatus::Pending),
            "resolved" => Some(ReportStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    ConfirmNoShow,
    Dismiss,
    None,
}

/// A member report. No-show reports that carry `related_handshake_id` are disputes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: String,
    pub report_type: ReportType,
    pub reporter_id: String,
    pub reported_user_id: Option<String>,
    pub reported_service_id: Option<String>,
    pub related_handshake_id: Option<String>,
    pub description: String,
    pub status: ReportStatus,
    pub resolution_action: ResolutionAction,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    /// RFC 3339 timestamp string.
    pub created_at: String,
    /// RFC 3339 timestamp string.
    pub resolved_at: Option<String>,
    pub version: i64,
}

impl ReportRecord {
    pub fn is_dispute(&self) -> bool {
        self.report_type == ReportType::NoShow && self.related_handshake_id.is_some()
    }
}

/// One rater's feedback on a completed handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub handshake_id: String,
    pub rater_id: String,
    pub rated_id: String,
    pub punctual: bool,
    pub helpful: bool,
    pub kind: bool,
    pub comment: Option<String>,
    /// RFC 3339 timestamp string.
    pub created_at: String,
}

/// Increments applied to an account's feedback counters and karma.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub punctual: u64,
    pub helpful: u64,
    pub kind: u64,
    pub karma: i64,
}

/// A record of a single handshake status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub handshake_id: String,
    pub actor_id: String,
    pub action: String,
    pub from_status: Option<HandshakeStatus>,
    pub to_status: HandshakeStatus,
    pub from_version: i64,
    pub to_version: i64,
    /// RFC 3339 timestamp string.
    pub at: String,
}

/// An administrative action, committed in the same snapshot as its effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub actor_id: String,
    pub action: String,
    pub subject_id: String,
    pub detail: serde_json::Value,
    /// RFC 3339 timestamp string.
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub id: String,
    pub user_id: String,
    pub issued_by: String,
    pub message: String,
    /// RFC 3339 timestamp string.
    pub created_at: String,
}
