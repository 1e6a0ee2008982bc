use serde::{Deserialize, Serialize};

/// Tunable constants for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Karma deducted from the party found to have missed a handshake.
    pub no_show_karma_penalty: i64,
    /// Karma deducted from the reporter when a dispute is dismissed.
    pub frivolous_report_penalty: i64,
    /// Karma granted to the rated member per feedback flag set.
    pub feedback_karma_bonus: i64,
    /// Hold the payer's hours when interest is expressed.
    pub reserve_on_interest: bool,
    /// Pending handshakes older than this are cancelled by the sweep.
    /// `None` disables expiry.
    pub pending_expiry_secs: Option<u64>,
    /// Attempts at an optimistic transition before giving up with `Conflict`.
    pub max_conflict_retries: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            no_show_karma_penalty: 5,
            frivolous_report_penalty: 0,
            feedback_karma_bonus: 1,
            reserve_on_interest: true,
            pending_expiry_secs: None,
            max_conflict_retries: 16,
        }
    }
}

impl Policy {
    /// Check that the constants are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.no_show_karma_penalty < 0 {
            return Err("no_show_karma_penalty must not be negative".to_string());
        }
        if self.frivolous_report_penalty < 0 {
            return Err("frivolous_report_penalty must not be negative".to_string());
        }
        if self.feedback_karma_bonus < 0 {
            return Err("feedback_karma_bonus must not be negative".to_string());
        }
        if self.max_conflict_retries == 0 {
            return Err("max_conflict_retries must be at least 1".to_string());
        }
        if self.pending_expiry_secs == Some(0) {
            return Err("pending_expiry_secs must be positive when set".to_string());
        }
        Ok(())
    }
}
