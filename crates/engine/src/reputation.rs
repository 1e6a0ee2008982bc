//! Feedback on completed handshakes.
//!
//! Each party may rate the other once per handshake. The feedback row and
//! the rated member's counter and karma increments commit together, and the
//! storage uniqueness on `(handshake_id, rater_id)` turns a retried
//! submission into `AlreadyExists` without touching the counters again.

use serde::Deserialize;
use time::OffsetDateTime;
use timebank_storage::{CounterDelta, FeedbackRecord, HandshakeStatus, TimebankStorage};

use crate::engine::{Actor, Engine};
use crate::error::EngineError;
use crate::ledger::finish;
use crate::machine::Party;
use crate::rfc3339;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FeedbackInput {
    #[serde(default)]
    pub punctual: bool,
    #[serde(default)]
    pub helpful: bool,
    #[serde(default)]
    pub kind: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

impl FeedbackInput {
    fn flags(&self) -> u64 {
        [self.punctual, self.helpful, self.kind]
            .iter()
            .filter(|f| **f)
            .count() as u64
    }
}

impl<S: TimebankStorage> Engine<S> {
    /// Rate the counterparty of a completed handshake.
    pub async fn submit_feedback(
        &self,
        actor: &Actor,
        handshake_id: &str,
        input: FeedbackInput,
    ) -> Result<FeedbackRecord, EngineError> {
        actor.require_active()?;
        let handshake = self.storage.get_handshake(handshake_id).await?;
        let rated_id = match Party::of(&handshake, &actor.user_id, actor.role) {
            Party::Provider => handshake.receiver_id.clone(),
            Party::Receiver => handshake.provider_id.clone(),
            Party::Admin | Party::Outsider => {
                return Err(EngineError::Forbidden(format!(
                    "not a party to handshake {handshake_id}"
                )))
            }
        };
        if handshake.status != HandshakeStatus::Completed {
            return Err(EngineError::InvalidState(format!(
                "feedback requires a completed handshake; {handshake_id} is {}",
                handshake.status
            )));
        }

        let delta = CounterDelta {
            punctual: u64::from(input.punctual),
            helpful: u64::from(input.helpful),
            kind: u64::from(input.kind),
            karma: self.policy.feedback_karma_bonus * input.flags() as i64,
        };
        let record = FeedbackRecord {
            handshake_id: handshake.id.clone(),
            rater_id: actor.user_id.clone(),
            rated_id,
            punctual: input.punctual,
            helpful: input.helpful,
            kind: input.kind,
            comment: input.comment,
            created_at: rfc3339(OffsetDateTime::now_utc()),
        };

        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let staged = async {
            storage.insert_feedback(&mut snapshot, record.clone()).await?;
            storage
                .bump_counters(&mut snapshot, &record.rated_id, delta)
                .await
        }
        .await;
        finish(storage, snapshot, staged).await?;

        tracing::info!(
            handshake_id,
            rater = %record.rater_id,
            rated = %record.rated_id,
            karma = delta.karma,
            "feedback recorded"
        );
        Ok(record)
    }

    /// Feedback left on a handshake, visible to its parties and admins.
    pub async fn feedback_for(
        &self,
        actor: &Actor,
        handshake_id: &str,
    ) -> Result<Vec<FeedbackRecord>, EngineError> {
        self.get_handshake(actor, handshake_id).await?;
        Ok(self.storage.list_feedback(handshake_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_counts_set_fields() {
        let input = FeedbackInput {
            punctual: true,
            kind: true,
            ..FeedbackInput::default()
        };
        assert_eq!(input.flags(), 2);
        assert_eq!(FeedbackInput::default().flags(), 0);
    }

    #[test]
    fn missing_flags_deserialize_as_false() {
        let input: FeedbackInput =
            serde_json::from_value(serde_json::json!({"helpful": true})).unwrap();
        assert!(input.helpful);
        assert!(!input.punctual);
        assert!(input.comment.is_none());
    }
}
