//! Background expiry of pending handshakes nobody accepted.

use std::sync::Arc;
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use timebank_storage::{HandshakeQuery, HandshakeRecord, HandshakeStatus, TimebankStorage};
use tokio::task::JoinHandle;

use crate::engine::{Acting, Actor, Engine};
use crate::error::EngineError;
use crate::machine::Action;

impl<S: TimebankStorage> Engine<S> {
    /// Cancel pending handshakes created more than `pending_expiry_secs`
    /// before `now`, releasing their reservations. Does nothing when expiry
    /// is disabled. Returns the handshakes that were cancelled.
    pub async fn expire_stale_pending(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<HandshakeRecord>, EngineError> {
        let Some(secs) = self.policy.pending_expiry_secs else {
            return Ok(Vec::new());
        };
        let age = time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX));
        let Some(cutoff) = now.checked_sub(age) else {
            return Ok(Vec::new());
        };
        let pending = self
            .storage
            .list_handshakes(&HandshakeQuery {
                status: Some(HandshakeStatus::Pending),
                ..HandshakeQuery::default()
            })
            .await?;

        let system = Actor::system();
        let mut expired = Vec::new();
        for handshake in pending {
            let created = match OffsetDateTime::parse(&handshake.created_at, &Rfc3339) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(handshake_id = %handshake.id, error = %e, "unparseable created_at");
                    continue;
                }
            };
            if created > cutoff {
                continue;
            }
            match self
                .drive(&system, &handshake.id, Action::Expire, Acting::Admin, |_: &HandshakeRecord| {
                    Ok(Vec::new())
                })
                .await
            {
                Ok(record) => expired.push(record),
                // Accepted or withdrawn since the listing was read.
                Err(EngineError::InvalidState(_)) => {}
                Err(e) => {
                    tracing::warn!(handshake_id = %handshake.id, error = %e, "expiry failed")
                }
            }
        }
        Ok(expired)
    }
}

/// Run [`Engine::expire_stale_pending`] every `every` until the task is aborted.
pub fn spawn_sweeper<S: TimebankStorage>(engine: Arc<Engine<S>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.expire_stale_pending(OffsetDateTime::now_utc()).await {
                Ok(expired) if !expired.is_empty() => {
                    tracing::info!(count = expired.len(), "expired stale pending handshakes")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "pending sweep failed"),
            }
        }
    })
}
