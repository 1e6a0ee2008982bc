//! Handshake repository conformance tests: versioned updates and the
//! open-interest uniqueness constraint.

use std::future::Future;

use super::{expect_eq, make_handshake, seed_handshake, TestResult};
use crate::record::HandshakeStatus;
use crate::{HandshakeQuery, StorageError, TimebankStorage};

pub(super) async fn run_handshake_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "handshake",
            "update_increments_version",
            update_increments_version(factory).await,
        ),
        TestResult::from_result(
            "handshake",
            "stale_version_conflicts",
            stale_version_conflicts(factory).await,
        ),
        TestResult::from_result(
            "handshake",
            "duplicate_open_interest_rejected",
            duplicate_open_interest_rejected(factory).await,
        ),
        TestResult::from_result(
            "handshake",
            "list_filters_by_participant_and_status",
            list_filters_by_participant_and_status(factory).await,
        ),
    ]
}

async fn update_increments_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_handshake(&storage, make_handshake("hs-1", "svc-1", "alice")).await?;

    let mut record = storage
        .get_handshake("hs-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    record.status = HandshakeStatus::Accepted;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let new_version = storage
        .update_handshake(&mut snap, 0, record)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    expect_eq("returned version", new_version, 1)?;
    let stored = storage
        .get_handshake("hs-1")
        .await
        .map_err(|e| format!("get after commit: {e}"))?;
    expect_eq("stored version", stored.version, 1)?;
    expect_eq("stored status", stored.status, HandshakeStatus::Accepted)
}

async fn stale_version_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_handshake(&storage, make_handshake("hs-1", "svc-1", "alice")).await?;
    let record = storage
        .get_handshake("hs-1")
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let staged = storage.update_handshake(&mut snap, 5, record).await;
    let outcome = match staged {
        Ok(_) => storage.commit_snapshot(snap).await,
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::ConcurrentConflict {
            expected_version, ..
        }) => expect_eq("expected_version", expected_version, 5),
        Ok(()) => Err("stale update committed".to_string()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
    }
}

async fn duplicate_open_interest_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_handshake(&storage, make_handshake("hs-1", "svc-1", "alice")).await?;

    match seed_handshake(&storage, make_handshake("hs-2", "svc-1", "alice")).await {
        Err(msg) if msg.contains("already exists") => {}
        Ok(()) => return Err("second open interest committed".to_string()),
        Err(msg) => return Err(format!("expected AlreadyExists, got {msg}")),
    }

    // A different requester on the same service is fine.
    seed_handshake(&storage, make_handshake("hs-3", "svc-1", "carol")).await
}

async fn list_filters_by_participant_and_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_handshake(&storage, make_handshake("hs-1", "svc-1", "alice")).await?;
    seed_handshake(&storage, make_handshake("hs-2", "svc-2", "carol")).await?;

    let alice = storage
        .list_handshakes(&HandshakeQuery {
            participant: Some("alice".to_string()),
            ..Default::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    expect_eq("alice handshakes", alice.len(), 1)?;

    let provider = storage
        .list_handshakes(&HandshakeQuery {
            participant: Some("provider".to_string()),
            status: Some(HandshakeStatus::Pending),
            ..Default::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    expect_eq("provider pending handshakes", provider.len(), 2)?;

    let accepted = storage
        .list_handshakes(&HandshakeQuery {
            status: Some(HandshakeStatus::Accepted),
            ..Default::default()
        })
        .await
        .map_err(|e| format!("list: {e}"))?;
    expect_eq("accepted handshakes", accepted.len(), 0)
}
