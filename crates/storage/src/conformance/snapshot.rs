//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! committed writes are visible, aborted writes are discarded, and a commit
//! that fails part-way applies nothing.

use std::future::Future;

use rust_decimal::Decimal;

use super::{expect_eq, make_handshake, make_transfer, seed_accounts, TestResult};
use crate::record::ReservationRecord;
use crate::{StorageError, TimebankStorage};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "empty_snapshot_commits",
            empty_snapshot_commits(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_handshake_invisible",
            uncommitted_handshake_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "aborted_handshake_invisible",
            aborted_handshake_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "failed_commit_applies_nothing",
            failed_commit_applies_nothing(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "staged_mutations_apply_in_order",
            staged_mutations_apply_in_order(factory).await,
        ),
    ]
}

async fn empty_snapshot_commits<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

/// A handshake staged but not committed cannot be read.
async fn uncommitted_handshake_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_handshake(&mut snap, make_handshake("hs-1", "svc-1", "alice"))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    match storage.get_handshake("hs-1").await {
        Err(StorageError::NotFound { .. }) => {}
        Ok(_) => return Err("uncommitted handshake was visible".to_string()),
        Err(e) => return Err(format!("unexpected error: {e}")),
    }

    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let stored = storage
        .get_handshake("hs-1")
        .await
        .map_err(|e| format!("get after commit: {e}"))?;
    expect_eq("version", stored.version, 0)
}

async fn aborted_handshake_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_handshake(&mut snap, make_handshake("hs-1", "svc-1", "alice"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    match storage.get_handshake("hs-1").await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        Ok(_) => Err("aborted handshake was visible".to_string()),
        Err(e) => Err(format!("unexpected error: {e}")),
    }
}

/// A snapshot whose last mutation fails must not leave its earlier
/// mutations behind.
async fn failed_commit_applies_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 1), ("bob", 0)]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_handshake(&mut snap, make_handshake("hs-1", "svc-1", "alice"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .adjust_karma(&mut snap, "bob", 7)
        .await
        .map_err(|e| format!("karma: {e}"))?;
    let staged = storage
        .transfer(&mut snap, make_transfer("hs-1", "alice", "bob", 5))
        .await;
    let outcome = match staged {
        Ok(()) => storage.commit_snapshot(snap).await,
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match outcome {
        Err(StorageError::InsufficientBalance { .. }) => {}
        Ok(()) => return Err("overdraft transfer committed".to_string()),
        Err(e) => return Err(format!("expected InsufficientBalance, got {e}")),
    }

    if storage.get_handshake("hs-1").await.is_ok() {
        return Err("handshake from failed snapshot is visible".to_string());
    }
    let bob = storage
        .get_account("bob")
        .await
        .map_err(|e| format!("get bob: {e}"))?;
    expect_eq("bob karma", bob.karma, 0)?;
    expect_eq("bob balance", bob.balance, Decimal::ZERO)
}

/// Later mutations in a snapshot observe the effects of earlier ones.
async fn staged_mutations_apply_in_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 0), ("bob", 0)]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .adjust_balance(&mut snap, "alice", Decimal::from(3))
        .await
        .map_err(|e| format!("adjust: {e}"))?;
    storage
        .reserve(
            &mut snap,
            ReservationRecord {
                key: "hs-1".to_string(),
                user_id: "alice".to_string(),
                hours: Decimal::from(2),
            },
        )
        .await
        .map_err(|e| format!("reserve: {e}"))?;
    storage
        .transfer(&mut snap, make_transfer("hs-1", "alice", "bob", 2))
        .await
        .map_err(|e| format!("transfer: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get alice: {e}"))?;
    expect_eq("alice balance", alice.balance, Decimal::ONE)?;
    expect_eq("alice reserved", alice.reserved, Decimal::ZERO)
}
