use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;

use super::{expect_eq, make_handshake, make_transfer, seed_accounts, seed_handshake, TestResult};
use crate::record::HandshakeStatus;
use crate::{StorageError, TimebankStorage};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_updates_exactly_one_wins",
            concurrent_updates_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_transfers_same_payer_lose_no_update",
            concurrent_transfers_same_payer_lose_no_update(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_transfer_replays_apply_once",
            concurrent_transfer_replays_apply_once(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_overdraft_never_goes_negative",
            concurrent_overdraft_never_goes_negative(factory).await,
        ),
    ]
}

// ── Concurrent update: exactly one wins ─────────────────────────────────────

/// N tasks each read version 0 of the same handshake and try to move it on.
/// Exactly one commit succeeds; the rest must see ConcurrentConflict, either
/// when staging or when committing.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_handshake(&*storage, make_handshake("hs-1", "svc-1", "alice")).await?;
    let base = storage
        .get_handshake("hs-1")
        .await
        .map_err(|e| format!("get: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let mut record = base.clone();
        record.status = HandshakeStatus::Accepted;
        record.scheduled_time = Some(format!("slot-{i}"));
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let staged = s.update_handshake(&mut snap, 0, record).await;
            let outcome = match staged {
                Ok(_) => s.commit_snapshot(snap).await,
                Err(e) => {
                    s.abort_snapshot(snap).await?;
                    Err(e)
                }
            };
            match outcome {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    let stored = storage
        .get_handshake("hs-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    expect_eq("final version", stored.version, 1)
}

// ── Same payer, distinct transfers: no lost update ──────────────────────────

/// N unrelated transfers from one payer race each other. Every one succeeds
/// and the payer's balance reflects all of them.
async fn concurrent_transfers_same_payer_lose_no_update<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_accounts(&*storage, &[("alice", N as i64), ("bob", 0), ("carol", 0)]).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let payee = if i % 2 == 0 { "bob" } else { "carol" };
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.transfer(&mut snap, make_transfer(&format!("hs-{i}"), "alice", payee, 1))
                .await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("transfer failed: {e}"))?;
    }

    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get alice: {e}"))?;
    let bob = storage
        .get_account("bob")
        .await
        .map_err(|e| format!("get bob: {e}"))?;
    let carol = storage
        .get_account("carol")
        .await
        .map_err(|e| format!("get carol: {e}"))?;
    expect_eq("alice balance", alice.balance, Decimal::ZERO)?;
    expect_eq(
        "total received",
        bob.balance + carol.balance,
        Decimal::from(N as i64),
    )
}

// ── Same key replayed concurrently: applied once ────────────────────────────

async fn concurrent_transfer_replays_apply_once<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_accounts(&*storage, &[("alice", 5), ("bob", 0)]).await?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.transfer(&mut snap, make_transfer("hs-1", "alice", "bob", 2))
                .await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("transfer failed: {e}"))?;
    }

    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get alice: {e}"))?;
    expect_eq("alice balance", alice.balance, Decimal::from(3))
}

// ── Racing overdraft: never negative ────────────────────────────────────────

/// N transfers of 1 hour race against a balance of 3. Exactly 3 succeed.
async fn concurrent_overdraft_never_goes_negative<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_accounts(&*storage, &[("alice", 3), ("bob", 0)]).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.transfer(&mut snap, make_transfer(&format!("hs-{i}"), "alice", "bob", 1))
                .await?;
            match s.commit_snapshot(snap).await {
                Ok(()) => Ok(true),
                Err(StorageError::InsufficientBalance { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut applied = 0usize;
    for handle in handles {
        if handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?
        {
            applied += 1;
        }
    }

    expect_eq("applied transfers", applied, 3)?;
    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get alice: {e}"))?;
    expect_eq("alice balance", alice.balance, Decimal::ZERO)
}
