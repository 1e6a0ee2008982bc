//! Ledger conformance tests: reservations, idempotent transfers, overdraft
//! refusal, and counter/karma accumulation.

use std::future::Future;

use rust_decimal::Decimal;

use super::{expect_eq, make_transfer, seed_accounts, TestResult};
use crate::record::{CounterDelta, ReservationRecord};
use crate::{StorageError, TimebankStorage};

pub(super) async fn run_ledger_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "ledger",
            "reserve_beyond_available_fails",
            reserve_beyond_available_fails(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "release_is_idempotent",
            release_is_idempotent(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "transfer_replay_is_noop",
            transfer_replay_is_noop(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "transfer_overdraft_rejected",
            transfer_overdraft_rejected(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "adjust_balance_below_zero_rejected",
            adjust_balance_below_zero_rejected(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "adjust_balance_keeps_holds_covered",
            adjust_balance_keeps_holds_covered(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "balance_overflow_rejected",
            balance_overflow_rejected(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "counters_and_karma_accumulate",
            counters_and_karma_accumulate(factory).await,
        ),
    ]
}

fn reservation(key: &str, user: &str, hours: i64) -> ReservationRecord {
    ReservationRecord {
        key: key.to_string(),
        user_id: user.to_string(),
        hours: Decimal::from(hours),
    }
}

/// Stage a single reservation and commit it, returning the commit outcome.
async fn commit_reserve<S: TimebankStorage>(
    storage: &S,
    record: ReservationRecord,
) -> Result<(), StorageError> {
    let mut snap = storage.begin_snapshot().await?;
    storage.reserve(&mut snap, record).await?;
    storage.commit_snapshot(snap).await
}

async fn commit_transfer<S: TimebankStorage>(
    storage: &S,
    key: &str,
    from: &str,
    to: &str,
    hours: i64,
) -> Result<(), StorageError> {
    let mut snap = storage.begin_snapshot().await?;
    storage
        .transfer(&mut snap, make_transfer(key, from, to, hours))
        .await?;
    storage.commit_snapshot(snap).await
}

async fn reserve_beyond_available_fails<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 3)]).await?;

    commit_reserve(&storage, reservation("hs-1", "alice", 2))
        .await
        .map_err(|e| format!("first reserve: {e}"))?;
    match commit_reserve(&storage, reservation("hs-2", "alice", 2)).await {
        Err(StorageError::InsufficientBalance { available, .. }) => {
            expect_eq("available", available, Decimal::ONE)
        }
        Ok(()) => Err("reservation beyond available balance committed".to_string()),
        Err(e) => Err(format!("expected InsufficientBalance, got {e}")),
    }
}

async fn release_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 3)]).await?;
    commit_reserve(&storage, reservation("hs-1", "alice", 2))
        .await
        .map_err(|e| format!("reserve: {e}"))?;

    for _ in 0..2 {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .release(&mut snap, "hs-1")
            .await
            .map_err(|e| format!("release: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }

    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get: {e}"))?;
    expect_eq("reserved", alice.reserved, Decimal::ZERO)?;
    expect_eq("balance", alice.balance, Decimal::from(3))
}

async fn transfer_replay_is_noop<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 5), ("bob", 0)]).await?;

    for attempt in 0..3 {
        commit_transfer(&storage, "hs-1", "alice", "bob", 2)
            .await
            .map_err(|e| format!("transfer attempt {attempt}: {e}"))?;
    }

    let transfers = storage
        .list_transfers(Some("bob"))
        .await
        .map_err(|e| format!("list: {e}"))?;
    expect_eq("transfer count", transfers.len(), 1)?;
    let bob = storage
        .get_account("bob")
        .await
        .map_err(|e| format!("get: {e}"))?;
    expect_eq("bob balance", bob.balance, Decimal::from(2))
}

async fn transfer_overdraft_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 1), ("bob", 0)]).await?;

    match commit_transfer(&storage, "hs-1", "alice", "bob", 2).await {
        Err(StorageError::InsufficientBalance { .. }) => {}
        Ok(()) => return Err("overdraft transfer committed".to_string()),
        Err(e) => return Err(format!("expected InsufficientBalance, got {e}")),
    }
    let found = storage
        .get_transfer("hs-1")
        .await
        .map_err(|e| format!("get transfer: {e}"))?;
    expect_eq("transfer recorded", found.is_some(), false)
}

async fn adjust_balance_below_zero_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 1)]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .adjust_balance(&mut snap, "alice", Decimal::from(-2))
        .await
        .map_err(|e| format!("adjust: {e}"))?;
    match storage.commit_snapshot(snap).await {
        Err(StorageError::InsufficientBalance { .. }) => Ok(()),
        Ok(()) => Err("negative balance committed".to_string()),
        Err(e) => Err(format!("expected InsufficientBalance, got {e}")),
    }
}

async fn commit_adjust<S: TimebankStorage>(
    storage: &S,
    user: &str,
    delta: Decimal,
) -> Result<(), StorageError> {
    let mut snap = storage.begin_snapshot().await?;
    storage.adjust_balance(&mut snap, user, delta).await?;
    storage.commit_snapshot(snap).await
}

async fn adjust_balance_keeps_holds_covered<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 3)]).await?;
    commit_reserve(&storage, reservation("hs-1", "alice", 2))
        .await
        .map_err(|e| format!("reserve: {e}"))?;

    match commit_adjust(&storage, "alice", Decimal::from(-2)).await {
        Err(StorageError::InsufficientBalance { available, .. }) => {
            expect_eq("available", available, Decimal::ONE)?
        }
        Ok(()) => return Err("debit into held hours committed".to_string()),
        Err(e) => return Err(format!("expected InsufficientBalance, got {e}")),
    }
    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get: {e}"))?;
    expect_eq("balance", alice.balance, Decimal::from(3))?;
    expect_eq("reserved", alice.reserved, Decimal::from(2))
}

async fn balance_overflow_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("alice", 1), ("bob", 0)]).await?;
    commit_adjust(&storage, "bob", Decimal::MAX)
        .await
        .map_err(|e| format!("credit to max: {e}"))?;

    match commit_adjust(&storage, "bob", Decimal::ONE).await {
        Err(StorageError::Overflow { .. }) => {}
        Ok(()) => return Err("overflowing credit committed".to_string()),
        Err(e) => return Err(format!("expected Overflow, got {e}")),
    }
    match commit_transfer(&storage, "hs-1", "alice", "bob", 1).await {
        Err(StorageError::Overflow { .. }) => {}
        Ok(()) => return Err("overflowing transfer committed".to_string()),
        Err(e) => return Err(format!("expected Overflow, got {e}")),
    }

    // The backend keeps serving reads and writes afterwards.
    let bob = storage
        .get_account("bob")
        .await
        .map_err(|e| format!("get after overflow: {e}"))?;
    expect_eq("bob balance", bob.balance, Decimal::MAX)?;
    commit_adjust(&storage, "alice", Decimal::ONE)
        .await
        .map_err(|e| format!("credit after overflow: {e}"))?;
    let alice = storage
        .get_account("alice")
        .await
        .map_err(|e| format!("get: {e}"))?;
    expect_eq("alice balance", alice.balance, Decimal::from(2))
}

async fn counters_and_karma_accumulate<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_accounts(&storage, &[("bob", 0)]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .bump_counters(
            &mut snap,
            "bob",
            CounterDelta {
                punctual: 1,
                helpful: 0,
                kind: 1,
                karma: 2,
            },
        )
        .await
        .map_err(|e| format!("bump: {e}"))?;
    storage
        .adjust_karma(&mut snap, "bob", -5)
        .await
        .map_err(|e| format!("karma: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let bob = storage
        .get_account("bob")
        .await
        .map_err(|e| format!("get: {e}"))?;
    expect_eq("punctual", bob.punctual_count, 1)?;
    expect_eq("helpful", bob.helpful_count, 0)?;
    expect_eq("kind", bob.kind_count, 1)?;
    expect_eq("karma", bob.karma, -3)
}
