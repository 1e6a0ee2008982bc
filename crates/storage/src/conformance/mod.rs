//! Conformance test suite for `TimebankStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `TimebankStorage` implementation can run to verify correctness. The suite
//! covers:
//!
//! - **Snapshot isolation**: uncommitted writes invisible, aborted writes discarded
//! - **Handshake repository**: versioned updates, open-interest uniqueness
//! - **Ledger**: reservations, idempotent transfers, overdraft refusal
//! - **Concurrency**: racing conditional updates produce exactly one winner
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use timebank_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn memory_conformance() {
//!     let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod handshake;
mod ledger;
mod snapshot;

use std::fmt;
use std::future::Future;

use rust_decimal::Decimal;

use crate::record::{AccountRecord, HandshakeRecord, HandshakeStatus, Role, TransferRecord};
use crate::TimebankStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "snapshot", "ledger").
    pub category: String,
    /// Test name (e.g. "uncommitted_handshake_invisible").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation. Concurrency tests spawn tasks,
/// so the suite must run inside a tokio runtime.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: TimebankStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(handshake::run_handshake_tests(&factory).await);
    results.extend(ledger::run_ledger_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_account(user_id: &str, balance: i64) -> AccountRecord {
    AccountRecord::new(user_id, Role::Member, Decimal::from(balance))
}

fn make_handshake(id: &str, service_id: &str, requester_id: &str) -> HandshakeRecord {
    HandshakeRecord {
        id: id.to_string(),
        service_id: service_id.to_string(),
        provider_id: "provider".to_string(),
        receiver_id: requester_id.to_string(),
        requester_id: requester_id.to_string(),
        hours: Decimal::from(2),
        status: HandshakeStatus::Pending,
        provider_confirmed: false,
        receiver_confirmed: false,
        scheduled_time: None,
        created_at: "2026-01-01T00:00:00Z".to_string(),
        updated_at: "2026-01-01T00:00:00Z".to_string(),
        resolved_at: None,
        version: 0,
    }
}

fn make_transfer(key: &str, from: &str, to: &str, hours: i64) -> TransferRecord {
    TransferRecord {
        idempotency_key: key.to_string(),
        from_user: from.to_string(),
        to_user: to.to_string(),
        hours: Decimal::from(hours),
        at: "2026-01-01T00:05:00Z".to_string(),
    }
}

/// Create the given accounts in one committed snapshot.
async fn seed_accounts<S: TimebankStorage>(
    storage: &S,
    accounts: &[(&str, i64)],
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    for (user, balance) in accounts {
        storage
            .create_account(&mut snap, make_account(user, *balance))
            .await
            .map_err(|e| format!("create account {user}: {e}"))?;
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit accounts: {e}"))
}

/// Insert a handshake in its own committed snapshot.
async fn seed_handshake<S: TimebankStorage>(
    storage: &S,
    record: HandshakeRecord,
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_handshake(&mut snap, record)
        .await
        .map_err(|e| format!("insert handshake: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit handshake: {e}"))
}

fn expect_eq<T: PartialEq + fmt::Debug>(what: &str, actual: T, expected: T) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{what}: expected {expected:?}, got {actual:?}"))
    }
}
