//! Runs the backend-agnostic conformance suite against `MemoryStorage`.

use timebank_storage::conformance::run_conformance_suite;
use timebank_storage::MemoryStorage;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_storage_conformance() {
    let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
    assert!(report.failed == 0, "{report}");
    assert!(report.total > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_backed_storage_conformance() {
    let dir = tempfile::tempdir().unwrap();
    let counter = std::sync::atomic::AtomicUsize::new(0);
    let report = run_conformance_suite(|| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = dir.path().join(format!("state-{n}.json"));
        async move { MemoryStorage::open(path).unwrap() }
    })
    .await;
    assert!(report.failed == 0, "{report}");
}
