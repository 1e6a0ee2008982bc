//! Racing callers against one engine: exactly one effect must win.

mod common;

use std::sync::Arc;

use common::{harness, hours, OFFER};
use timebank_engine::{HandshakeStatus, ResolutionAction};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_settle_exactly_once() {
    for _ in 0..20 {
        let h = harness().await;
        let id = h.accepted_offer().await;

        let tasks: Vec<_> = [h.alice.clone(), h.bob.clone()]
            .into_iter()
            .map(|actor| {
                let engine = Arc::clone(&h.engine);
                let id = id.clone();
                tokio::spawn(async move { engine.confirm_complete(&actor, &id, None).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let handshake = h.engine.get_handshake(&h.admin, &id).await.unwrap();
        assert_eq!(handshake.status, HandshakeStatus::Completed);
        assert_eq!(h.engine.ledger().list_transfers(None).await.unwrap().len(), 1);
        assert_eq!(h.account("alice").await.balance, hours(1));
        assert_eq!(h.account("bob").await.balance, hours(2));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_concurrent_confirmations_by_one_party_are_idempotent() {
    let h = harness().await;
    let id = h.accepted_offer().await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let actor = h.alice.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.confirm_complete(&actor, &id, None).await })
        })
        .collect();
    for task in tasks {
        let record = task.await.unwrap().unwrap();
        assert_eq!(record.status, HandshakeStatus::ReceiverConfirmed);
    }
    let history = h.engine.transitions(&h.alice, &id).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_interest_opens_one_handshake() {
    let h = harness().await;
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let actor = h.alice.clone();
            tokio::spawn(async move { engine.express_interest(&actor, OFFER, None).await })
        })
        .collect();

    let mut opened = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => opened += 1,
            Err(e) => assert_eq!(e.code(), "ALREADY_EXISTS"),
        }
    }
    assert_eq!(opened, 1);
    assert_eq!(h.account("alice").await.reserved, hours(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolutions_apply_once() {
    for action in [ResolutionAction::ConfirmNoShow, ResolutionAction::Dismiss] {
        let h = harness().await;
        let id = h.accepted_offer().await;
        let report = h.engine.report_no_show(&h.bob, &id, "no-show").await.unwrap();

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let engine = Arc::clone(&h.engine);
                let admin = h.admin.clone();
                let report_id = report.id.clone();
                tokio::spawn(async move {
                    engine.resolve_report(&admin, &report_id, action, None).await
                })
            })
            .collect();

        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert_eq!(e.code(), "INVALID_STATE"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(h.engine.ledger().list_transfers(None).await.unwrap().len(), 1);
        assert_eq!(h.account("bob").await.balance, hours(2));
        let expected_karma = match action {
            ResolutionAction::ConfirmNoShow => -5,
            _ => 0,
        };
        assert_eq!(h.account("alice").await.karma, expected_karma);
    }
}
