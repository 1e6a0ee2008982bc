//! Admin operations: moderation, adjustments, content reports and audit.

mod common;

use common::{harness, hours, OFFER};
use timebank_engine::{
    AccountRecord, NewReport, ReportStatus, ReportType, ResolutionAction, Role, TimebankStorage,
};

#[tokio::test]
async fn admin_operations_require_an_active_admin() {
    let h = harness().await;
    let err = h.engine.warn_user(&h.bob, "alice", "be nice").await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = h.engine.adjust_karma(&h.alice, "alice", 100).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = h.engine.get_reports(&h.alice, None).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = h.engine.ban_user(&h.alice, "alice").await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn warnings_need_a_message_and_a_known_user() {
    let mut h = harness().await;
    let err = h.engine.warn_user(&h.admin, "alice", "  ").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
    let err = h.engine.warn_user(&h.admin, "mallory", "spam").await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let warning = h
        .engine
        .warn_user(&h.admin, "alice", "please show up on time")
        .await
        .unwrap();
    assert_eq!(warning.issued_by, "admin");
    let warnings = h.engine.storage().list_warnings("alice").await.unwrap();
    assert_eq!(warnings, vec![warning]);
    assert_eq!(h.drain_events(), vec!["user.warned"]);
}

#[tokio::test]
async fn ban_and_unban_toggle_activity() {
    let mut h = harness().await;
    let err = h.engine.ban_user(&h.admin, "admin").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let banned = h.engine.ban_user(&h.admin, "bob").await.unwrap();
    assert!(!banned.is_active);
    let bob = h.engine.authenticate("bob").await.unwrap();
    // Reading one's own ledger row stays possible; acting does not.
    assert!(!h.engine.account(&bob).await.unwrap().is_active);
    let err = h.engine.list_handshakes(&bob, Default::default()).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");

    let unbanned = h.engine.unban_user(&h.admin, "bob").await.unwrap();
    assert!(unbanned.is_active);
    assert_eq!(h.drain_events(), vec!["user.banned", "user.unbanned"]);
}

#[tokio::test]
async fn karma_and_balance_adjustments_return_new_values() {
    let h = harness().await;
    assert_eq!(h.engine.adjust_karma(&h.admin, "bob", 7).await.unwrap(), 7);
    assert_eq!(h.engine.adjust_karma(&h.admin, "bob", -2).await.unwrap(), 5);
    assert_eq!(
        h.engine.adjust_balance(&h.admin, "bob", hours(4)).await.unwrap(),
        hours(4)
    );
    let err = h
        .engine
        .adjust_balance(&h.admin, "bob", hours(-5))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    assert_eq!(h.account("bob").await.balance, hours(4));

    let err = h.engine.adjust_karma(&h.admin, "mallory", 1).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn balance_adjustments_cannot_touch_held_hours() {
    let h = harness().await;
    let id = h.accepted_offer().await;

    let err = h
        .engine
        .adjust_balance(&h.admin, "alice", hours(-2))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    assert_eq!(
        h.engine.adjust_balance(&h.admin, "alice", hours(-1)).await.unwrap(),
        hours(2)
    );

    // The hold still covers a no-show settlement.
    let report = h.engine.report_no_show(&h.bob, &id, "no-show").await.unwrap();
    h.engine
        .resolve_report(&h.admin, &report.id, ResolutionAction::ConfirmNoShow, None)
        .await
        .unwrap();
    let alice = h.account("alice").await;
    assert_eq!(alice.balance, hours(0));
    assert_eq!(alice.reserved, hours(0));
    assert_eq!(h.account("bob").await.balance, hours(2));
}

#[tokio::test]
async fn overflowing_balance_adjustment_is_invalid_input() {
    let h = harness().await;
    h.engine
        .adjust_balance(&h.admin, "bob", rust_decimal::Decimal::MAX)
        .await
        .unwrap();
    let err = h
        .engine
        .adjust_balance(&h.admin, "bob", hours(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    // Later operations still go through.
    assert_eq!(h.account("alice").await.balance, hours(3));
    h.accepted_offer().await;
    assert_eq!(h.account("alice").await.reserved, hours(2));
}

#[tokio::test]
async fn every_admin_mutation_is_audited() {
    let h = harness().await;
    h.engine.adjust_karma(&h.admin, "bob", 1).await.unwrap();
    h.engine.warn_user(&h.admin, "bob", "spam").await.unwrap();
    h.engine.ban_user(&h.admin, "carol").await.unwrap();

    let bob: Vec<String> = h
        .engine
        .audit_log(&h.admin, Some("bob"))
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert_eq!(bob, vec!["adjust_karma", "warn_user"]);
    let all = h.engine.audit_log(&h.admin, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|a| a.actor_id == "admin"));
}

#[tokio::test]
async fn accounts_are_opened_once() {
    let h = harness().await;
    let dave = h
        .engine
        .open_account(&h.admin, "dave", Role::Member, hours(5))
        .await
        .unwrap();
    assert_eq!(dave.balance, hours(5));
    assert!(dave.is_active);

    let err = h
        .engine
        .open_account(&h.admin, "dave", Role::Member, hours(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ALREADY_EXISTS");
    let err = h
        .engine
        .open_account(&h.admin, "erin", Role::Member, hours(-1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let seeded = h
        .engine
        .seed_account(AccountRecord::new("dave", Role::Admin, hours(0)))
        .await
        .unwrap();
    assert!(!seeded);
    assert_eq!(h.account("dave").await.role, Role::Member);
}

#[tokio::test]
async fn content_reports_resolve_without_moving_hours() {
    let h = harness().await;
    let err = h
        .engine
        .file_report(
            &h.alice,
            NewReport {
                report_type: ReportType::Spam,
                reported_user_id: None,
                reported_service_id: None,
                description: "?".into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let report = h
        .engine
        .file_report(
            &h.alice,
            NewReport {
                report_type: ReportType::Spam,
                reported_user_id: Some("bob".into()),
                reported_service_id: Some(OFFER.into()),
                description: "posts the same listing every day".into(),
            },
        )
        .await
        .unwrap();

    let pending = h
        .engine
        .get_reports(&h.admin, Some(ReportStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let resolved = h
        .engine
        .resolve_report(&h.admin, &report.id, ResolutionAction::None, Some("ok".into()))
        .await
        .unwrap();
    assert_eq!(resolved.status, ReportStatus::Resolved);
    assert_eq!(resolved.resolution_notes.as_deref(), Some("ok"));

    let err = h
        .engine
        .resolve_report(&h.admin, &report.id, ResolutionAction::Dismiss, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
    let err = h.engine.pause_report(&h.admin, &report.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    assert!(h
        .engine
        .get_reports(&h.admin, Some(ReportStatus::Pending))
        .await
        .unwrap()
        .is_empty());
    assert!(h.engine.ledger().list_transfers(None).await.unwrap().is_empty());
    assert_eq!(h.account("bob").await.balance, hours(0));
}

#[tokio::test]
async fn dispute_requires_a_resolution_verdict() {
    let h = harness().await;
    let id = h.accepted_offer().await;
    let report = h.engine.report_no_show(&h.bob, &id, "no-show").await.unwrap();
    let err = h
        .engine
        .resolve_report(&h.admin, &report.id, ResolutionAction::None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
    let still = h.engine.storage().get_report(&report.id).await.unwrap();
    assert_eq!(still.status, ReportStatus::Pending);
}
