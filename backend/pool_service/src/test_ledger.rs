use giftpool_protocol::{ContributionStatus, EventStatus, Milestone, ReportedStatus};

use crate::db;
use crate::errors::PoolError;
use crate::models::{NewContribution, NewEvent, NotificationKind, WebhookOutcome, WebhookPayload};
use crate::reconciler::{audit_conservation, sweep_once, SWEEP_BATCH};
use crate::test_support::harness;

fn contribution(contributor: &str, amount: i64) -> NewContribution {
    NewContribution {
        contributor_ref: contributor.to_string(),
        amount,
        message: Some("Happy birthday!".to_string()),
        is_anonymous: false,
    }
}

fn webhook(provider_event_id: &str, payment_ref: &str, status: ReportedStatus) -> WebhookPayload {
    WebhookPayload {
        provider_event_id: provider_event_id.to_string(),
        payment_ref: payment_ref.to_string(),
        reported_status: status,
    }
}

// ─────────────────────────────────────────────────────────
// CreateContribution
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_contribution_is_pending_with_intent() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;

    let created = h
        .ledger
        .create_contribution(&event_id, contribution("alice", 2_500))
        .await
        .unwrap();

    assert_eq!(created.contribution.status, "pending");
    assert!(created.contribution.payment_ref.starts_with("pi_"));
    assert!(created.client_secret.ends_with("_secret"));
    assert_eq!(h.current_amount(&event_id).await, 0);
}

#[tokio::test]
async fn test_create_contribution_rejects_non_positive_amount() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;

    for amount in [0, -100] {
        let err = h
            .ledger
            .create_contribution(&event_id, contribution("alice", amount))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidAmount(a) if a == amount));
    }
}

#[tokio::test]
async fn test_draft_event_does_not_accept_contributions() {
    let h = harness().await;
    let event = h
        .ledger
        .create_event(NewEvent {
            title: "Draft".to_string(),
            host_ref: "host-1".to_string(),
            target_amount: Some(5_000),
            contribution_deadline: None,
        })
        .await
        .unwrap();

    let err = h
        .ledger
        .create_contribution(&event.id, contribution("alice", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::EventNotAcceptingContributions { .. }));
}

#[tokio::test]
async fn test_contribution_after_deadline_rejected() {
    let h = harness().await;
    let event = h
        .ledger
        .create_event(NewEvent {
            title: "Expired".to_string(),
            host_ref: "host-1".to_string(),
            target_amount: Some(5_000),
            contribution_deadline: Some(chrono::Utc::now().timestamp() - 60),
        })
        .await
        .unwrap();
    h.ledger
        .transition(&event.id, EventStatus::Active)
        .await
        .unwrap();

    let err = h
        .ledger
        .create_contribution(&event.id, contribution("alice", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::EventNotAcceptingContributions { .. }));
}

#[tokio::test]
async fn test_unknown_event_rejected() {
    let h = harness().await;
    let err = h
        .ledger
        .create_contribution("missing", contribution("alice", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::EventNotFound(_)));
}

#[tokio::test]
async fn test_gateway_failure_persists_nothing() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    h.gateway.set_fail_create(true);

    let err = h
        .ledger
        .create_contribution(&event_id, contribution("alice", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Gateway(_)));
    assert!(h.ledger.list_contributions(&event_id).await.unwrap().is_empty());

    h.gateway.set_fail_create(false);
    h.ledger
        .create_contribution(&event_id, contribution("alice", 100))
        .await
        .unwrap();
}

// ─────────────────────────────────────────────────────────
// ReconcileConfirmation
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_payment_ref() {
    let h = harness().await;
    let err = h
        .ledger
        .reconcile_confirmation("pi_nope", ReportedStatus::Succeeded)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::UnknownPaymentRef(_)));
}

#[tokio::test]
async fn test_confirmation_is_idempotent() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let c = h.pending(&event_id, "alice", 6_000).await;

    let first = h
        .ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert!(!first.already_processed);
    let applied = first.applied.unwrap();
    assert_eq!(applied.new_amount, 6_000);
    assert_eq!(
        applied.crossed_milestones,
        vec![
            Milestone::FirstContribution,
            Milestone::Percent25,
            Milestone::Percent50
        ]
    );
    let view_once = h.ledger.event_view(&event_id).await.unwrap();

    let second = h
        .ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert!(second.already_processed);
    assert!(second.applied.is_none());
    assert_eq!(second.contribution.status, "succeeded");

    let view_twice = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view_twice.current_amount, 6_000);
    assert_eq!(view_twice.version, view_once.version);
    assert_eq!(view_twice.contributors.len(), 1);
    assert_eq!(view_twice.status, EventStatus::Active);
}

#[tokio::test]
async fn test_failed_payment_is_terminal() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let c = h.pending(&event_id, "bob", 3_000).await;

    let failed = h
        .ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.contribution.status, "failed");
    assert!(!failed.already_processed);

    // A late success report for a failed contribution changes nothing.
    let late = h
        .ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert!(late.already_processed);
    assert_eq!(late.contribution.status, "failed");
    assert_eq!(h.current_amount(&event_id).await, 0);
}

#[tokio::test]
async fn test_pending_report_changes_nothing() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let c = h.pending(&event_id, "bob", 3_000).await;

    let result = h
        .ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Pending)
        .await
        .unwrap();
    assert_eq!(result.contribution.status, "pending");
    assert!(result.applied.is_none());
}

#[tokio::test]
async fn test_explicit_confirm_asks_provider() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let c = h.pending(&event_id, "carol", 1_000).await;

    let still_pending = h.ledger.confirm_payment(&c.payment_ref).await.unwrap();
    assert_eq!(still_pending.contribution.status, "pending");

    h.gateway.settle(&c.payment_ref, ReportedStatus::Succeeded);
    let done = h.ledger.confirm_payment(&c.payment_ref).await.unwrap();
    assert_eq!(done.contribution.status, "succeeded");
    assert_eq!(h.current_amount(&event_id).await, 1_000);
}

// ─────────────────────────────────────────────────────────
// Webhooks
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_webhook_applies_once() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let c = h.paid(&event_id, "alice", 2_000).await;

    let first = h
        .ledger
        .handle_webhook(webhook("evt_1", &c.payment_ref, ReportedStatus::Succeeded))
        .await
        .unwrap();
    assert!(matches!(first, WebhookOutcome::Processed { .. }));

    let replay = h
        .ledger
        .handle_webhook(webhook("evt_1", &c.payment_ref, ReportedStatus::Succeeded))
        .await
        .unwrap();
    assert!(matches!(replay, WebhookOutcome::Duplicate));

    // Same payment announced under a different provider event id.
    let other = h
        .ledger
        .handle_webhook(webhook("evt_2", &c.payment_ref, ReportedStatus::Succeeded))
        .await
        .unwrap();
    match other {
        WebhookOutcome::Processed { result } => assert!(result.already_processed),
        unexpected => panic!("unexpected outcome {unexpected:?}"),
    }

    assert_eq!(h.current_amount(&event_id).await, 2_000);
    let contributors = db::list_contributors(&h.ledger.pool, &event_id).await.unwrap();
    assert_eq!(contributors.len(), 1);
}

#[tokio::test]
async fn test_webhook_for_unknown_payment_is_acknowledged() {
    let h = harness().await;

    let outcome = h
        .ledger
        .handle_webhook(webhook("evt_x", "pi_unknown", ReportedStatus::Succeeded))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Deferred { .. }));

    let replay = h
        .ledger
        .handle_webhook(webhook("evt_x", "pi_unknown", ReportedStatus::Succeeded))
        .await
        .unwrap();
    assert!(matches!(replay, WebhookOutcome::Duplicate));
}

// ─────────────────────────────────────────────────────────
// Milestones & notifications
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_notifications_emitted_once_per_milestone() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;

    for (who, amount) in [("a", 2_000), ("b", 2_000), ("c", 4_000), ("d", 3_000)] {
        let c = h.pending(&event_id, who, amount).await;
        h.ledger
            .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
            .await
            .unwrap();
    }

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view.current_amount, 11_000);
    assert_eq!(view.status, EventStatus::Funded);
    assert_eq!(view.funding_percent, Some(110));
    assert_eq!(
        view.milestones_reached,
        vec![
            Milestone::FirstContribution,
            Milestone::Percent25,
            Milestone::Percent50,
            Milestone::Percent75,
            Milestone::Percent100
        ]
    );

    let sent = h.recorder.sent();
    let contributions = sent
        .iter()
        .filter(|n| n.kind == NotificationKind::Contribution)
        .count();
    let milestones: Vec<String> = sent
        .iter()
        .filter(|n| n.kind == NotificationKind::Milestone)
        .map(|n| n.payload["milestone"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(contributions, 4);
    assert_eq!(
        milestones,
        vec![
            "first_contribution",
            "25_percent",
            "50_percent",
            "75_percent",
            "100_percent"
        ]
    );
}

#[tokio::test]
async fn test_goal_less_event_only_first_contribution() {
    let h = harness().await;
    let event_id = h.active_event(None).await;

    for amount in [50_000, 70_000] {
        let c = h.pending(&event_id, "x", amount).await;
        h.ledger
            .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
            .await
            .unwrap();
    }

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert!(!view.has_goal);
    assert_eq!(view.status, EventStatus::Active);
    assert_eq!(view.milestones_reached, vec![Milestone::FirstContribution]);
    assert_eq!(view.funding_percent, None);
}

#[tokio::test]
async fn test_anonymous_contributor_masked_in_view() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let created = h
        .ledger
        .create_contribution(
            &event_id,
            NewContribution {
                contributor_ref: "secret-santa".to_string(),
                amount: 500,
                message: None,
                is_anonymous: true,
            },
        )
        .await
        .unwrap();
    h.ledger
        .reconcile_confirmation(&created.contribution.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view.contributors[0].contributor_ref, "anonymous");
    assert!(view.contributors[0].is_anonymous);

    let note = h
        .recorder
        .sent()
        .into_iter()
        .find(|n| n.kind == NotificationKind::Contribution)
        .unwrap();
    assert!(note.payload["contributor_ref"].is_null());
}

#[tokio::test]
async fn test_fee_estimate_does_not_touch_pool() {
    let h = harness().await;
    let event_id = h.active_event(Some(50_000)).await;
    let c = h.pending(&event_id, "alice", 10_000).await;
    h.ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view.current_amount, 10_000);
    assert_eq!(view.estimated_fees, 320);
    assert_eq!(view.net_payout_estimate, 9_680);
}

// ─────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_purchase_lifecycle() {
    let h = harness().await;
    let event_id = h.active_event(Some(1_000)).await;
    let c = h.pending(&event_id, "alice", 1_000).await;
    let result = h
        .ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    let applied = result.applied.unwrap();
    assert!(applied.status_changed);
    assert_eq!(applied.event_status, EventStatus::Funded);

    let purchasing = h
        .ledger
        .transition(&event_id, EventStatus::Purchasing)
        .await
        .unwrap();
    assert_eq!(purchasing.status, EventStatus::Purchasing);

    h.ledger
        .transition(&event_id, EventStatus::Invested)
        .await
        .unwrap();
    let done = h
        .ledger
        .transition(&event_id, EventStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, EventStatus::Completed);

    let purchase_notes = h
        .recorder
        .sent()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::PurchaseComplete)
        .count();
    assert_eq!(purchase_notes, 1);
}

#[tokio::test]
async fn test_confirmations_after_funding_keep_status_and_milestones() {
    let h = harness().await;
    let event_id = h.active_event(Some(1_000)).await;
    let first = h.pending(&event_id, "alice", 1_000).await;
    let after_goal = h.pending(&event_id, "bob", 500).await;
    let while_buying = h.pending(&event_id, "carol", 300).await;

    h.ledger
        .reconcile_confirmation(&first.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();

    let funded = h
        .ledger
        .reconcile_confirmation(&after_goal.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap()
        .applied
        .unwrap();
    assert_eq!(funded.event_status, EventStatus::Funded);
    assert!(!funded.status_changed);
    assert!(funded.crossed_milestones.is_empty());
    assert_eq!(funded.new_amount, 1_500);

    h.ledger
        .transition(&event_id, EventStatus::Purchasing)
        .await
        .unwrap();
    let purchasing = h
        .ledger
        .reconcile_confirmation(&while_buying.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap()
        .applied
        .unwrap();
    assert_eq!(purchasing.event_status, EventStatus::Purchasing);
    assert!(!purchasing.status_changed);
    assert!(purchasing.crossed_milestones.is_empty());

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view.status, EventStatus::Purchasing);
    assert_eq!(view.current_amount, 1_800);
    assert_eq!(view.contributors.len(), 3);
    assert_eq!(view.milestones_reached.len(), 5);

    let goal_notes = h
        .recorder
        .sent()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Milestone && n.payload["milestone"] == "100_percent")
        .count();
    assert_eq!(goal_notes, 1);
}

#[tokio::test]
async fn test_capture_after_investment_is_returned() {
    let h = harness().await;
    let event_id = h.active_event(Some(1_000)).await;
    let late = h.pending(&event_id, "latecomer", 400).await;
    let later = h.pending(&event_id, "straggler", 250).await;
    let c = h.paid(&event_id, "alice", 1_000).await;
    h.ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    h.ledger
        .transition(&event_id, EventStatus::Purchasing)
        .await
        .unwrap();
    h.ledger
        .transition(&event_id, EventStatus::Invested)
        .await
        .unwrap();

    // Provider refund down: the contribution stays pending for the sweep.
    h.gateway.settle(&late.payment_ref, ReportedStatus::Succeeded);
    h.gateway.set_fail_refund(true);
    let err = h.ledger.confirm_payment(&late.payment_ref).await.unwrap_err();
    assert!(matches!(err, PoolError::Gateway(_)));
    let row = db::get_contribution_by_payment_ref(&h.ledger.pool, &late.payment_ref)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "pending");

    h.gateway.set_fail_refund(false);
    let report = sweep_once(&h.ledger, 0).await.unwrap();
    assert_eq!(report.settled, 1);

    let row = db::get_contribution_by_payment_ref(&h.ledger.pool, &late.payment_ref)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "failed");
    assert!(row.refund_ref.is_some());
    assert_eq!(h.gateway.refund_calls(), 2);

    // A replayed success report does not refund twice.
    let replay = h
        .ledger
        .reconcile_confirmation(&late.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert!(replay.already_processed);
    assert_eq!(h.gateway.refund_calls(), 2);

    // Same once the gift has been delivered.
    h.ledger
        .transition(&event_id, EventStatus::Completed)
        .await
        .unwrap();
    h.gateway.settle(&later.payment_ref, ReportedStatus::Succeeded);
    let returned = h
        .ledger
        .reconcile_confirmation(&later.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert_eq!(returned.contribution.status, "failed");
    assert!(returned.contribution.refund_ref.is_some());

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view.status, EventStatus::Completed);
    assert_eq!(view.current_amount, 1_000);
    assert!(audit_conservation(&h.ledger.pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_host_transitions_rejected() {
    let h = harness().await;
    let event_id = h.active_event(Some(1_000)).await;

    for to in [
        EventStatus::Purchasing,
        EventStatus::Invested,
        EventStatus::Completed,
        EventStatus::Active,
        EventStatus::Funded,
        EventStatus::Draft,
    ] {
        let err = h.ledger.transition(&event_id, to).await.unwrap_err();
        assert!(
            matches!(err, PoolError::InvalidStateTransition { from: EventStatus::Active, .. }),
            "active -> {to} should be rejected"
        );
    }
}

// ─────────────────────────────────────────────────────────
// Cancellation & refunds
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_refunds_succeeded_contributions() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let a = h.pending(&event_id, "alice", 3_000).await;
    let b = h.pending(&event_id, "bob", 2_000).await;
    let open = h.paid(&event_id, "carol", 1_000).await;
    for c in [&a, &b] {
        h.gateway.settle(&c.payment_ref, ReportedStatus::Succeeded);
        h.ledger
            .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
            .await
            .unwrap();
    }
    assert_eq!(h.current_amount(&event_id).await, 5_000);

    let outcome = h.ledger.cancel_event(&event_id, "gift discontinued").await.unwrap();
    assert_eq!(outcome.refunded, 2);
    assert_eq!(outcome.refunds_pending, 0);
    assert_eq!(outcome.event.status, EventStatus::Cancelled);
    assert_eq!(outcome.event.current_amount, 0);
    assert_eq!(outcome.event.cancel_reason.as_deref(), Some("gift discontinued"));

    let refunded = db::list_contributions_with_status(
        &h.ledger.pool,
        &event_id,
        ContributionStatus::Refunded,
    )
    .await
    .unwrap();
    assert_eq!(refunded.len(), 2);
    assert!(refunded.iter().all(|c| c.refund_ref.is_some()));

    // Money captured after cancellation is accounted, then sent straight back.
    let late = h
        .ledger
        .reconcile_confirmation(&open.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert!(late.applied.is_some());
    let after = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(after.current_amount, 0);
    assert_eq!(after.refunds_pending, 0);
    assert!(audit_conservation(&h.ledger.pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_refund_failure_does_not_block_cancellation() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    for (who, amount) in [("alice", 1_500), ("bob", 2_500)] {
        let c = h.paid(&event_id, who, amount).await;
        h.ledger
            .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
            .await
            .unwrap();
    }

    h.gateway.set_fail_refund(true);
    let outcome = h.ledger.cancel_event(&event_id, "host left").await.unwrap();
    assert_eq!(outcome.event.status, EventStatus::Cancelled);
    assert_eq!(outcome.refunded, 0);
    assert_eq!(outcome.refunds_pending, 2);
    assert_eq!(outcome.event.current_amount, 4_000);

    // Out-of-band retry once the provider recovers.
    h.gateway.set_fail_refund(false);
    let report = sweep_once(&h.ledger, 900).await.unwrap();
    assert_eq!(report.refunded, 2);
    assert!(report.mismatches.is_empty());

    let view = h.ledger.event_view(&event_id).await.unwrap();
    assert_eq!(view.current_amount, 0);
    assert_eq!(view.refunds_pending, 0);
}

#[tokio::test]
async fn test_cannot_cancel_after_investment() {
    let h = harness().await;
    let event_id = h.active_event(Some(1_000)).await;
    let c = h.paid(&event_id, "alice", 1_000).await;
    h.ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    h.ledger
        .transition(&event_id, EventStatus::Purchasing)
        .await
        .unwrap();
    h.ledger
        .transition(&event_id, EventStatus::Invested)
        .await
        .unwrap();

    let err = h.ledger.cancel_event(&event_id, "too late").await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::InvalidStateTransition {
            from: EventStatus::Invested,
            to: EventStatus::Cancelled
        }
    ));
    assert_eq!(h.gateway.refund_calls(), 0);
    assert_eq!(h.current_amount(&event_id).await, 1_000);
}

#[tokio::test]
async fn test_draft_event_can_be_cancelled() {
    let h = harness().await;
    let event = h
        .ledger
        .create_event(NewEvent {
            title: "Never opened".to_string(),
            host_ref: "host-1".to_string(),
            target_amount: None,
            contribution_deadline: None,
        })
        .await
        .unwrap();

    let outcome = h.ledger.cancel_event(&event.id, "changed plans").await.unwrap();
    assert_eq!(outcome.event.status, EventStatus::Cancelled);
    assert_eq!(outcome.refunded, 0);
}

// ─────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sweep_settles_stale_pending_payments() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let paid = h.paid(&event_id, "alice", 4_000).await;
    let declined = h.pending(&event_id, "bob", 1_000).await;
    h.gateway.settle(&declined.payment_ref, ReportedStatus::Failed);
    let waiting = h.pending(&event_id, "carol", 500).await;

    let report = sweep_once(&h.ledger, 0).await.unwrap();
    assert_eq!(report.settled, 2);
    assert!(report.mismatches.is_empty());

    let status_of = |payment_ref: String| {
        let pool = h.ledger.pool.clone();
        async move {
            db::get_contribution_by_payment_ref(&pool, &payment_ref)
                .await
                .unwrap()
                .unwrap()
                .status
        }
    };
    assert_eq!(status_of(paid.payment_ref).await, "succeeded");
    assert_eq!(status_of(declined.payment_ref).await, "failed");
    assert_eq!(status_of(waiting.payment_ref).await, "pending");
    assert_eq!(h.current_amount(&event_id).await, 4_000);
}

#[tokio::test]
async fn test_abandoned_intents_do_not_starve_the_sweep() {
    let h = harness().await;
    let event_id = h.active_event(None).await;
    let mut abandoned = Vec::new();
    for i in 0..SWEEP_BATCH {
        abandoned.push(h.pending(&event_id, &format!("ghost-{i}"), 100).await);
    }
    let captured = h.paid(&event_id, "alice", 700).await;

    for _ in 0..2 {
        sweep_once(&h.ledger, 0).await.unwrap();
    }

    let row = db::get_contribution_by_payment_ref(&h.ledger.pool, &captured.payment_ref)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "succeeded");
    assert_eq!(h.current_amount(&event_id).await, 700);

    let checked = db::testing::last_checked_at(&h.ledger.pool, &abandoned[0].id)
        .await
        .unwrap();
    assert!(checked.is_some());
}

#[tokio::test]
async fn test_audit_flags_tampered_amount() {
    let h = harness().await;
    let event_id = h.active_event(Some(10_000)).await;
    let c = h.paid(&event_id, "alice", 4_000).await;
    h.ledger
        .reconcile_confirmation(&c.payment_ref, ReportedStatus::Succeeded)
        .await
        .unwrap();
    assert!(audit_conservation(&h.ledger.pool).await.unwrap().is_empty());

    sqlx::query("UPDATE events SET current_amount = current_amount + 1 WHERE id = ?1")
        .bind(&event_id)
        .execute(&h.ledger.pool)
        .await
        .unwrap();

    let mismatched = audit_conservation(&h.ledger.pool).await.unwrap();
    assert_eq!(mismatched, vec![event_id.clone()]);
    // Reported, not corrected.
    assert_eq!(h.current_amount(&event_id).await, 4_001);
}
