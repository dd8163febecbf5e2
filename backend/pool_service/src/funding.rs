//! Funding aggregate: the only writer of an event's pooled amount, status
//! and milestone set.
//!
//! Every write follows the same optimistic protocol:
//!
//! 1. read a [`FundingSnapshot`] (no lock held),
//! 2. compute the next state with the protocol crate,
//! 3. open a transaction and update the event row `WHERE version = ?`,
//! 4. on a version mismatch roll back and start again from a fresh read.
//!
//! The contribution status change, contributor log append, milestone rows
//! and outbox records ride in the same transaction as the event update, so
//! they all land or none do.

use std::time::Duration;

use giftpool_protocol::{ContributorEntry, EventStatus, FundingSnapshot, Milestone};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::db;
use crate::errors::{PoolError, Result};
use crate::models::{AppliedFunding, ContributionRecord, EventRecord, NotificationKind};

/// Outcome of trying to apply a confirmed contribution.
#[derive(Debug, Clone)]
pub enum ApplyResult {
    /// This call moved the contribution to `succeeded` and the money into
    /// the pool.
    Applied(AppliedFunding),
    /// Someone else settled the contribution first; nothing was written.
    AlreadySettled(ContributionRecord),
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn backoff(attempt: u32) {
    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
}

fn exhausted(event_id: &str, attempts: u32) -> PoolError {
    warn!(event_id, attempts, "Optimistic write retries exhausted");
    PoolError::ConcurrencyExhausted {
        event_id: event_id.to_string(),
        attempts,
    }
}

/// Apply a confirmed contribution to its event.
pub async fn apply_contribution(
    pool: &SqlitePool,
    contribution: &ContributionRecord,
    max_attempts: u32,
) -> Result<ApplyResult> {
    let event_id = contribution.event_id.as_str();

    for attempt in 1..=max_attempts {
        let (record, snapshot) = db::load_snapshot(pool, event_id).await?;
        let outcome = snapshot.apply_contribution(contribution.amount)?;
        let ts = now();

        let mut tx = pool.begin().await?;

        if !db::claim_succeeded(&mut *tx, &contribution.id, ts).await? {
            tx.rollback().await?;
            let current = db::get_contribution(pool, &contribution.id)
                .await?
                .ok_or_else(|| PoolError::ContributionNotFound(contribution.id.clone()))?;
            debug!(contribution_id = %contribution.id, status = %current.status, "Contribution already settled");
            return Ok(ApplyResult::AlreadySettled(current));
        }

        let swapped = db::compare_and_swap_event(
            &mut *tx,
            event_id,
            snapshot.version,
            outcome.new_status,
            outcome.new_amount,
            None,
            ts,
        )
        .await?;
        if !swapped {
            tx.rollback().await?;
            debug!(event_id, attempt, "Version conflict applying contribution, retrying");
            backoff(attempt).await;
            continue;
        }

        let entry = ContributorEntry {
            contributor_ref: contribution.contributor_ref.clone(),
            amount: contribution.amount,
            contributed_at: ts,
            payment_ref: contribution.payment_ref.clone(),
            message: contribution.message.clone(),
            is_anonymous: contribution.is_anonymous,
        };
        db::append_contributor(&mut *tx, event_id, &entry).await?;

        for tag in &outcome.crossed_milestones {
            db::insert_milestone(&mut *tx, event_id, *tag, ts).await?;
        }

        let contributor = if contribution.is_anonymous {
            None
        } else {
            Some(contribution.contributor_ref.as_str())
        };
        db::enqueue_notification(
            &mut *tx,
            event_id,
            NotificationKind::Contribution,
            &json!({
                "contribution_id": contribution.id,
                "contributor_ref": contributor,
                "amount": contribution.amount,
                "message": contribution.message,
                "is_anonymous": contribution.is_anonymous,
                "current_amount": outcome.new_amount,
                "currency": record.currency,
            }),
            ts,
        )
        .await?;
        for tag in &outcome.crossed_milestones {
            db::enqueue_notification(
                &mut *tx,
                event_id,
                NotificationKind::Milestone,
                &milestone_payload(&record, *tag, outcome.new_amount),
                ts,
            )
            .await?;
        }

        tx.commit().await?;

        info!(
            event_id,
            contribution_id = %contribution.id,
            amount = contribution.amount,
            new_amount = outcome.new_amount,
            status = %outcome.new_status,
            milestones = ?outcome.crossed_milestones,
            attempt,
            "Contribution applied"
        );

        return Ok(ApplyResult::Applied(AppliedFunding {
            event_id: event_id.to_string(),
            new_amount: outcome.new_amount,
            event_status: outcome.new_status,
            status_changed: outcome.status_changed(),
            crossed_milestones: outcome.crossed_milestones,
            version: outcome.next_version,
        }));
    }

    Err(exhausted(event_id, max_attempts))
}

fn milestone_payload(record: &EventRecord, tag: Milestone, amount: i64) -> serde_json::Value {
    json!({
        "milestone": tag,
        "title": record.title,
        "current_amount": amount,
        "target_amount": record.target_amount,
        "currency": record.currency,
    })
}

/// Host- or system-driven lifecycle transition.
///
/// `Active → Funded` is reserved for [`apply_contribution`]; asking for it
/// here is rejected like any other invalid edge.
pub async fn transition_event(
    pool: &SqlitePool,
    event_id: &str,
    to: EventStatus,
    reason: Option<&str>,
    max_attempts: u32,
) -> Result<EventRecord> {
    for attempt in 1..=max_attempts {
        let record = db::require_event(pool, event_id).await?;
        let from = record.status()?;
        if to == EventStatus::Funded {
            return Err(PoolError::InvalidStateTransition { from, to });
        }
        let next = from.transition(to)?;
        let ts = now();

        let mut tx = pool.begin().await?;
        let swapped = db::compare_and_swap_event(
            &mut *tx,
            event_id,
            record.version,
            next,
            record.current_amount,
            reason,
            ts,
        )
        .await?;
        if !swapped {
            tx.rollback().await?;
            debug!(event_id, attempt, "Version conflict on transition, retrying");
            backoff(attempt).await;
            continue;
        }

        if next == EventStatus::Invested {
            db::enqueue_notification(
                &mut *tx,
                event_id,
                NotificationKind::PurchaseComplete,
                &json!({
                    "title": record.title,
                    "current_amount": record.current_amount,
                    "currency": record.currency,
                }),
                ts,
            )
            .await?;
        }
        tx.commit().await?;

        info!(event_id, from = %from, to = %next, "Event status changed");
        return db::require_event(pool, event_id).await;
    }

    Err(exhausted(event_id, max_attempts))
}

/// Record a refund the provider has already issued.
///
/// Returns `false` if the contribution was no longer `succeeded` (refunded
/// by a concurrent sweep), in which case nothing is written.
pub async fn apply_refund(
    pool: &SqlitePool,
    contribution: &ContributionRecord,
    refund_ref: &str,
    max_attempts: u32,
) -> Result<bool> {
    let event_id = contribution.event_id.as_str();

    for attempt in 1..=max_attempts {
        let (_, snapshot): (_, FundingSnapshot) = db::load_snapshot(pool, event_id).await?;
        let remaining = snapshot.apply_refund(contribution.amount)?;
        let ts = now();

        let mut tx = pool.begin().await?;
        if !db::claim_refunded(&mut *tx, &contribution.id, refund_ref, ts).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        let swapped = db::compare_and_swap_event(
            &mut *tx,
            event_id,
            snapshot.version,
            snapshot.status,
            remaining,
            None,
            ts,
        )
        .await?;
        if !swapped {
            tx.rollback().await?;
            debug!(event_id, attempt, "Version conflict applying refund, retrying");
            backoff(attempt).await;
            continue;
        }
        tx.commit().await?;

        info!(
            event_id,
            contribution_id = %contribution.id,
            amount = contribution.amount,
            remaining,
            "Refund applied"
        );
        return Ok(true);
    }

    Err(exhausted(event_id, max_attempts))
}
