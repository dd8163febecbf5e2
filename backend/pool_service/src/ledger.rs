//! Contribution ledger. Owns contribution records and drives them through
//! payment reconciliation, handing confirmed money to the funding aggregate.

use std::collections::BTreeMap;
use std::sync::Arc;

use giftpool_protocol::{ContributionStatus, EventStatus, ReportedStatus};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{PoolError, Result};
use crate::funding::{self, ApplyResult};
use crate::gateway::PaymentGateway;
use crate::models::{
    CancelOutcome, ConfirmationResult, ContributionRecord, CreatedContribution, EventView,
    NewContribution, NewEvent, WebhookOutcome, WebhookPayload,
};
use crate::notify::{self, NotificationDispatcher};

pub struct Ledger {
    pub pool: SqlitePool,
    pub gateway: Arc<dyn PaymentGateway>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub currency: String,
    pub max_apply_attempts: u32,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Ledger {
    // ─────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────

    pub async fn create_event(&self, event: NewEvent) -> Result<EventView> {
        if let Some(target) = event.target_amount {
            if target <= 0 {
                return Err(PoolError::InvalidAmount(target));
            }
        }
        let id = Uuid::new_v4().to_string();
        db::insert_event(&self.pool, &id, &event, &self.currency, now()).await?;
        info!(event_id = %id, host = %event.host_ref, target = ?event.target_amount, "Event created");
        self.event_view(&id).await
    }

    pub async fn event_view(&self, event_id: &str) -> Result<EventView> {
        let record = db::require_event(&self.pool, event_id).await?;
        let contributors = db::list_contributors(&self.pool, event_id).await?;
        let milestones = db::get_milestones(&self.pool, event_id).await?;
        let succeeded = db::succeeded_amounts(&self.pool, event_id).await?;
        EventView::build(record, contributors, milestones, succeeded)
    }

    /// Host-driven lifecycle step (open, begin purchase, purchase complete,
    /// delivered). Cancellation goes through [`Ledger::cancel_event`].
    pub async fn transition(&self, event_id: &str, to: EventStatus) -> Result<EventView> {
        if to == EventStatus::Cancelled {
            let record = db::require_event(&self.pool, event_id).await?;
            return Err(PoolError::InvalidStateTransition {
                from: record.status()?,
                to,
            });
        }
        funding::transition_event(&self.pool, event_id, to, None, self.max_apply_attempts).await?;
        self.flush_notifications().await;
        self.event_view(event_id).await
    }

    // ─────────────────────────────────────────────────────────
    // Contributions
    // ─────────────────────────────────────────────────────────

    /// Validate a contribution attempt, open a payment intent for it and
    /// persist it as `pending`.
    ///
    /// The gateway call holds no lock on the event. If it fails nothing is
    /// persisted and the client may simply try again.
    pub async fn create_contribution(
        &self,
        event_id: &str,
        input: NewContribution,
    ) -> Result<CreatedContribution> {
        if input.amount <= 0 {
            return Err(PoolError::InvalidAmount(input.amount));
        }
        let event = db::require_event(&self.pool, event_id).await?;
        let status = event.status()?;
        let ts = now();
        if !status.accepts_contributions() {
            return Err(PoolError::EventNotAcceptingContributions {
                event_id: event_id.to_string(),
                reason: format!("event is {status}"),
            });
        }
        if event.deadline_passed(ts) {
            return Err(PoolError::EventNotAcceptingContributions {
                event_id: event_id.to_string(),
                reason: "contribution deadline has passed".to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let metadata = BTreeMap::from([
            ("event_id".to_string(), event_id.to_string()),
            ("contribution_id".to_string(), id.clone()),
            ("contributor_ref".to_string(), input.contributor_ref.clone()),
        ]);
        let intent = self
            .gateway
            .create_intent(input.amount, &event.currency, &metadata)
            .await
            .map_err(|e| {
                warn!(event_id, amount = input.amount, "Payment intent creation failed: {e}");
                PoolError::Gateway(e)
            })?;

        let contribution = ContributionRecord {
            id,
            event_id: event_id.to_string(),
            contributor_ref: input.contributor_ref,
            amount: input.amount,
            message: input.message,
            is_anonymous: input.is_anonymous,
            payment_ref: intent.intent_id,
            status: ContributionStatus::Pending.as_str().to_string(),
            created_at: ts,
            confirmed_at: None,
            refunded_at: None,
            refund_ref: None,
        };
        db::insert_contribution(&self.pool, &contribution).await?;
        info!(
            event_id,
            contribution_id = %contribution.id,
            payment_ref = %contribution.payment_ref,
            amount = contribution.amount,
            "Contribution pending"
        );

        Ok(CreatedContribution {
            contribution,
            client_secret: intent.client_secret,
        })
    }

    pub async fn list_contributions(&self, event_id: &str) -> Result<Vec<ContributionRecord>> {
        db::require_event(&self.pool, event_id).await?;
        db::list_contributions(&self.pool, event_id).await
    }

    /// Settle a contribution from a provider-reported payment status.
    ///
    /// Replays are expected: a contribution that is already settled is
    /// returned as-is with `already_processed` set.
    pub async fn reconcile_confirmation(
        &self,
        payment_ref: &str,
        reported: ReportedStatus,
    ) -> Result<ConfirmationResult> {
        let contribution = db::get_contribution_by_payment_ref(&self.pool, payment_ref)
            .await?
            .ok_or_else(|| {
                warn!(payment_ref, "Confirmation for unknown payment reference");
                PoolError::UnknownPaymentRef(payment_ref.to_string())
            })?;

        if contribution.status()?.is_settled() {
            debug!(payment_ref, status = %contribution.status, "Replayed confirmation ignored");
            return Ok(ConfirmationResult {
                contribution,
                already_processed: true,
                applied: None,
            });
        }

        match reported {
            ReportedStatus::Pending => Ok(ConfirmationResult {
                contribution,
                already_processed: false,
                applied: None,
            }),
            ReportedStatus::Failed => {
                let changed = db::mark_failed(&self.pool, &contribution.id, now()).await?;
                let current = self.reload(&contribution.id).await?;
                if changed {
                    info!(payment_ref, contribution_id = %contribution.id, "Contribution failed");
                }
                Ok(ConfirmationResult {
                    contribution: current,
                    already_processed: !changed,
                    applied: None,
                })
            }
            ReportedStatus::Succeeded => {
                let attempt =
                    funding::apply_contribution(&self.pool, &contribution, self.max_apply_attempts)
                        .await;
                let result = match attempt {
                    Err(PoolError::ConfirmationRejected(status)) => {
                        return self.return_late_capture(contribution, status).await;
                    }
                    other => other?,
                };
                match result {
                    ApplyResult::Applied(applied) => {
                        let current = self.reload(&contribution.id).await?;
                        self.after_apply(&current, applied.event_status).await;
                        Ok(ConfirmationResult {
                            contribution: current,
                            already_processed: false,
                            applied: Some(applied),
                        })
                    }
                    ApplyResult::AlreadySettled(current) => Ok(ConfirmationResult {
                        contribution: current,
                        already_processed: true,
                        applied: None,
                    }),
                }
            }
        }
    }

    /// Explicit confirm path: ask the provider for the intent status, then
    /// reconcile with whatever it reports.
    pub async fn confirm_payment(&self, payment_ref: &str) -> Result<ConfirmationResult> {
        let contribution = db::get_contribution_by_payment_ref(&self.pool, payment_ref)
            .await?
            .ok_or_else(|| PoolError::UnknownPaymentRef(payment_ref.to_string()))?;
        let intent = self.gateway.retrieve_intent(payment_ref).await?;
        if intent.status == ReportedStatus::Succeeded && intent.amount_received != contribution.amount {
            warn!(
                payment_ref,
                expected = contribution.amount,
                received = intent.amount_received,
                "Provider captured a different amount than the contribution"
            );
        }
        self.reconcile_confirmation(payment_ref, intent.status).await
    }

    /// Provider push path.
    ///
    /// The provider event id is recorded before anything else; a delivery
    /// whose id is already known is a no-op. Once recorded, the delivery is
    /// acknowledged even if reconciliation fails; the reconciler's pending
    /// sweep picks the contribution up again.
    pub async fn handle_webhook(&self, payload: WebhookPayload) -> Result<WebhookOutcome> {
        let fresh = db::record_provider_event(
            &self.pool,
            &payload.provider_event_id,
            &payload.payment_ref,
            now(),
        )
        .await?;
        if !fresh {
            debug!(provider_event_id = %payload.provider_event_id, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self
            .reconcile_confirmation(&payload.payment_ref, payload.reported_status)
            .await
        {
            Ok(result) => Ok(WebhookOutcome::Processed { result }),
            Err(e) => {
                error!(
                    provider_event_id = %payload.provider_event_id,
                    payment_ref = %payload.payment_ref,
                    retryable = e.is_retryable(),
                    "Webhook reconciliation deferred: {e}"
                );
                Ok(WebhookOutcome::Deferred {
                    error: e.to_string(),
                })
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Cancellation & refunds
    // ─────────────────────────────────────────────────────────

    /// Cancel an event and refund every succeeded contribution, one at a
    /// time. Individual refund failures do not stop the cancellation; they
    /// show up in `refunds_pending` and are retried by the reconciler.
    pub async fn cancel_event(&self, event_id: &str, reason: &str) -> Result<CancelOutcome> {
        funding::transition_event(
            &self.pool,
            event_id,
            EventStatus::Cancelled,
            Some(reason),
            self.max_apply_attempts,
        )
        .await?;
        info!(event_id, reason, "Event cancelled, refunding contributions");

        let refunded = self.refund_succeeded(event_id).await?;
        let event = self.event_view(event_id).await?;
        let refunds_pending = event.refunds_pending as usize;
        if refunds_pending > 0 {
            warn!(event_id, refunds_pending, "Cancellation left refunds pending");
        }

        Ok(CancelOutcome {
            event,
            refunded,
            refunds_pending,
        })
    }

    /// Sequentially refund the succeeded contributions of one event.
    pub async fn refund_succeeded(&self, event_id: &str) -> Result<usize> {
        let succeeded = db::list_contributions_with_status(
            &self.pool,
            event_id,
            ContributionStatus::Succeeded,
        )
        .await?;

        let mut refunded = 0usize;
        for contribution in &succeeded {
            match self.refund_contribution(contribution).await {
                Ok(true) => refunded += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    event_id,
                    contribution_id = %contribution.id,
                    "Refund failed, left for reconciliation: {e}"
                ),
            }
        }
        Ok(refunded)
    }

    /// Refund one succeeded contribution at the provider and take its amount
    /// out of the pool.
    pub async fn refund_contribution(&self, contribution: &ContributionRecord) -> Result<bool> {
        let receipt = self
            .gateway
            .refund(
                &contribution.payment_ref,
                contribution.amount,
                &format!("refund-{}", contribution.id),
            )
            .await?;
        funding::apply_refund(
            &self.pool,
            contribution,
            &receipt.refund_id,
            self.max_apply_attempts,
        )
        .await
    }

    /// Money captured after the pool was spent (`invested`, `completed`) has
    /// nowhere to go. It is refunded at the provider and the contribution
    /// closed as `failed` with the refund recorded. If the refund call fails
    /// the contribution stays pending and the stale-pending sweep retries.
    async fn return_late_capture(
        &self,
        contribution: ContributionRecord,
        status: EventStatus,
    ) -> Result<ConfirmationResult> {
        warn!(
            event_id = %contribution.event_id,
            payment_ref = %contribution.payment_ref,
            status = %status,
            "Payment captured after the event stopped taking money, refunding"
        );
        let receipt = self
            .gateway
            .refund(
                &contribution.payment_ref,
                contribution.amount,
                &format!("refund-{}", contribution.id),
            )
            .await?;
        let changed =
            db::reject_late_capture(&self.pool, &contribution.id, &receipt.refund_id, now()).await?;
        let current = self.reload(&contribution.id).await?;
        Ok(ConfirmationResult {
            contribution: current,
            already_processed: !changed,
            applied: None,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────

    async fn reload(&self, contribution_id: &str) -> Result<ContributionRecord> {
        db::get_contribution(&self.pool, contribution_id)
            .await?
            .ok_or_else(|| PoolError::ContributionNotFound(contribution_id.to_string()))
    }

    /// Money that lands on an already cancelled event goes straight back.
    async fn after_apply(&self, contribution: &ContributionRecord, status: EventStatus) {
        if status == EventStatus::Cancelled {
            if let Err(e) = self.refund_contribution(contribution).await {
                warn!(
                    contribution_id = %contribution.id,
                    "Late contribution on cancelled event not yet refunded: {e}"
                );
            }
        }
        self.flush_notifications().await;
    }

    /// Best-effort immediate delivery; the reconciler retries what is left.
    pub async fn flush_notifications(&self) {
        if let Err(e) = notify::flush_outbox(&self.pool, self.dispatcher.as_ref()).await {
            warn!("Notification flush failed: {e}");
        }
    }
}
