//! Long-running background task that repairs what the request paths leave
//! behind: stale pending payments, refunds that failed during cancellation,
//! undelivered notifications. It also audits the conservation of pooled money.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::errors::Result;
use crate::ledger::Ledger;
use crate::notify;

pub const SWEEP_BATCH: i64 = 200;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// Pending contributions older than this are re-checked with the provider.
    pub stale_after_secs: i64,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub settled: usize,
    pub refunded: usize,
    pub delivered: usize,
    pub mismatches: Vec<String>,
}

/// Run sweeps every `settings.interval` until `shutdown` is cancelled.
pub async fn run(ledger: Arc<Ledger>, settings: ReconcilerSettings, shutdown: CancellationToken) {
    info!(
        interval_secs = settings.interval.as_secs(),
        stale_after_secs = settings.stale_after_secs,
        "Reconciler starting"
    );

    loop {
        match sweep_once(&ledger, settings.stale_after_secs).await {
            Ok(report) if report != SweepReport::default() => {
                info!(
                    settled = report.settled,
                    refunded = report.refunded,
                    delivered = report.delivered,
                    mismatches = report.mismatches.len(),
                    "Reconciler sweep"
                );
            }
            Ok(_) => debug!("Reconciler sweep found nothing to do"),
            Err(e) => error!("Reconciler sweep error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Reconciler stopping");
                return;
            }
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

/// Perform a single sweep.
pub async fn sweep_once(ledger: &Ledger, stale_after_secs: i64) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let now = chrono::Utc::now().timestamp();

    // Pending payments whose confirmation never reached us. Each one checked
    // goes to the back of the queue, so intents the provider keeps reporting
    // as pending cannot starve the rest.
    let stale = db::list_stale_pending(&ledger.pool, now - stale_after_secs, SWEEP_BATCH).await?;
    for contribution in stale {
        db::touch_checked(&ledger.pool, &contribution.id, now).await?;
        match ledger.confirm_payment(&contribution.payment_ref).await {
            Ok(result) if result.contribution.status != contribution.status => report.settled += 1,
            Ok(_) => {}
            Err(e) => warn!(
                payment_ref = %contribution.payment_ref,
                "Stale pending contribution not reconciled: {e}"
            ),
        }
    }

    // Refunds that failed while cancelling.
    let unrefunded = db::list_unrefunded_in_cancelled(&ledger.pool, SWEEP_BATCH).await?;
    for contribution in unrefunded {
        match ledger.refund_contribution(&contribution).await {
            Ok(true) => report.refunded += 1,
            Ok(false) => {}
            Err(e) => warn!(
                contribution_id = %contribution.id,
                event_id = %contribution.event_id,
                "Refund retry failed: {e}"
            ),
        }
    }

    report.delivered = notify::flush_outbox(&ledger.pool, ledger.dispatcher.as_ref()).await?;
    report.mismatches = audit_conservation(&ledger.pool).await?;

    Ok(report)
}

/// Check `current_amount == Σ succeeded` for every event.
///
/// Mismatches are reported at error level for an operator and never
/// corrected here.
pub async fn audit_conservation(pool: &sqlx::SqlitePool) -> Result<Vec<String>> {
    let mut mismatched = Vec::new();
    for (event_id, current_amount, succeeded_total) in db::conservation_rows(pool).await? {
        if current_amount != succeeded_total {
            error!(
                fatal = true,
                event_id = %event_id,
                current_amount,
                succeeded_total,
                "Pooled amount does not match succeeded contributions"
            );
            mismatched.push(event_id);
        }
    }
    Ok(mismatched)
}
