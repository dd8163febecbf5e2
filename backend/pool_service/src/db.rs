//! Database layer: migrations, queries and the idempotency store.
//!
//! Reads take the pool. Writes that belong to a larger atomic unit take a
//! `&mut SqliteConnection` borrowed from an open transaction; they must never
//! reach back into the pool while that transaction is open.

use std::str::FromStr;
use std::time::Duration;

use giftpool_protocol::{
    ContributionStatus, ContributorEntry, EventStatus, FundingSnapshot, Milestone, MilestoneSet,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{PoolError, Result};
use crate::models::{
    ContributionRecord, ContributorRow, EventRecord, NewEvent, NotificationKind, OutboxRow,
};

/// Establish a SQLite connection pool and run pending migrations.
///
/// An in-memory URL gets a single long-lived connection; every SQLite
/// connection to `:memory:` would otherwise see its own empty database.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let in_memory = url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────

const EVENT_COLUMNS: &str = "id, title, host_ref, status, target_amount, current_amount, \
     currency, contribution_deadline, cancel_reason, version, created_at, updated_at";

pub async fn insert_event(
    pool: &SqlitePool,
    id: &str,
    event: &NewEvent,
    currency: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO events
            (id, title, host_ref, status, target_amount, current_amount, currency,
             contribution_deadline, version, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, 0, ?8, ?8)
        "#,
    )
    .bind(id)
    .bind(&event.title)
    .bind(&event.host_ref)
    .bind(EventStatus::Draft.as_str())
    .bind(event.target_amount)
    .bind(currency)
    .bind(event.contribution_deadline)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_event(pool: &SqlitePool, id: &str) -> Result<Option<EventRecord>> {
    let row = sqlx::query_as::<_, EventRecord>(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn require_event(pool: &SqlitePool, id: &str) -> Result<EventRecord> {
    get_event(pool, id)
        .await?
        .ok_or_else(|| PoolError::EventNotFound(id.to_string()))
}

/// Read everything a funding write depends on.
///
/// The pieces are read separately; the version-checked write that follows
/// rejects the snapshot if any of them moved in between.
pub async fn load_snapshot(pool: &SqlitePool, id: &str) -> Result<(EventRecord, FundingSnapshot)> {
    let record = require_event(pool, id).await?;
    let milestones = get_milestones(pool, id).await?;
    let contributor_count = count_contributors(pool, id).await?;
    let snapshot = FundingSnapshot {
        status: record.status()?,
        target_amount: record.target_amount,
        current_amount: record.current_amount,
        contributor_count,
        milestones,
        version: record.version,
    };
    Ok((record, snapshot))
}

/// Conditional write of the mutable funding fields.
///
/// Succeeds only if the row is still at `expected_version`; returns whether
/// it did.
pub async fn compare_and_swap_event(
    conn: &mut SqliteConnection,
    id: &str,
    expected_version: i64,
    status: EventStatus,
    current_amount: i64,
    cancel_reason: Option<&str>,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE events
        SET    status = ?1,
               current_amount = ?2,
               cancel_reason = COALESCE(?3, cancel_reason),
               version = version + 1,
               updated_at = ?4
        WHERE  id = ?5 AND version = ?6
        "#,
    )
    .bind(status.as_str())
    .bind(current_amount)
    .bind(cancel_reason)
    .bind(now)
    .bind(id)
    .bind(expected_version)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Contributor log & milestones
// ─────────────────────────────────────────────────────────

pub async fn count_contributors(pool: &SqlitePool, event_id: &str) -> Result<usize> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM event_contributors WHERE event_id = ?1")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    Ok(count as usize)
}

pub async fn list_contributors(pool: &SqlitePool, event_id: &str) -> Result<Vec<ContributorEntry>> {
    let rows = sqlx::query_as::<_, ContributorRow>(
        r#"
        SELECT contributor_ref, amount, contributed_at, payment_ref, message, is_anonymous
        FROM   event_contributors
        WHERE  event_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(ContributorEntry::from).collect())
}

pub async fn append_contributor(
    conn: &mut SqliteConnection,
    event_id: &str,
    entry: &ContributorEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO event_contributors
            (event_id, contributor_ref, amount, contributed_at, payment_ref, message, is_anonymous)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(event_id)
    .bind(&entry.contributor_ref)
    .bind(entry.amount)
    .bind(entry.contributed_at)
    .bind(&entry.payment_ref)
    .bind(&entry.message)
    .bind(entry.is_anonymous)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_milestones(pool: &SqlitePool, event_id: &str) -> Result<MilestoneSet> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT tag FROM event_milestones WHERE event_id = ?1")
        .bind(event_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|(tag,)| {
            tag.parse::<Milestone>()
                .map_err(|_| PoolError::Corrupt(format!("milestone tag {tag}")))
        })
        .collect()
}

/// Plain insert: the `(event_id, tag)` primary key turns a second record of
/// the same milestone into an error that aborts the surrounding transaction.
pub async fn insert_milestone(
    conn: &mut SqliteConnection,
    event_id: &str,
    tag: Milestone,
    now: i64,
) -> Result<()> {
    sqlx::query("INSERT INTO event_milestones (event_id, tag, reached_at) VALUES (?1, ?2, ?3)")
        .bind(event_id)
        .bind(tag.as_str())
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Contributions
// ─────────────────────────────────────────────────────────

const CONTRIBUTION_COLUMNS: &str = "id, event_id, contributor_ref, amount, message, is_anonymous, \
     payment_ref, status, created_at, confirmed_at, refunded_at, refund_ref";

pub async fn insert_contribution(pool: &SqlitePool, c: &ContributionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO contributions
            (id, event_id, contributor_ref, amount, message, is_anonymous, payment_ref,
             status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&c.id)
    .bind(&c.event_id)
    .bind(&c.contributor_ref)
    .bind(c.amount)
    .bind(&c.message)
    .bind(c.is_anonymous)
    .bind(&c.payment_ref)
    .bind(&c.status)
    .bind(c.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_contribution(pool: &SqlitePool, id: &str) -> Result<Option<ContributionRecord>> {
    let row = sqlx::query_as::<_, ContributionRecord>(&format!(
        "SELECT {CONTRIBUTION_COLUMNS} FROM contributions WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_contribution_by_payment_ref(
    pool: &SqlitePool,
    payment_ref: &str,
) -> Result<Option<ContributionRecord>> {
    let row = sqlx::query_as::<_, ContributionRecord>(&format!(
        "SELECT {CONTRIBUTION_COLUMNS} FROM contributions WHERE payment_ref = ?1"
    ))
    .bind(payment_ref)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_contributions(
    pool: &SqlitePool,
    event_id: &str,
) -> Result<Vec<ContributionRecord>> {
    let rows = sqlx::query_as::<_, ContributionRecord>(&format!(
        "SELECT {CONTRIBUTION_COLUMNS} FROM contributions WHERE event_id = ?1 \
         ORDER BY created_at ASC, id ASC"
    ))
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_contributions_with_status(
    pool: &SqlitePool,
    event_id: &str,
    status: ContributionStatus,
) -> Result<Vec<ContributionRecord>> {
    let rows = sqlx::query_as::<_, ContributionRecord>(&format!(
        "SELECT {CONTRIBUTION_COLUMNS} FROM contributions WHERE event_id = ?1 AND status = ?2 \
         ORDER BY created_at ASC, id ASC"
    ))
    .bind(event_id)
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Pending contributions created at or before `created_before`, least
/// recently checked first. Rows never checked come before all others.
pub async fn list_stale_pending(
    pool: &SqlitePool,
    created_before: i64,
    limit: i64,
) -> Result<Vec<ContributionRecord>> {
    let rows = sqlx::query_as::<_, ContributionRecord>(&format!(
        "SELECT {CONTRIBUTION_COLUMNS} FROM contributions \
         WHERE status = 'pending' AND created_at <= ?1 \
         ORDER BY COALESCE(last_checked_at, 0) ASC, created_at ASC, id ASC LIMIT ?2"
    ))
    .bind(created_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Stamp a pending contribution as just checked with the provider, moving
/// it to the back of the stale-pending queue.
pub async fn touch_checked(pool: &SqlitePool, id: &str, now: i64) -> Result<()> {
    sqlx::query("UPDATE contributions SET last_checked_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Succeeded contributions whose event has been cancelled.
pub async fn list_unrefunded_in_cancelled(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<ContributionRecord>> {
    let rows = sqlx::query_as::<_, ContributionRecord>(
        r#"
        SELECT c.id, c.event_id, c.contributor_ref, c.amount, c.message, c.is_anonymous,
               c.payment_ref, c.status, c.created_at, c.confirmed_at, c.refunded_at, c.refund_ref
        FROM   contributions c
        JOIN   events e ON e.id = c.event_id
        WHERE  e.status = 'cancelled' AND c.status = 'succeeded'
        ORDER  BY c.event_id, c.created_at
        LIMIT  ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// `pending → succeeded`, conditional on the contribution still being pending.
pub async fn claim_succeeded(conn: &mut SqliteConnection, id: &str, now: i64) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE contributions SET status = 'succeeded', confirmed_at = ?1 \
         WHERE id = ?2 AND status = 'pending'",
    )
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// `pending → failed`, conditional on the contribution still being pending.
pub async fn mark_failed(pool: &SqlitePool, id: &str, now: i64) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE contributions SET status = 'failed', confirmed_at = ?1 \
         WHERE id = ?2 AND status = 'pending'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// `pending → failed` for a capture the event can no longer take, recording
/// the refund that returned the money. Conditional on still being pending.
pub async fn reject_late_capture(
    pool: &SqlitePool,
    id: &str,
    refund_ref: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE contributions SET status = 'failed', confirmed_at = ?1, refunded_at = ?1, \
         refund_ref = ?2 WHERE id = ?3 AND status = 'pending'",
    )
    .bind(now)
    .bind(refund_ref)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// `succeeded → refunded`, conditional on the contribution still being succeeded.
pub async fn claim_refunded(
    conn: &mut SqliteConnection,
    id: &str,
    refund_ref: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE contributions SET status = 'refunded', refunded_at = ?1, refund_ref = ?2 \
         WHERE id = ?3 AND status = 'succeeded'",
    )
    .bind(now)
    .bind(refund_ref)
    .bind(id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn succeeded_amounts(pool: &SqlitePool, event_id: &str) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT amount FROM contributions WHERE event_id = ?1 AND status = 'succeeded'",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(a,)| a).collect())
}

/// `(event_id, current_amount, Σ succeeded)` for every event.
pub async fn conservation_rows(pool: &SqlitePool) -> Result<Vec<(String, i64, i64)>> {
    let rows = sqlx::query_as::<_, (String, i64, i64)>(
        r#"
        SELECT e.id, e.current_amount,
               COALESCE((SELECT SUM(c.amount) FROM contributions c
                         WHERE c.event_id = e.id AND c.status = 'succeeded'), 0)
        FROM   events e
        ORDER  BY e.id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Idempotency store
// ─────────────────────────────────────────────────────────

/// Record a provider event id. Returns `true` if it was not seen before.
///
/// `INSERT OR IGNORE` makes concurrent deliveries of the same event race on
/// the primary key: exactly one of them sees a row inserted.
pub async fn record_provider_event(
    pool: &SqlitePool,
    provider_event_id: &str,
    payment_ref: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT OR IGNORE INTO processed_provider_events
            (provider_event_id, payment_ref, processed_at)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(provider_event_id)
    .bind(payment_ref)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Notification outbox
// ─────────────────────────────────────────────────────────

pub async fn enqueue_notification(
    conn: &mut SqliteConnection,
    event_id: &str,
    kind: NotificationKind,
    payload: &serde_json::Value,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO notification_outbox (event_id, kind, payload, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(event_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(payload)?)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Undelivered records whose delivery lease is free or older than
/// `lease_expired_before`, in creation order.
pub async fn fetch_undelivered(
    pool: &SqlitePool,
    lease_expired_before: i64,
    limit: i64,
) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT id, event_id, kind, payload, created_at
        FROM   notification_outbox
        WHERE  delivered_at IS NULL
          AND  (claimed_at IS NULL OR claimed_at < ?1)
        ORDER  BY id ASC
        LIMIT  ?2
        "#,
    )
    .bind(lease_expired_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Take the delivery lease on a record. Returns `false` if it was delivered
/// or another flusher holds a live lease.
pub async fn claim_delivery(
    pool: &SqlitePool,
    id: i64,
    now: i64,
    lease_expired_before: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE notification_outbox SET claimed_at = ?1 \
         WHERE id = ?2 AND delivered_at IS NULL \
           AND (claimed_at IS NULL OR claimed_at < ?3)",
    )
    .bind(now)
    .bind(id)
    .bind(lease_expired_before)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Set once the dispatcher has accepted the record.
pub async fn mark_delivered(pool: &SqlitePool, id: i64, now: i64) -> Result<()> {
    sqlx::query("UPDATE notification_outbox SET delivered_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop the lease after a failed delivery.
pub async fn release_delivery(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE notification_outbox SET claimed_at = NULL WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
