//! Notification dispatch.
//!
//! Funding writes enqueue notification records into the outbox inside their
//! own transaction. [`flush_outbox`] hands undelivered records to a
//! [`NotificationDispatcher`]; chat-message creation and socket push are the
//! dispatcher's business, not ours.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db;
use crate::errors::Result;
use crate::models::Notification;

const FLUSH_BATCH: i64 = 100;

/// How long a claimed record is reserved for the flusher that claimed it.
pub const DELIVERY_LEASE_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct DispatchError(pub String);

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> std::result::Result<(), DispatchError>;
}

/// Writes each notification as a structured log line.
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn dispatch(&self, n: &Notification) -> std::result::Result<(), DispatchError> {
        info!(
            event_id = %n.event_id,
            kind = n.kind.as_str(),
            payload = %n.payload,
            "notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a collaborator endpoint.
pub struct HttpDispatcher {
    client: Client,
    url: String,
}

impl HttpDispatcher {
    pub fn new(url: &str, timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for HttpDispatcher {
    async fn dispatch(&self, n: &Notification) -> std::result::Result<(), DispatchError> {
        let resp = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .map_err(|e| DispatchError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DispatchError(format!("collaborator answered {}", resp.status())));
        }
        Ok(())
    }
}

/// Deliver undelivered outbox records in creation order.
///
/// Each record is leased before it is dispatched and only marked delivered
/// once the dispatcher accepted it. A lease left behind by a crashed or
/// cancelled flush expires after [`DELIVERY_LEASE_SECS`] and the record is
/// picked up again. A failed delivery drops its lease and stops the flush so
/// later records are not delivered ahead of it. Returns the number delivered.
pub async fn flush_outbox(pool: &SqlitePool, dispatcher: &dyn NotificationDispatcher) -> Result<usize> {
    let lease_expired_before = chrono::Utc::now().timestamp() - DELIVERY_LEASE_SECS;
    let rows = db::fetch_undelivered(pool, lease_expired_before, FLUSH_BATCH).await?;
    let mut delivered = 0usize;

    for row in rows {
        let notification = Notification::try_from(row)?;
        let now = chrono::Utc::now().timestamp();
        if !db::claim_delivery(pool, notification.id, now, lease_expired_before).await? {
            continue;
        }
        if let Err(e) = dispatcher.dispatch(&notification).await {
            warn!(notification_id = notification.id, "Notification delivery deferred: {e}");
            db::release_delivery(pool, notification.id).await?;
            break;
        }
        db::mark_delivered(pool, notification.id, chrono::Utc::now().timestamp()).await?;
        delivered += 1;
    }

    Ok(delivered)
}
