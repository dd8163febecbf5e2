//! Records as stored in / read from the database, and the response shapes
//! built from them.

use giftpool_protocol::{
    funding_percent, net_payout_estimate, ContributionStatus, ContributorEntry, EventStatus,
    Milestone, MilestoneSet,
};
use serde::{Deserialize, Serialize};

use crate::errors::{PoolError, Result};

const ANONYMOUS: &str = "anonymous";

/// An `events` row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: String,
    pub title: String,
    pub host_ref: String,
    pub status: String,
    pub target_amount: Option<i64>,
    pub current_amount: i64,
    pub currency: String,
    pub contribution_deadline: Option<i64>,
    pub cancel_reason: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EventRecord {
    pub fn status(&self) -> Result<EventStatus> {
        self.status
            .parse()
            .map_err(|_| PoolError::Corrupt(format!("event {} status {}", self.id, self.status)))
    }

    pub fn has_goal(&self) -> bool {
        self.target_amount.is_some_and(|t| t > 0)
    }

    /// Whether `now` (unix seconds) is past the contribution deadline.
    pub fn deadline_passed(&self, now: i64) -> bool {
        self.contribution_deadline.is_some_and(|deadline| now > deadline)
    }
}

/// A `contributions` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContributionRecord {
    pub id: String,
    pub event_id: String,
    pub contributor_ref: String,
    pub amount: i64,
    pub message: Option<String>,
    pub is_anonymous: bool,
    pub payment_ref: String,
    pub status: String,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub refunded_at: Option<i64>,
    pub refund_ref: Option<String>,
}

impl ContributionRecord {
    pub fn status(&self) -> Result<ContributionStatus> {
        self.status.parse().map_err(|_| {
            PoolError::Corrupt(format!("contribution {} status {}", self.id, self.status))
        })
    }
}

/// An `event_contributors` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContributorRow {
    pub contributor_ref: String,
    pub amount: i64,
    pub contributed_at: i64,
    pub payment_ref: String,
    pub message: Option<String>,
    pub is_anonymous: bool,
}

impl From<ContributorRow> for ContributorEntry {
    fn from(row: ContributorRow) -> Self {
        ContributorEntry {
            contributor_ref: row.contributor_ref,
            amount: row.amount,
            contributed_at: row.contributed_at,
            payment_ref: row.payment_ref,
            message: row.message,
            is_anonymous: row.is_anonymous,
        }
    }
}

/// Input for `POST /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub host_ref: String,
    pub target_amount: Option<i64>,
    pub contribution_deadline: Option<i64>,
}

/// Input for `POST /events/:id/contributions`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewContribution {
    pub contributor_ref: String,
    pub amount: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// A contributor log entry as shown to other participants.
#[derive(Debug, Clone, Serialize)]
pub struct PublicContributor {
    pub contributor_ref: String,
    pub amount: i64,
    pub contributed_at: i64,
    pub message: Option<String>,
    pub is_anonymous: bool,
}

impl From<ContributorEntry> for PublicContributor {
    fn from(entry: ContributorEntry) -> Self {
        PublicContributor {
            contributor_ref: if entry.is_anonymous {
                ANONYMOUS.to_string()
            } else {
                entry.contributor_ref
            },
            amount: entry.amount,
            contributed_at: entry.contributed_at,
            message: entry.message,
            is_anonymous: entry.is_anonymous,
        }
    }
}

/// Full event representation returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub id: String,
    pub title: String,
    pub host_ref: String,
    pub status: EventStatus,
    pub has_goal: bool,
    pub target_amount: Option<i64>,
    pub current_amount: i64,
    pub currency: String,
    pub funding_percent: Option<u64>,
    pub contribution_deadline: Option<i64>,
    pub contributors: Vec<PublicContributor>,
    pub milestones_reached: Vec<Milestone>,
    /// Succeeded contributions of a cancelled event still awaiting refund.
    pub refunds_pending: i64,
    /// Advisory only; never deducted from `current_amount`.
    pub estimated_fees: i64,
    pub net_payout_estimate: i64,
    pub cancel_reason: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EventView {
    pub fn build(
        record: EventRecord,
        contributors: Vec<ContributorEntry>,
        milestones: MilestoneSet,
        succeeded_amounts: Vec<i64>,
    ) -> Result<Self> {
        let status = record.status()?;
        let (estimated_fees, net_payout_estimate) = net_payout_estimate(succeeded_amounts.iter().copied());
        let refunds_pending = if status == EventStatus::Cancelled {
            succeeded_amounts.len() as i64
        } else {
            0
        };
        Ok(EventView {
            has_goal: record.has_goal(),
            funding_percent: funding_percent(record.current_amount, record.target_amount),
            status,
            contributors: contributors.into_iter().map(PublicContributor::from).collect(),
            milestones_reached: milestones.into_iter().collect(),
            refunds_pending,
            estimated_fees,
            net_payout_estimate,
            id: record.id,
            title: record.title,
            host_ref: record.host_ref,
            target_amount: record.target_amount,
            current_amount: record.current_amount,
            currency: record.currency,
            contribution_deadline: record.contribution_deadline,
            cancel_reason: record.cancel_reason,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// A newly created contribution plus the secret the client needs to pay.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedContribution {
    pub contribution: ContributionRecord,
    pub client_secret: String,
}

/// What a successful apply did to the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedFunding {
    pub event_id: String,
    pub new_amount: i64,
    pub event_status: EventStatus,
    pub status_changed: bool,
    pub crossed_milestones: Vec<Milestone>,
    pub version: i64,
}

/// Result of reconciling a payment confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationResult {
    pub contribution: ContributionRecord,
    /// `true` when this call changed nothing because the contribution had
    /// already been settled (replayed confirmation).
    pub already_processed: bool,
    /// Present only when this call moved money into the pool.
    pub applied: Option<AppliedFunding>,
}

/// Provider-pushed webhook payload, after signature verification.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub provider_event_id: String,
    pub payment_ref: String,
    pub reported_status: giftpool_protocol::ReportedStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Provider event id already recorded; nothing was done.
    Duplicate,
    Processed { result: ConfirmationResult },
    /// Recorded, but reconciliation failed; the background sweep retries it.
    Deferred { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub event: EventView,
    pub refunded: usize,
    pub refunds_pending: usize,
}

/// Kind of a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Contribution,
    Milestone,
    PurchaseComplete,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contribution => "contribution",
            Self::Milestone => "milestone",
            Self::PurchaseComplete => "purchase_complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contribution" => Some(Self::Contribution),
            "milestone" => Some(Self::Milestone),
            "purchase_complete" => Some(Self::PurchaseComplete),
            _ => None,
        }
    }
}

/// A `notification_outbox` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub event_id: String,
    pub kind: String,
    pub payload: String,
    pub created_at: i64,
}

/// Record handed to the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: i64,
    pub event_id: String,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

impl TryFrom<OutboxRow> for Notification {
    type Error = PoolError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        let kind = NotificationKind::parse(&row.kind)
            .ok_or_else(|| PoolError::Corrupt(format!("notification kind {}", row.kind)))?;
        Ok(Notification {
            id: row.id,
            event_id: row.event_id,
            kind,
            payload: serde_json::from_str(&row.payload)?,
            created_at: row.created_at,
        })
    }
}
