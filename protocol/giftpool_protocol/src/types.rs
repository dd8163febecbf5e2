//! # Types
//!
//! Shared data structures used across the gift pool protocol.
//!
//! ## Event status as a finite-state machine
//!
//! [`EventStatus`] enforces a forward-only lifecycle:
//!
//! ```text
//! Draft ──► Active ──► Funded ──► Purchasing ──► Invested ──► Completed
//!   │         │          │            │
//!   └─────────┴──────────┴────────────┴──► Cancelled
//! ```
//!
//! `Active ──► Funded` is driven by the funding arithmetic when the goal is
//! reached; every other edge is host- or system-driven. `Completed` and
//! `Cancelled` are terminal.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// Lifecycle status of a pooled gift event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Created by the host, not yet open for contributions.
    Draft,
    /// Accepting contributions.
    Active,
    /// Goal reached.
    Funded,
    /// Host is buying the gift.
    Purchasing,
    /// Purchase completed.
    Invested,
    /// Gift delivered.
    Completed,
    /// Cancelled; succeeded contributions are refunded.
    Cancelled,
}

impl EventStatus {
    pub const ALL: [EventStatus; 7] = [
        EventStatus::Draft,
        EventStatus::Active,
        EventStatus::Funded,
        EventStatus::Purchasing,
        EventStatus::Invested,
        EventStatus::Completed,
        EventStatus::Cancelled,
    ];

    /// Return `true` if `self → to` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, to: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Funded)
                | (Funded, Purchasing)
                | (Purchasing, Invested)
                | (Invested, Completed)
                | (Draft, Cancelled)
                | (Active, Cancelled)
                | (Funded, Cancelled)
                | (Purchasing, Cancelled)
        )
    }

    /// Validate and perform a transition, returning the new status.
    pub fn transition(self, to: EventStatus) -> Result<EventStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(ProtocolError::InvalidStateTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }

    /// Only an active event accepts new contribution attempts.
    pub fn accepts_contributions(self) -> bool {
        self == EventStatus::Active
    }

    /// Whether a payment confirmation arriving now is still accounted.
    ///
    /// A payment the provider already captured must land in the pool even if
    /// the event moved on; on a cancelled event it is refunded afterwards.
    pub fn accepts_confirmations(self) -> bool {
        matches!(
            self,
            EventStatus::Active
                | EventStatus::Funded
                | EventStatus::Purchasing
                | EventStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Funded => "funded",
            Self::Purchasing => "purchasing",
            Self::Invested => "invested",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownTag(s.to_string()))
    }
}

/// Lifecycle status of a single contribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl ContributionStatus {
    /// `Succeeded`, `Failed` and `Refunded` are final as far as confirmation
    /// is concerned: replaying a confirmation against them is a no-op.
    pub fn is_settled(self) -> bool {
        !matches!(self, ContributionStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContributionStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// Payment status as reported by the provider (webhook or retrieval).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Succeeded,
    Failed,
    /// Still in flight at the provider; nothing to reconcile yet.
    Pending,
}

/// A named, one-time funding notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Milestone {
    #[serde(rename = "first_contribution")]
    FirstContribution,
    #[serde(rename = "25_percent")]
    Percent25,
    #[serde(rename = "50_percent")]
    Percent50,
    #[serde(rename = "75_percent")]
    Percent75,
    #[serde(rename = "100_percent")]
    Percent100,
}

impl Milestone {
    /// Percentage milestones paired with their thresholds, ascending.
    pub const THRESHOLDS: [(u64, Milestone); 4] = [
        (25, Milestone::Percent25),
        (50, Milestone::Percent50),
        (75, Milestone::Percent75),
        (100, Milestone::Percent100),
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstContribution => "first_contribution",
            Self::Percent25 => "25_percent",
            Self::Percent50 => "50_percent",
            Self::Percent75 => "75_percent",
            Self::Percent100 => "100_percent",
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Milestone {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first_contribution" => Ok(Self::FirstContribution),
            "25_percent" => Ok(Self::Percent25),
            "50_percent" => Ok(Self::Percent50),
            "75_percent" => Ok(Self::Percent75),
            "100_percent" => Ok(Self::Percent100),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// Milestones already fired for an event.
pub type MilestoneSet = BTreeSet<Milestone>;

/// One entry of an event's append-only contributor log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorEntry {
    pub contributor_ref: String,
    pub amount: i64,
    /// Unix seconds.
    pub contributed_at: i64,
    pub payment_ref: String,
    pub message: Option<String>,
    pub is_anonymous: bool,
}
