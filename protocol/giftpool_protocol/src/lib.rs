//! # Gift Pool Protocol
//!
//! Pure domain rules for pooled gift funding. No storage, no network: the
//! service crate reads a [`FundingSnapshot`], asks this crate for the next
//! state, and persists it with a version-checked write.
//!
//! | Concern          | Entry Point(s)                                        |
//! |------------------|-------------------------------------------------------|
//! | Lifecycle        | [`EventStatus::transition`], [`EventStatus::can_transition_to`] |
//! | Funding          | [`FundingSnapshot::apply_contribution`], [`FundingSnapshot::apply_refund`] |
//! | Milestones       | [`detect_crossed`], [`funding_percent`]               |
//! | Fee estimate     | [`estimate_fee`], [`net_payout_estimate`]             |
//!
//! Money is always an integer count of the smallest currency unit.

use thiserror::Error;

mod funding;
mod milestones;
mod types;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod test_funding;

pub use funding::{estimate_fee, net_payout_estimate, FundingOutcome, FundingSnapshot};
pub use milestones::{detect_crossed, funding_percent};
pub use types::{
    ContributionStatus, ContributorEntry, EventStatus, Milestone, MilestoneSet, ReportedStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: EventStatus, to: EventStatus },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("event in status {0} does not accept payment confirmations")]
    NotAcceptingConfirmations(EventStatus),

    #[error("accounting violation: {0}")]
    AccountingViolation(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
