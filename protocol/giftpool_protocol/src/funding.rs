//! Pooled-amount arithmetic.
//!
//! [`FundingSnapshot`] is what a writer reads before its conditional update.
//! The methods here compute the complete next state (amount, milestones,
//! status) so the storage layer can persist it in one version-checked write.

use serde::{Deserialize, Serialize};

use crate::milestones::{detect_crossed, funding_percent};
use crate::types::{EventStatus, Milestone, MilestoneSet};
use crate::{ProtocolError, Result};

/// Card processing fee: 2.9% of the amount plus a fixed 30 cents.
const FEE_RATE_PER_MILLE: i128 = 29;
const FEE_FIXED_CENTS: i128 = 30;

/// The funding-relevant part of an event, as read at `version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingSnapshot {
    pub status: EventStatus,
    pub target_amount: Option<i64>,
    pub current_amount: i64,
    pub contributor_count: usize,
    pub milestones: MilestoneSet,
    pub version: i64,
}

/// Result of applying one confirmed contribution to a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingOutcome {
    pub previous_amount: i64,
    pub new_amount: i64,
    pub crossed_milestones: Vec<Milestone>,
    pub previous_status: EventStatus,
    pub new_status: EventStatus,
    /// Version the conditional write must install.
    pub next_version: i64,
}

impl FundingOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.new_status
    }
}

impl FundingSnapshot {
    pub fn has_goal(&self) -> bool {
        self.target_amount.is_some_and(|t| t > 0)
    }

    pub fn percent(&self) -> Option<u64> {
        funding_percent(self.current_amount, self.target_amount)
    }

    /// Compute the state after adding a confirmed contribution of `amount`.
    ///
    /// On a cancelled event the money is still accounted (it was captured by
    /// the provider and will be refunded) but no milestone fires and the
    /// status does not move.
    pub fn apply_contribution(&self, amount: i64) -> Result<FundingOutcome> {
        if amount <= 0 {
            return Err(ProtocolError::InvalidAmount(amount));
        }
        if !self.status.accepts_confirmations() {
            return Err(ProtocolError::NotAcceptingConfirmations(self.status));
        }

        let new_amount = self.current_amount.checked_add(amount).ok_or_else(|| {
            ProtocolError::AccountingViolation(format!(
                "pooled amount overflow: {} + {}",
                self.current_amount, amount
            ))
        })?;

        let (crossed_milestones, new_status) = if self.status == EventStatus::Cancelled {
            (Vec::new(), self.status)
        } else {
            let crossed = detect_crossed(
                self.percent(),
                funding_percent(new_amount, self.target_amount),
                self.contributor_count,
                &self.milestones,
            );
            let goal_reached = self
                .target_amount
                .is_some_and(|target| target > 0 && new_amount >= target);
            let status = if goal_reached && self.status == EventStatus::Active {
                self.status.transition(EventStatus::Funded)?
            } else {
                self.status
            };
            (crossed, status)
        };

        Ok(FundingOutcome {
            previous_amount: self.current_amount,
            new_amount,
            crossed_milestones,
            previous_status: self.status,
            new_status,
            next_version: self.version + 1,
        })
    }

    /// Compute the pooled amount after refunding `amount`.
    pub fn apply_refund(&self, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(ProtocolError::InvalidAmount(amount));
        }
        let remaining = self.current_amount - amount;
        if remaining < 0 {
            return Err(ProtocolError::AccountingViolation(format!(
                "refund of {amount} exceeds pooled amount {}",
                self.current_amount
            )));
        }
        Ok(remaining)
    }
}

/// Advisory processing fee for a single contribution, in cents.
///
/// Never deducted from the pooled amount; it only feeds the net payout
/// estimate shown to the host. Computed in `i128` and clamped, so any
/// `i64` amount is accepted.
pub fn estimate_fee(amount: i64) -> i64 {
    if amount <= 0 {
        return 0;
    }
    clamp((i128::from(amount) * FEE_RATE_PER_MILLE + 500) / 1000 + FEE_FIXED_CENTS)
}

/// `(total_fees, net_payout)` over the amounts of succeeded contributions.
pub fn net_payout_estimate<I>(amounts: I) -> (i64, i64)
where
    I: IntoIterator<Item = i64>,
{
    let (fees, net) = amounts
        .into_iter()
        .fold((0i128, 0i128), |(fees, net), amount| {
            let fee = i128::from(estimate_fee(amount));
            (fees + fee, net + i128::from(amount) - fee)
        });
    (clamp(fees), clamp(net))
}

fn clamp(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}
