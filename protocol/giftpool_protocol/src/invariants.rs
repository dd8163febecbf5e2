#![allow(dead_code)]

use crate::funding::{FundingOutcome, FundingSnapshot};
use crate::types::{EventStatus, MilestoneSet};

/// The pooled amount must never be negative.
pub fn assert_amount_non_negative(snapshot: &FundingSnapshot) {
    assert!(
        snapshot.current_amount >= 0,
        "pooled amount is negative ({})",
        snapshot.current_amount
    );
}

/// After applying `amount`, the pool grows by exactly `amount`.
pub fn assert_apply_invariant(outcome: &FundingOutcome, amount: i64) {
    assert_eq!(
        outcome.new_amount,
        outcome.previous_amount + amount,
        "apply invariant broken: {} + {} != {}",
        outcome.previous_amount,
        amount,
        outcome.new_amount
    );
}

/// A goal-bearing active event at or above target must be funded.
pub fn assert_funded_when_goal_reached(snapshot: &FundingSnapshot) {
    if let Some(target) = snapshot.target_amount.filter(|t| *t > 0) {
        if snapshot.current_amount >= target {
            assert_ne!(
                snapshot.status,
                EventStatus::Active,
                "event at {} of {} is still active",
                snapshot.current_amount,
                target
            );
        }
    }
}

/// Newly crossed milestones are disjoint from the ones already recorded.
pub fn assert_no_refire(already: &MilestoneSet, outcome: &FundingOutcome) {
    for tag in &outcome.crossed_milestones {
        assert!(!already.contains(tag), "milestone {tag} fired twice");
    }
}

/// Only lifecycle edges may be observed between two statuses.
pub fn assert_valid_status_change(from: EventStatus, to: EventStatus) {
    assert!(
        from == to || from.can_transition_to(to),
        "invalid status change from {from} to {to}"
    );
}

/// Fold an outcome back into the snapshot, as a successful write would.
pub fn commit(snapshot: &mut FundingSnapshot, outcome: &FundingOutcome) {
    assert_no_refire(&snapshot.milestones, outcome);
    assert_valid_status_change(snapshot.status, outcome.new_status);
    snapshot.current_amount = outcome.new_amount;
    snapshot.status = outcome.new_status;
    snapshot.milestones.extend(outcome.crossed_milestones.iter().copied());
    snapshot.contributor_count += 1;
    snapshot.version = outcome.next_version;
    assert_amount_non_negative(snapshot);
    assert_funded_when_goal_reached(snapshot);
}
