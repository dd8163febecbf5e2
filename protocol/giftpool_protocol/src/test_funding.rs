use proptest::prelude::*;

use crate::invariants::{assert_apply_invariant, commit};
use crate::{EventStatus, FundingSnapshot, Milestone, MilestoneSet, ProtocolError};

fn active_event(target: Option<i64>) -> FundingSnapshot {
    FundingSnapshot {
        status: EventStatus::Active,
        target_amount: target,
        current_amount: 0,
        contributor_count: 0,
        milestones: MilestoneSet::new(),
        version: 0,
    }
}

#[test]
fn test_first_contribution_below_goal() {
    let event = active_event(Some(10_000));
    let outcome = event.apply_contribution(6_000).unwrap();

    assert_apply_invariant(&outcome, 6_000);
    assert_eq!(outcome.new_status, EventStatus::Active);
    assert_eq!(
        outcome.crossed_milestones,
        vec![
            Milestone::FirstContribution,
            Milestone::Percent25,
            Milestone::Percent50
        ]
    );
    assert_eq!(outcome.next_version, 1);
}

#[test]
fn test_reaching_goal_funds_event() {
    let mut event = active_event(Some(10_000));
    let first = event.apply_contribution(6_000).unwrap();
    commit(&mut event, &first);

    let second = event.apply_contribution(4_000).unwrap();
    assert!(second.status_changed());
    assert_eq!(second.new_status, EventStatus::Funded);
    assert_eq!(
        second.crossed_milestones,
        vec![Milestone::Percent75, Milestone::Percent100]
    );
}

#[test]
fn test_funded_event_keeps_accepting_confirmations() {
    let mut event = active_event(Some(10_000));
    let outcome = event.apply_contribution(10_000).unwrap();
    commit(&mut event, &outcome);
    assert_eq!(event.status, EventStatus::Funded);

    let late = event.apply_contribution(500).unwrap();
    assert_eq!(late.new_amount, 10_500);
    assert_eq!(late.new_status, EventStatus::Funded);
    assert!(late.crossed_milestones.is_empty());
}

#[test]
fn test_goal_less_event_never_funds() {
    let mut event = active_event(None);
    let outcome = event.apply_contribution(1_000_000).unwrap();
    assert_eq!(outcome.crossed_milestones, vec![Milestone::FirstContribution]);
    assert_eq!(outcome.new_status, EventStatus::Active);
    commit(&mut event, &outcome);

    let again = event.apply_contribution(1).unwrap();
    assert!(again.crossed_milestones.is_empty());
}

#[test]
fn test_cancelled_event_accounts_money_silently() {
    let mut event = active_event(Some(100));
    event.status = EventStatus::Cancelled;
    let outcome = event.apply_contribution(150).unwrap();
    assert_eq!(outcome.new_amount, 150);
    assert_eq!(outcome.new_status, EventStatus::Cancelled);
    assert!(outcome.crossed_milestones.is_empty());
}

#[test]
fn test_draft_event_rejects_confirmation() {
    let mut event = active_event(Some(100));
    event.status = EventStatus::Draft;
    assert_eq!(
        event.apply_contribution(10),
        Err(ProtocolError::NotAcceptingConfirmations(EventStatus::Draft))
    );
}

#[test]
fn test_non_positive_amount_rejected() {
    let event = active_event(Some(100));
    assert_eq!(event.apply_contribution(0), Err(ProtocolError::InvalidAmount(0)));
    assert_eq!(event.apply_refund(-5), Err(ProtocolError::InvalidAmount(-5)));
}

#[test]
fn test_refund_cannot_go_negative() {
    let mut event = active_event(Some(100));
    event.current_amount = 40;
    assert_eq!(event.apply_refund(40), Ok(0));
    assert!(matches!(
        event.apply_refund(41),
        Err(ProtocolError::AccountingViolation(_))
    ));
}

proptest! {
    /// However the amount is chunked, each milestone fires exactly once and
    /// the final amount is the exact sum.
    #[test]
    fn prop_milestones_fire_exactly_once(
        target in 1i64..50_000,
        chunks in prop::collection::vec(1i64..5_000, 1..60),
    ) {
        let mut event = active_event(Some(target));
        let mut fired = Vec::new();

        for amount in &chunks {
            let outcome = event.apply_contribution(*amount).unwrap();
            assert_apply_invariant(&outcome, *amount);
            fired.extend(outcome.crossed_milestones.iter().copied());
            commit(&mut event, &outcome);
        }

        let total: i64 = chunks.iter().sum();
        prop_assert_eq!(event.current_amount, total);

        let mut deduped = fired.clone();
        deduped.sort();
        deduped.dedup();
        prop_assert_eq!(deduped.len(), fired.len());

        for (threshold, tag) in Milestone::THRESHOLDS {
            let expected = total * 100 >= threshold as i64 * target;
            prop_assert_eq!(event.milestones.contains(&tag), expected);
        }
        prop_assert!(event.milestones.contains(&Milestone::FirstContribution));
        prop_assert_eq!(event.status == EventStatus::Funded, total >= target);
    }
}
