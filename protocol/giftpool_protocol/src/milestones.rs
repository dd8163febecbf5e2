//! Milestone detection.
//!
//! A pure function over the funding percentage before and after a write plus
//! the milestones already recorded for the event. Callers persist whatever is
//! returned in the same write that moved the amount, so a tag can only ever be
//! emitted by the writer whose conditional update won.

use crate::types::{Milestone, MilestoneSet};

/// Floor percentage of `amount` against `target`.
///
/// Returns `None` for goal-less events (no target, or a non-positive one).
/// Flooring is exact for integer thresholds: `t <= floor(x)` iff `t <= x`.
pub fn funding_percent(amount: i64, target: Option<i64>) -> Option<u64> {
    let target = target.filter(|t| *t > 0)?;
    let amount = amount.max(0) as i128;
    Some((amount * 100 / target as i128) as u64)
}

/// Milestones crossed by moving from `before_pct` to `after_pct`.
///
/// * A percentage tag is returned iff `before < threshold <= after` and the
///   tag is not in `already_reached`.
/// * `FirstContribution` is returned when the contributor log was empty
///   (`contributors_before == 0`) and the tag was never fired.
/// * Goal-less events pass `None` percentages and only ever get
///   `FirstContribution`.
///
/// The result is ordered: `FirstContribution` first, then ascending
/// thresholds.
pub fn detect_crossed(
    before_pct: Option<u64>,
    after_pct: Option<u64>,
    contributors_before: usize,
    already_reached: &MilestoneSet,
) -> Vec<Milestone> {
    let mut crossed = Vec::new();

    if contributors_before == 0 && !already_reached.contains(&Milestone::FirstContribution) {
        crossed.push(Milestone::FirstContribution);
    }

    if let (Some(before), Some(after)) = (before_pct, after_pct) {
        for (threshold, tag) in Milestone::THRESHOLDS {
            if before < threshold && threshold <= after && !already_reached.contains(&tag) {
                crossed.push(tag);
            }
        }
    }

    crossed
}
