use std::cmp::Ordering;

use tracing::info;

use crate::db::models::Candidate;

/// Result of the greedy budget allocation.
#[derive(Debug)]
pub struct Allocation {
    pub accepted: Vec<Candidate>,
    pub rejected_by_budget: usize,
}

/// Rank all candidates across all venues and accept greedily until the
/// next candidate would exceed the daily budget. That candidate and every
/// lower-ranked one are rejected outright — no partial fills, because a
/// half-sized bet breaks the sizing model's assumptions.
///
/// Ordering is edge descending, ties broken by higher confidence, then by
/// a stable key (event, venue, market, side), so re-running on identical
/// inputs reproduces the same accepted set.
pub fn allocate(mut candidates: Vec<Candidate>, budget_units: f64) -> Allocation {
    candidates.sort_by(rank);

    let mut accepted = Vec::new();
    let mut committed_units = 0.0f64;
    let mut rejected_by_budget = 0usize;
    let mut budget_exhausted = false;

    for candidate in candidates {
        if budget_exhausted || committed_units + candidate.stake_units > budget_units {
            if !budget_exhausted {
                info!(
                    "Daily budget reached at {:.2}/{:.2} units; rejecting remaining candidates",
                    committed_units, budget_units
                );
            }
            budget_exhausted = true;
            rejected_by_budget += 1;
            continue;
        }
        committed_units += candidate.stake_units;
        accepted.push(candidate);
    }

    Allocation {
        accepted,
        rejected_by_budget,
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.edge
        .total_cmp(&a.edge)
        .then(b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.quote.event_id.cmp(&b.quote.event_id))
        .then_with(|| a.quote.venue.cmp(&b.quote.venue))
        .then_with(|| a.quote.market_key().cmp(&b.quote.market_key()))
        .then_with(|| a.quote.side.as_str().cmp(b.quote.side.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{MarketQuote, Side, VenueKind};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn candidate(event: &str, edge: f64, confidence: f64, units: f64) -> Candidate {
        Candidate {
            quote: MarketQuote {
                venue: "v".into(),
                venue_kind: VenueKind::FixedOdds,
                event_id: event.into(),
                entity_id: "player-1".into(),
                statistic: "points".into(),
                line: Some(20.5),
                side: Side::Over,
                price: 1.9,
                implied_probability: 1.0 / 1.9,
                fetched_at: Utc::now(),
            },
            model_probability: 0.6,
            confidence,
            edge,
            stake: units * 10.0,
            stake_units: units,
        }
    }

    #[test]
    fn test_scenario_c_budget_fill() {
        // 10 candidates at 1.2 units, budget 10 → exactly 8 accepted
        let candidates: Vec<_> = (0..10)
            .map(|i| candidate(&format!("evt-{i}"), 0.10 - i as f64 * 0.005, 0.8, 1.2))
            .collect();
        let allocation = allocate(candidates, 10.0);
        assert_eq!(allocation.accepted.len(), 8);
        assert_eq!(allocation.rejected_by_budget, 2);
        let total: f64 = allocation.accepted.iter().map(|c| c.stake_units).sum();
        assert!(total <= 10.0);
        assert_relative_eq!(total, 9.6, epsilon = 1e-9);
    }

    #[test]
    fn test_accepts_by_edge_rank() {
        let candidates = vec![
            candidate("evt-low", 0.05, 0.8, 5.0),
            candidate("evt-high", 0.20, 0.8, 5.0),
            candidate("evt-mid", 0.10, 0.8, 5.0),
        ];
        let allocation = allocate(candidates, 10.0);
        assert_eq!(allocation.accepted.len(), 2);
        assert_eq!(allocation.accepted[0].quote.event_id, "evt-high");
        assert_eq!(allocation.accepted[1].quote.event_id, "evt-mid");
    }

    #[test]
    fn test_no_partial_fill_past_cutoff() {
        // Second candidate would exceed; a smaller third one that would
        // still fit is rejected too — acceptance is a prefix of the rank.
        let candidates = vec![
            candidate("evt-1", 0.20, 0.8, 8.0),
            candidate("evt-2", 0.15, 0.8, 5.0),
            candidate("evt-3", 0.10, 0.8, 1.0),
        ];
        let allocation = allocate(candidates, 10.0);
        assert_eq!(allocation.accepted.len(), 1);
        assert_eq!(allocation.rejected_by_budget, 2);
    }

    #[test]
    fn test_ties_broken_by_confidence_then_key() {
        let candidates = vec![
            candidate("evt-b", 0.10, 0.7, 4.0),
            candidate("evt-a", 0.10, 0.7, 4.0),
            candidate("evt-c", 0.10, 0.9, 4.0),
        ];
        let allocation = allocate(candidates, 8.0);
        assert_eq!(allocation.accepted[0].quote.event_id, "evt-c");
        assert_eq!(allocation.accepted[1].quote.event_id, "evt-a");
    }

    #[test]
    fn test_deterministic_across_input_order() {
        let mut forward = vec![
            candidate("evt-1", 0.12, 0.8, 3.0),
            candidate("evt-2", 0.11, 0.8, 3.0),
            candidate("evt-3", 0.10, 0.8, 3.0),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();
        let a = allocate(std::mem::take(&mut forward), 6.0);
        let b = allocate(reversed, 6.0);
        let keys =
            |alloc: &Allocation| -> Vec<String> {
                alloc.accepted.iter().map(|c| c.quote.event_id.clone()).collect()
            };
        assert_eq!(keys(&a), keys(&b));
    }

    #[test]
    fn test_underfilled_when_few_qualify() {
        let allocation = allocate(vec![candidate("evt-1", 0.1, 0.8, 2.0)], 10.0);
        assert_eq!(allocation.accepted.len(), 1);
        assert_eq!(allocation.rejected_by_budget, 0);
    }
}
