/// Fractional-Kelly position sizing.
///
/// Standard formula:
///   f* = (b·p − q) / b
/// where
///   b  = net odds received on the bet (profit per unit staked, i.e. (1/implied) − 1)
///   p  = model probability of winning
///   q  = 1 − p
///
/// A fractional multiplier (0 < multiplier ≤ 0.5 here) is applied because
/// the model probability is itself an estimate; full Kelly on a noisy edge
/// estimate oversizes systematically.
use crate::db::models::{Candidate, MarketQuote};

use super::edge::EdgedCandidate;

#[derive(Debug, Clone, Copy)]
pub struct SizingConfig {
    /// Fractional Kelly multiplier (0.0–0.5)
    pub kelly_fraction: f64,
    /// Current bankroll in currency
    pub bankroll: f64,
    /// Currency value of one unit
    pub unit_size: f64,
    pub min_stake_units: f64,
    pub max_stake_units: f64,
}

/// Calculate the full-Kelly fraction of bankroll for a bet priced at the
/// given implied probability. Returns 0.0 when there is no positive-EV
/// stake at this price.
pub fn kelly_fraction(model_prob: f64, implied_prob: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&model_prob), "model_prob out of range");

    if implied_prob <= 0.0 || implied_prob >= 1.0 {
        return 0.0;
    }

    // Net odds per unit staked (implied 0.4 → b = 1.5)
    let b = (1.0 / implied_prob) - 1.0;
    let p = model_prob;
    let q = 1.0 - p;

    let f = (b * p - q) / b;
    f.max(0.0)
}

/// Size one candidate. Returns `None` when the computed stake is zero or
/// negative: a non-positive Kelly stake means the model disagrees with the
/// direction implied by the edge sign, which signals an upstream
/// computation error and must not silently become a minimum-size bet in
/// the same direction. Positive stakes are clamped to the unit bounds.
pub fn size_candidate(candidate: &EdgedCandidate, config: &SizingConfig) -> Option<Candidate> {
    let full = kelly_fraction(
        candidate.model_probability,
        candidate.quote.implied_probability,
    );
    if full <= 0.0 {
        return None;
    }

    let stake = full * config.kelly_fraction * config.bankroll;
    let units = stake / config.unit_size;
    if units <= 0.0 {
        return None;
    }

    let units = units.clamp(config.min_stake_units, config.max_stake_units);
    Some(build_candidate(candidate, units, units * config.unit_size))
}

fn build_candidate(candidate: &EdgedCandidate, units: f64, stake: f64) -> Candidate {
    let EdgedCandidate {
        quote,
        model_probability,
        confidence,
        edge,
    } = candidate;
    Candidate {
        quote: MarketQuote::clone(quote),
        model_probability: *model_probability,
        confidence: *confidence,
        edge: *edge,
        stake,
        stake_units: units,
    }
}
