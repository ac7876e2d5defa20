use std::collections::HashMap;

use tracing::debug;

use crate::db::models::{MarketQuote, Projection, Side};

/// Thresholds applied as hard filters before sizing. A candidate below
/// either threshold is discarded, not down-weighted: sizing a position the
/// model is not confident about is worse than passing.
#[derive(Debug, Clone, Copy)]
pub struct EdgeThresholds {
    pub min_edge: f64,
    pub min_confidence: f64,
}

/// A matched (quote, projection) pair that cleared the hard filters.
/// Stake fields are filled in by the sizer.
#[derive(Debug, Clone)]
pub struct EdgedCandidate {
    pub quote: MarketQuote,
    pub model_probability: f64,
    pub confidence: f64,
    pub edge: f64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeStats {
    pub matched: usize,
    pub below_min_edge: usize,
    pub below_min_confidence: usize,
}

/// Standard normal CDF via the Abramowitz–Stegun erf approximation
/// (maximum absolute error ~1.5e-7).
pub fn normal_cdf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let z = x.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + p * z);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-z * z).exp();

    0.5 * (1.0 + sign * y)
}

/// Model probability of the market's side occurring, under a normal
/// approximation over the projection's point estimate and dispersion.
///
/// Over/under markets integrate the tail mass around the line. For
/// moneyline-equivalents the projection's point estimate is itself the win
/// probability (dispersion is its standard error).
pub fn model_probability(quote: &MarketQuote, projection: &Projection) -> Option<f64> {
    match quote.side {
        Side::Over | Side::Under => {
            let line = quote.line?;
            let z = (line - projection.point_estimate) / projection.dispersion;
            let p_under = normal_cdf(z);
            Some(match quote.side {
                Side::Over => 1.0 - p_under,
                _ => p_under,
            })
        }
        Side::Yes | Side::No => {
            let p = projection.point_estimate;
            if !(0.0..=1.0).contains(&p) {
                return None;
            }
            Some(match quote.side {
                Side::Yes => p,
                _ => 1.0 - p,
            })
        }
    }
}

/// Model confidence: one minus the coefficient of variation of the
/// projection, clamped to [0, 1]. A tight projection scores near 1.
pub fn model_confidence(projection: &Projection) -> f64 {
    let scale = projection.point_estimate.abs().max(1e-9);
    (1.0 - (projection.dispersion / scale).min(1.0)).clamp(0.0, 1.0)
}

/// Join quotes to projections on (entity, statistic) and compute edge.
/// Unmatched quotes and unmatched projections are expected and dropped
/// silently; filtered candidates are counted in the stats.
pub fn compute_candidates(
    quotes: &[MarketQuote],
    projections: &[Projection],
    thresholds: EdgeThresholds,
) -> (Vec<EdgedCandidate>, EdgeStats) {
    let by_key: HashMap<(&str, &str), &Projection> = projections
        .iter()
        .map(|p| ((p.entity_id.as_str(), p.statistic.as_str()), p))
        .collect();

    let mut candidates = Vec::new();
    let mut stats = EdgeStats::default();

    for quote in quotes {
        let Some(projection) = by_key.get(&(quote.entity_id.as_str(), quote.statistic.as_str()))
        else {
            continue;
        };
        let Some(model_prob) = model_probability(quote, projection) else {
            continue;
        };
        stats.matched += 1;

        let edge = model_prob - quote.implied_probability;
        let confidence = model_confidence(projection);

        if edge < thresholds.min_edge {
            stats.below_min_edge += 1;
            continue;
        }
        if confidence < thresholds.min_confidence {
            stats.below_min_confidence += 1;
            debug!(
                "Discarding {}/{} {}: confidence {:.3} below {:.3}",
                quote.event_id,
                quote.market_key(),
                quote.side.as_str(),
                confidence,
                thresholds.min_confidence
            );
            continue;
        }

        candidates.push(EdgedCandidate {
            quote: quote.clone(),
            model_probability: model_prob,
            confidence,
            edge,
        });
    }

    (candidates, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::VenueKind;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn quote(side: Side, line: Option<f64>, implied: f64) -> MarketQuote {
        MarketQuote {
            venue: "v".into(),
            venue_kind: VenueKind::BinaryExchange,
            event_id: "evt-1".into(),
            entity_id: "player-1".into(),
            statistic: if line.is_some() { "points".into() } else { "win".into() },
            line,
            side,
            price: implied * 100.0,
            implied_probability: implied,
            fetched_at: Utc::now(),
        }
    }

    fn projection(statistic: &str, estimate: f64, dispersion: f64) -> Projection {
        Projection {
            entity_id: "player-1".into(),
            statistic: statistic.into(),
            point_estimate: estimate,
            dispersion,
        }
    }

    #[test]
    fn test_normal_cdf_symmetry() {
        assert_relative_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-7);
        assert_relative_eq!(normal_cdf(1.0) + normal_cdf(-1.0), 1.0, epsilon = 1e-7);
        assert_relative_eq!(normal_cdf(1.96), 0.975, epsilon = 1e-3);
    }

    #[test]
    fn test_over_probability_above_mean() {
        // Projection mean well above the line → high over probability
        let q = quote(Side::Over, Some(20.0), 0.5);
        let p = projection("points", 28.0, 5.0);
        let prob = model_probability(&q, &p).unwrap();
        assert!(prob > 0.9, "got {prob}");

        let q_under = quote(Side::Under, Some(20.0), 0.5);
        let prob_under = model_probability(&q_under, &p).unwrap();
        assert_relative_eq!(prob + prob_under, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_moneyline_uses_estimate_directly() {
        let q = quote(Side::Yes, None, 0.6);
        let p = projection("win", 0.8, 0.05);
        assert_relative_eq!(model_probability(&q, &p).unwrap(), 0.8, epsilon = 1e-12);

        let q_no = quote(Side::No, None, 0.4);
        assert_relative_eq!(model_probability(&q_no, &p).unwrap(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_scenario_a_candidate_accepted() {
        // 80% model vs 60% implied, min edge 5% → accepted with 20-point edge
        let q = quote(Side::Yes, None, 0.6);
        let p = projection("win", 0.8, 0.05);
        let (candidates, stats) = compute_candidates(
            &[q],
            &[p],
            EdgeThresholds {
                min_edge: 0.05,
                min_confidence: 0.5,
            },
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(stats.matched, 1);
        assert_relative_eq!(candidates[0].edge, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_scenario_b_min_edge_filters() {
        // Same pairing with min edge 25% → discarded before sizing
        let q = quote(Side::Yes, None, 0.6);
        let p = projection("win", 0.8, 0.05);
        let (candidates, stats) = compute_candidates(
            &[q],
            &[p],
            EdgeThresholds {
                min_edge: 0.25,
                min_confidence: 0.5,
            },
        );
        assert!(candidates.is_empty());
        assert_eq!(stats.below_min_edge, 1);
    }

    #[test]
    fn test_low_confidence_filtered() {
        // Wide dispersion relative to the estimate → low confidence
        let q = quote(Side::Over, Some(10.0), 0.3);
        let p = projection("points", 20.0, 15.0);
        let (candidates, stats) = compute_candidates(
            &[q],
            &[p],
            EdgeThresholds {
                min_edge: 0.0,
                min_confidence: 0.6,
            },
        );
        assert!(candidates.is_empty());
        assert_eq!(stats.below_min_confidence, 1);
    }

    #[test]
    fn test_unmatched_quotes_dropped_silently() {
        let q = quote(Side::Over, Some(20.0), 0.5);
        let p = projection("rebounds", 10.0, 2.0); // different statistic
        let (candidates, stats) = compute_candidates(
            &[q],
            &[p],
            EdgeThresholds {
                min_edge: 0.0,
                min_confidence: 0.0,
            },
        );
        assert!(candidates.is_empty());
        assert_eq!(stats.matched, 0);
    }
}
