use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::{OddsFormat, VenueConfig};
use crate::db::models::MarketQuote;
use crate::venues::RawQuote;

/// Convert decimal odds to implied probability. The book's margin is part
/// of the venue's price and is deliberately kept in.
pub fn implied_from_decimal(odds: f64) -> Option<f64> {
    if !odds.is_finite() || odds <= 1.0 {
        return None;
    }
    Some(1.0 / odds)
}

/// Convert American odds to implied probability.
///
/// Favorites quote negative (-150 → risk 150 to win 100), underdogs
/// positive (+130 → risk 100 to win 130).
pub fn implied_from_american(odds: f64) -> Option<f64> {
    if !odds.is_finite() || odds.abs() < 100.0 {
        return None;
    }
    if odds > 0.0 {
        Some(100.0 / (odds + 100.0))
    } else {
        let risk = -odds;
        Some(risk / (risk + 100.0))
    }
}

/// Binary-exchange prices are already probabilities quoted in cents;
/// only a unit conversion applies.
pub fn implied_from_cents(cents: f64) -> Option<f64> {
    if !cents.is_finite() {
        return None;
    }
    Some(cents / 100.0)
}

/// Normalize one venue's raw quotes into canonical MarketQuote records.
/// Malformed or out-of-range prices (implied probability outside (0,1))
/// are dropped with a logged reason and counted, never defaulted.
pub fn normalize_quotes(
    venue: &VenueConfig,
    raw_quotes: Vec<RawQuote>,
    fetched_at: DateTime<Utc>,
) -> (Vec<MarketQuote>, usize) {
    let mut quotes = Vec::with_capacity(raw_quotes.len());
    let mut dropped = 0usize;

    for raw in raw_quotes {
        let implied = match venue.odds_format {
            OddsFormat::Decimal => implied_from_decimal(raw.price),
            OddsFormat::American => implied_from_american(raw.price),
            OddsFormat::Cents => implied_from_cents(raw.price),
        };
        let implied = match implied {
            Some(p) if p > 0.0 && p < 1.0 => p,
            _ => {
                warn!(
                    "{}: dropping quote for {}/{} with unusable price {} ({:?})",
                    venue.id, raw.event_id, raw.statistic, raw.price, venue.odds_format
                );
                dropped += 1;
                continue;
            }
        };
        quotes.push(MarketQuote {
            venue: venue.id.clone(),
            venue_kind: venue.kind,
            event_id: raw.event_id,
            entity_id: raw.entity_id,
            statistic: raw.statistic,
            line: raw.line,
            side: raw.side,
            price: raw.price,
            implied_probability: implied,
            fetched_at,
        });
    }

    (quotes, dropped)
}
