use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::OddsFormat;
use crate::db::models::ClosingQuote;
use crate::db::Database;
use crate::engine::normalize::{implied_from_american, implied_from_cents, implied_from_decimal};
use crate::venues::MarketFeed;

use super::ClosingSummary;

/// Collect closing prices for a date's committed positions, used for
/// closing-line-value analysis. One fetch per position; a failure for one
/// position never blocks the others, and a missing closing quote simply
/// omits the CLV signal for that position.
pub async fn run(
    db: &Database,
    feeds: &[Arc<dyn MarketFeed>],
    run_date: NaiveDate,
) -> Result<ClosingSummary> {
    let feeds_by_venue: HashMap<&str, &Arc<dyn MarketFeed>> =
        feeds.iter().map(|f| (f.venue_id(), f)).collect();

    let positions = db.positions_missing_closing_quote(run_date)?;
    let mut summary = ClosingSummary {
        positions_considered: positions.len(),
        ..Default::default()
    };

    let tasks: Vec<_> = positions
        .iter()
        .filter_map(|pos| {
            let Some(feed) = feeds_by_venue.get(pos.venue.as_str()) else {
                warn!(
                    "No feed available for venue {} (position {}); skipping closing quote",
                    pos.venue, pos.idempotency_key
                );
                summary.venues_unavailable += 1;
                return None;
            };
            let feed = Arc::clone(*feed);
            Some(async move {
                let price = feed
                    .fetch_closing_price(&pos.event_id, &pos.statistic, pos.line, pos.side)
                    .await;
                (pos, price)
            })
        })
        .collect();

    for (pos, result) in futures_util::future::join_all(tasks).await {
        match result {
            Ok(price) => {
                let implied = match implied_for(price, feeds_by_venue[pos.venue.as_str()]) {
                    Some(p) if p > 0.0 && p < 1.0 => p,
                    _ => {
                        warn!(
                            "Unusable closing price {} for position {}",
                            price, pos.idempotency_key
                        );
                        summary.fetch_failures += 1;
                        continue;
                    }
                };
                let quote = ClosingQuote {
                    position_id: pos.id.context("stored position has no row id")?,
                    price,
                    implied_probability: implied,
                    captured_at: Utc::now(),
                };
                if db.insert_closing_quote(&quote)? {
                    summary.quotes_attached += 1;
                }
            }
            Err(e) => {
                warn!(
                    "Closing price fetch failed for position {}: {}",
                    pos.idempotency_key, e
                );
                summary.fetch_failures += 1;
            }
        }
    }

    info!(
        "Closing run {}: {} position(s) considered, {} quote(s) attached, {} failure(s), {} venue(s) unavailable",
        run_date,
        summary.positions_considered,
        summary.quotes_attached,
        summary.fetch_failures,
        summary.venues_unavailable,
    );
    Ok(summary)
}

fn implied_for(price: f64, feed: &Arc<dyn MarketFeed>) -> Option<f64> {
    match feed.config().odds_format {
        OddsFormat::Decimal => implied_from_decimal(price),
        OddsFormat::American => implied_from_american(price),
        OddsFormat::Cents => implied_from_cents(price),
    }
}
