use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;

use crate::config::VenueConfig;
use crate::db::models::Side;

mod exchange;
mod fetch;
mod fixed_odds;

pub use exchange::BinaryExchangeFeed;
pub use fetch::{fetch_all_quotes, FetchOutcome, RetryPolicy};
pub use fixed_odds::FixedOddsFeed;

/// Fetch failure at the venue seam. Transient failures are retried with
/// backoff; permanent ones exclude the venue (or record) immediately.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }

    /// Classify a reqwest error: network problems and timeouts are worth
    /// retrying, everything else is not.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            VenueError::Transient(err.to_string())
        } else {
            VenueError::Permanent(err.to_string())
        }
    }

    /// Classify an HTTP status: rate limits and server errors are
    /// transient, client errors are permanent.
    pub fn from_status(status: reqwest::StatusCode, venue: &str) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            VenueError::Transient(format!("{venue} returned {status}"))
        } else {
            VenueError::Permanent(format!("{venue} returned {status}"))
        }
    }
}

/// One quote as the venue reported it, before normalization.
#[derive(Debug, Clone)]
pub struct RawQuote {
    pub event_id: String,
    pub entity_id: String,
    pub statistic: String,
    pub line: Option<f64>,
    pub side: Side,
    /// Venue-native price; meaning depends on the venue's odds format
    pub price: f64,
}

/// Realized result for one market, as reported by the venue after the
/// event finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RealizedResult {
    /// Final value of the statistic (settles over/under markets)
    StatValue(f64),
    /// Whether the entity won (settles moneyline-equivalent markets)
    Won(bool),
    /// Event cancelled/postponed; the position voids
    Voided,
}

/// Trait every market-data venue must implement.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Venue roster entry this feed was built from
    fn config(&self) -> &VenueConfig;

    /// Venue id for logging
    fn venue_id(&self) -> &str {
        &self.config().id
    }

    /// Fetch all raw quotes offered for the run date
    async fn fetch_quotes(&self, run_date: NaiveDate) -> Result<Vec<RawQuote>, VenueError>;

    /// Fetch the current/closing price for one market side, venue-native
    async fn fetch_closing_price(
        &self,
        event_id: &str,
        statistic: &str,
        line: Option<f64>,
        side: Side,
    ) -> Result<f64, VenueError>;

    /// Fetch the realized result for one market; `None` when the venue has
    /// no result data yet (the position stays committed and is retried)
    async fn fetch_result(
        &self,
        event_id: &str,
        entity_id: &str,
        statistic: &str,
    ) -> Result<Option<RealizedResult>, VenueError>;
}

/// Build one feed per enabled venue in the roster.
pub fn build_feeds(
    venues: &[VenueConfig],
    timeout_secs: u64,
) -> Result<Vec<Arc<dyn MarketFeed>>> {
    let mut feeds: Vec<Arc<dyn MarketFeed>> = Vec::new();
    for venue in venues.iter().filter(|v| v.enabled) {
        match venue.kind {
            crate::db::models::VenueKind::FixedOdds => {
                feeds.push(Arc::new(FixedOddsFeed::new(venue.clone(), timeout_secs)?));
            }
            crate::db::models::VenueKind::BinaryExchange => {
                feeds.push(Arc::new(BinaryExchangeFeed::new(venue.clone(), timeout_secs)?));
            }
        }
    }
    Ok(feeds)
}
