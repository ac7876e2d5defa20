use chrono::NaiveDate;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{MarketFeed, RawQuote, VenueError};

/// Per-venue retry policy: exponential backoff with jitter, bounded
/// attempts, then the venue is excluded for the run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(6));
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().min(1_000) as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Result of the concurrent quote fan-out: per-venue quote batches plus the
/// venues excluded for the run (failed venues degrade the run, never fail it).
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub quotes_by_venue: Vec<(String, Vec<RawQuote>)>,
    pub excluded_venues: Vec<String>,
}

/// Fetch quotes from every venue concurrently, one task per venue, each
/// with its own retry/backoff policy and failure domain.
pub async fn fetch_all_quotes(
    feeds: &[Arc<dyn MarketFeed>],
    run_date: NaiveDate,
    policy: RetryPolicy,
) -> FetchOutcome {
    let tasks: Vec<_> = feeds
        .iter()
        .map(|feed| {
            let feed = Arc::clone(feed);
            async move {
                let venue = feed.venue_id().to_string();
                let result = fetch_with_retry(feed.as_ref(), run_date, policy).await;
                (venue, result)
            }
        })
        .collect();

    let mut outcome = FetchOutcome::default();
    for (venue, result) in futures_util::future::join_all(tasks).await {
        match result {
            Ok(quotes) => {
                info!("Fetched {} quotes from {}", quotes.len(), venue);
                outcome.quotes_by_venue.push((venue, quotes));
            }
            Err(e) => {
                warn!("Excluding venue {} for this run: {}", venue, e);
                outcome.excluded_venues.push(venue);
            }
        }
    }
    // Deterministic downstream ordering regardless of task completion order
    outcome.quotes_by_venue.sort_by(|a, b| a.0.cmp(&b.0));
    outcome.excluded_venues.sort();
    outcome
}

async fn fetch_with_retry(
    feed: &dyn MarketFeed,
    run_date: NaiveDate,
    policy: RetryPolicy,
) -> Result<Vec<RawQuote>, VenueError> {
    let mut attempt = 0u32;
    loop {
        match feed.fetch_quotes(run_date).await {
            Ok(quotes) => return Ok(quotes),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{}: fetch attempt {}/{} failed ({}), retrying in {:?}",
                    feed.venue_id(),
                    attempt + 1,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
