use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::models::{Candidate, Position, PositionStatus};
use crate::db::Database;
use crate::engine::allocator::allocate;
use crate::engine::edge::{compute_candidates, EdgeThresholds};
use crate::engine::kelly::{size_candidate, SizingConfig};
use crate::engine::normalize::normalize_quotes;
use crate::projections::load_projections;
use crate::venues::{fetch_all_quotes, MarketFeed, RetryPolicy};

use super::{RunLock, RunSummary};

/// Immutable, date-keyed audit record of one decision run.
#[derive(Debug, Serialize)]
struct DecisionRecord<'a> {
    run_date: NaiveDate,
    generated_at: chrono::DateTime<Utc>,
    summary: &'a RunSummary,
    positions: &'a [Position],
}

/// Run the full decision pipeline for a date: fetch quotes from every
/// enabled venue, normalize, join against projections, compute edge, size
/// with fractional Kelly, allocate the daily budget, and commit the
/// accepted set.
pub async fn run(
    config: &Config,
    db: &Database,
    feeds: &[Arc<dyn MarketFeed>],
    run_date: NaiveDate,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    // Whole-feed projection failure aborts before anything is written.
    let loaded = load_projections(&config.projections_file, run_date)?;
    summary.projections_loaded = loaded.projections.len();
    summary.projection_rows_skipped = loaded.skipped_rows;

    let policy = RetryPolicy {
        max_attempts: config.fetch_max_attempts,
        base_delay: Duration::from_millis(config.fetch_backoff_base_ms),
    };
    let fetched = fetch_all_quotes(feeds, run_date, policy).await;
    summary.venues_fetched = fetched.quotes_by_venue.len();
    summary.venues_excluded = fetched.excluded_venues.clone();

    let fetched_at = Utc::now();
    let mut quotes = Vec::new();
    for (venue_id, raw_quotes) in fetched.quotes_by_venue {
        let Some(feed) = feeds.iter().find(|f| f.venue_id() == venue_id) else {
            continue;
        };
        let (normalized, dropped) = normalize_quotes(feed.config(), raw_quotes, fetched_at);
        summary.quotes_fetched += normalized.len();
        summary.quotes_dropped += dropped;
        quotes.extend(normalized);
    }

    let (edged, edge_stats) = compute_candidates(
        &quotes,
        &loaded.projections,
        EdgeThresholds {
            min_edge: config.min_edge,
            min_confidence: config.min_confidence,
        },
    );
    summary.candidates_matched = edge_stats.matched;
    summary.discarded_below_min_edge = edge_stats.below_min_edge;
    summary.discarded_below_min_confidence = edge_stats.below_min_confidence;

    let sizing = SizingConfig {
        kelly_fraction: config.kelly_fraction,
        bankroll: db.current_balance(config.starting_bankroll)?,
        unit_size: config.unit_size,
        min_stake_units: config.min_stake_units,
        max_stake_units: config.max_stake_units,
    };
    let mut sized = Vec::new();
    for candidate in &edged {
        match size_candidate(candidate, &sizing) {
            Some(c) => sized.push(c),
            None => summary.discarded_by_sizer += 1,
        }
    }

    let allocation = allocate(sized, config.daily_budget_units);
    summary.accepted = allocation.accepted.len();
    summary.rejected_by_budget = allocation.rejected_by_budget;
    summary.total_stake_units = allocation.accepted.iter().map(|c| c.stake_units).sum();

    // Commit phase, guarded so concurrent invocations cannot interleave
    // appends for the same date.
    let _lock = RunLock::acquire(db, run_date, "decide", config.lock_ttl_secs)?;

    let committed_at = Utc::now();
    let mut positions = Vec::with_capacity(allocation.accepted.len());
    for candidate in &allocation.accepted {
        let mut position = position_from_candidate(candidate, run_date, committed_at);
        match db.insert_position(&position)? {
            Some(id) => {
                position.id = Some(id);
                summary.positions_committed += 1;
            }
            None => summary.positions_skipped_existing += 1,
        }
        positions.push(position);
    }

    write_decision_record(&config.records_dir, run_date, &summary, &positions)?;

    info!(
        "Decision run {}: {} quotes from {} venue(s) ({} dropped, excluded: {:?}), \
         {} matched, {} below edge, {} below confidence, {} unsizable, \
         {} accepted ({:.2} units), {} rejected by budget, {} committed, {} already present",
        run_date,
        summary.quotes_fetched,
        summary.venues_fetched,
        summary.quotes_dropped,
        summary.venues_excluded,
        summary.candidates_matched,
        summary.discarded_below_min_edge,
        summary.discarded_below_min_confidence,
        summary.discarded_by_sizer,
        summary.accepted,
        summary.total_stake_units,
        summary.rejected_by_budget,
        summary.positions_committed,
        summary.positions_skipped_existing,
    );

    Ok(summary)
}

fn position_from_candidate(
    candidate: &Candidate,
    run_date: NaiveDate,
    committed_at: chrono::DateTime<Utc>,
) -> Position {
    let quote = &candidate.quote;
    Position {
        id: None,
        idempotency_key: Position::make_idempotency_key(
            run_date,
            &quote.venue,
            &quote.event_id,
            &quote.market_key(),
            quote.side,
        ),
        run_date,
        venue: quote.venue.clone(),
        venue_kind: quote.venue_kind,
        event_id: quote.event_id.clone(),
        entity_id: quote.entity_id.clone(),
        statistic: quote.statistic.clone(),
        line: quote.line,
        side: quote.side,
        price: quote.price,
        implied_probability: quote.implied_probability,
        model_probability: candidate.model_probability,
        confidence: candidate.confidence,
        edge: candidate.edge,
        stake: candidate.stake,
        stake_units: candidate.stake_units,
        status: PositionStatus::Committed,
        committed_at,
    }
}

pub fn record_path(records_dir: &str, run_date: NaiveDate) -> PathBuf {
    Path::new(records_dir).join(format!("decisions-{run_date}.json"))
}

/// Write the decision record atomically: temp file in the target directory,
/// then rename, so a reader never observes a half-written record. An
/// existing record for the date is immutable and left untouched.
fn write_decision_record(
    records_dir: &str,
    run_date: NaiveDate,
    summary: &RunSummary,
    positions: &[Position],
) -> Result<()> {
    std::fs::create_dir_all(records_dir)
        .with_context(|| format!("failed to create records dir {records_dir}"))?;
    let path = record_path(records_dir, run_date);
    if path.exists() {
        warn!(
            "Decision record {} already exists from a prior run; keeping it",
            path.display()
        );
        return Ok(());
    }

    let record = DecisionRecord {
        run_date,
        generated_at: Utc::now(),
        summary,
        positions,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(records_dir)
        .context("failed to create temporary record file")?;
    serde_json::to_writer_pretty(&mut tmp, &record).context("failed to serialize record")?;
    tmp.flush()?;
    tmp.persist(&path)
        .with_context(|| format!("failed to persist record {}", path.display()))?;
    info!("Decision record written: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OddsFormat, VenueConfig};
    use crate::db::models::{Side, VenueKind};
    use crate::venues::{RawQuote, RealizedResult, VenueError};
    use async_trait::async_trait;
    use clap::Parser;

    struct StaticFeed {
        config: VenueConfig,
        quotes: Vec<RawQuote>,
    }

    #[async_trait]
    impl MarketFeed for StaticFeed {
        fn config(&self) -> &VenueConfig {
            &self.config
        }

        async fn fetch_quotes(&self, _run_date: NaiveDate) -> Result<Vec<RawQuote>, VenueError> {
            Ok(self.quotes.clone())
        }

        async fn fetch_closing_price(
            &self,
            _event_id: &str,
            _statistic: &str,
            _line: Option<f64>,
            _side: Side,
        ) -> Result<f64, VenueError> {
            Err(VenueError::Permanent("not used".into()))
        }

        async fn fetch_result(
            &self,
            _event_id: &str,
            _entity_id: &str,
            _statistic: &str,
        ) -> Result<Option<RealizedResult>, VenueError> {
            Ok(None)
        }
    }

    fn exchange_feed() -> Arc<dyn MarketFeed> {
        Arc::new(StaticFeed {
            config: VenueConfig {
                id: "exchange-b".into(),
                kind: VenueKind::BinaryExchange,
                base_url: "http://test.invalid".into(),
                odds_format: OddsFormat::Cents,
                api_key_env: None,
                api_key: None,
                enabled: true,
                required: false,
            },
            quotes: vec![
                RawQuote {
                    event_id: "evt-1".into(),
                    entity_id: "team-1".into(),
                    statistic: "win".into(),
                    line: None,
                    side: Side::Yes,
                    price: 60.0,
                },
                // No matching projection: dropped silently
                RawQuote {
                    event_id: "evt-2".into(),
                    entity_id: "team-9".into(),
                    statistic: "win".into(),
                    line: None,
                    side: Side::Yes,
                    price: 40.0,
                },
            ],
        })
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let projections = dir.join("projections.json");
        std::fs::write(
            &projections,
            r#"{"run_date":"2026-08-30","projections":[
                {"entity_id":"team-1","statistic":"win","point_estimate":0.8,"dispersion":0.05}
            ]}"#,
        )
        .unwrap();
        let mut config = Config::parse_from(["dailyedge", "decide"]);
        config.database_path = dir.join("test.db").to_str().unwrap().into();
        config.records_dir = dir.join("records").to_str().unwrap().into();
        config.projections_file = projections.to_str().unwrap().into();
        config.fetch_backoff_base_ms = 1;
        config
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 30).unwrap()
    }

    #[tokio::test]
    async fn test_decide_commits_positions_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let feeds = vec![exchange_feed()];

        let summary = run(&config, &db, &feeds, date()).await.unwrap();
        assert_eq!(summary.candidates_matched, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.positions_committed, 1);

        let positions = db.list_positions_for_date(date()).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entity_id, "team-1");
        assert!(record_path(&config.records_dir, date()).exists());
    }

    #[tokio::test]
    async fn test_decide_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let feeds = vec![exchange_feed()];

        let first = run(&config, &db, &feeds, date()).await.unwrap();
        let second = run(&config, &db, &feeds, date()).await.unwrap();

        assert_eq!(first.positions_committed, 1);
        assert_eq!(second.positions_committed, 0);
        assert_eq!(second.positions_skipped_existing, 1);
        assert_eq!(db.list_positions_for_date(date()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stakes_respect_daily_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let feeds = vec![exchange_feed()];

        let summary = run(&config, &db, &feeds, date()).await.unwrap();
        assert!(summary.total_stake_units <= config.daily_budget_units);
    }

    #[tokio::test]
    async fn test_missing_projection_feed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.projections_file = dir.path().join("absent.json").to_str().unwrap().into();
        let db = Database::open(&config.database_path).unwrap();
        let feeds = vec![exchange_feed()];

        assert!(run(&config, &db, &feeds, date()).await.is_err());
        assert!(db.list_positions_for_date(date()).unwrap().is_empty());
    }
}
