use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::models::{Outcome, Side, VenueKind};
use crate::db::Database;
use crate::venues::{MarketFeed, RealizedResult};

use super::{GradingSummary, RunLock};

/// Settle a date's committed positions against realized results.
///
/// State machine per position: Committed → Settled (terminal) or
/// Committed → Voided (terminal). A position with no result data yet stays
/// Committed and is retried on the next grading run; a position that
/// already has a settlement record is skipped.
pub async fn run(
    config: &Config,
    db: &Database,
    feeds: &[Arc<dyn MarketFeed>],
    run_date: NaiveDate,
) -> Result<GradingSummary> {
    let _lock = RunLock::acquire(db, run_date, "grade", config.lock_ttl_secs)?;

    let feeds_by_venue: HashMap<&str, &Arc<dyn MarketFeed>> =
        feeds.iter().map(|f| (f.venue_id(), f)).collect();

    let positions = db.list_committed_positions(run_date)?;
    let mut summary = GradingSummary {
        positions_considered: positions.len(),
        ..Default::default()
    };

    for pos in &positions {
        let position_id = pos.id.context("stored position has no row id")?;
        if db.settlement_for(position_id)?.is_some() {
            summary.skipped_already_settled += 1;
            continue;
        }
        let Some(feed) = feeds_by_venue.get(pos.venue.as_str()) else {
            warn!(
                "No feed available for venue {} (position {}); grading deferred",
                pos.venue, pos.idempotency_key
            );
            summary.pending_no_result += 1;
            continue;
        };

        let result = match feed
            .fetch_result(&pos.event_id, &pos.entity_id, &pos.statistic)
            .await
        {
            Ok(Some(result)) => result,
            Ok(None) => {
                // Outcome data unavailable: never force-settle
                summary.pending_no_result += 1;
                continue;
            }
            Err(e) => {
                warn!(
                    "Result fetch failed for position {}: {}",
                    pos.idempotency_key, e
                );
                summary.fetch_failures += 1;
                continue;
            }
        };

        let Some(outcome) = grade_outcome(pos.side, pos.line, result) else {
            warn!(
                "Result {:?} does not settle position {} (side {}); grading deferred",
                result,
                pos.idempotency_key,
                pos.side.as_str()
            );
            summary.fetch_failures += 1;
            continue;
        };
        let payout = payout_for(pos.venue_kind, outcome, pos.stake, pos.implied_probability);

        if db
            .settle_position(pos, outcome, payout, config.starting_bankroll)?
            .is_some()
        {
            info!(
                "Settled {}: {} payout {:.2} (stake {:.2}, net {:+.2})",
                pos.idempotency_key,
                outcome.as_str(),
                payout,
                pos.stake,
                payout - pos.stake
            );
            match outcome {
                Outcome::Void => summary.voided += 1,
                _ => summary.settled += 1,
            }
        } else {
            summary.skipped_already_settled += 1;
        }
    }

    info!(
        "Grading run {}: {} considered, {} settled, {} voided, {} already settled, {} pending, {} failure(s); balance {:.2}",
        run_date,
        summary.positions_considered,
        summary.settled,
        summary.voided,
        summary.skipped_already_settled,
        summary.pending_no_result,
        summary.fetch_failures,
        db.current_balance(config.starting_bankroll)?,
    );
    Ok(summary)
}

/// Map a realized result onto the position's side. Returns `None` when the
/// result type cannot settle the market (an upstream data problem, handled
/// by deferring the position, never by guessing).
pub fn grade_outcome(side: Side, line: Option<f64>, result: RealizedResult) -> Option<Outcome> {
    match (side, result) {
        (_, RealizedResult::Voided) => Some(Outcome::Void),
        (Side::Over, RealizedResult::StatValue(value)) => {
            let line = line?;
            Some(if value > line {
                Outcome::Win
            } else if value < line {
                Outcome::Loss
            } else {
                Outcome::Push
            })
        }
        (Side::Under, RealizedResult::StatValue(value)) => {
            let line = line?;
            Some(if value < line {
                Outcome::Win
            } else if value > line {
                Outcome::Loss
            } else {
                Outcome::Push
            })
        }
        (Side::Yes, RealizedResult::Won(won)) => {
            Some(if won { Outcome::Win } else { Outcome::Loss })
        }
        (Side::No, RealizedResult::Won(won)) => {
            Some(if won { Outcome::Loss } else { Outcome::Win })
        }
        _ => None,
    }
}

/// Gross payout for an outcome. The grader's external contract is uniform
/// across venues; only the WIN multiplier is venue-specific:
/// fixed odds return stake times the price-derived multiplier, a binary
/// exchange pays $1 per share bought at the entry price.
pub fn payout_for(kind: VenueKind, outcome: Outcome, stake: f64, implied_probability: f64) -> f64 {
    match outcome {
        Outcome::Win => match kind {
            VenueKind::FixedOdds => stake * (1.0 / implied_probability),
            VenueKind::BinaryExchange => stake / implied_probability,
        },
        Outcome::Loss => 0.0,
        // Stake returned; VOID additionally carries no P&L impact by
        // construction since delta = payout − stake = 0
        Outcome::Push | Outcome::Void => stake,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OddsFormat, VenueConfig};
    use crate::db::models::{Position, PositionStatus};
    use crate::venues::{RawQuote, VenueError};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::Utc;
    use clap::Parser;

    #[test]
    fn test_grade_over_under() {
        let over = Side::Over;
        let under = Side::Under;
        let value = RealizedResult::StatValue(27.0);
        assert_eq!(grade_outcome(over, Some(25.5), value), Some(Outcome::Win));
        assert_eq!(grade_outcome(under, Some(25.5), value), Some(Outcome::Loss));
        // Whole-number line hit exactly → push both ways
        let push = RealizedResult::StatValue(25.0);
        assert_eq!(grade_outcome(over, Some(25.0), push), Some(Outcome::Push));
        assert_eq!(grade_outcome(under, Some(25.0), push), Some(Outcome::Push));
    }

    #[test]
    fn test_grade_moneyline() {
        assert_eq!(
            grade_outcome(Side::Yes, None, RealizedResult::Won(true)),
            Some(Outcome::Win)
        );
        assert_eq!(
            grade_outcome(Side::No, None, RealizedResult::Won(true)),
            Some(Outcome::Loss)
        );
        assert_eq!(
            grade_outcome(Side::No, None, RealizedResult::Won(false)),
            Some(Outcome::Win)
        );
    }

    #[test]
    fn test_grade_void_and_mismatch() {
        assert_eq!(
            grade_outcome(Side::Over, Some(10.0), RealizedResult::Voided),
            Some(Outcome::Void)
        );
        // A win/lose result cannot settle an over/under market
        assert_eq!(grade_outcome(Side::Over, Some(10.0), RealizedResult::Won(true)), None);
        assert_eq!(grade_outcome(Side::Yes, None, RealizedResult::StatValue(3.0)), None);
    }

    #[test]
    fn test_scenario_d_fixed_odds_payout() {
        // Price implying 55% (decimal 1.8…), stake 2 → payout 3.6
        let implied = 1.0 / 1.8;
        let payout = payout_for(VenueKind::FixedOdds, Outcome::Win, 2.0, implied);
        assert_relative_eq!(payout, 3.6, epsilon = 1e-9);
        // Ledger delta is payout − stake = +1.6
        assert_relative_eq!(payout - 2.0, 1.6, epsilon = 1e-9);
    }

    #[test]
    fn test_exchange_payout() {
        // 2 units at 40¢ buys 5 shares → $5 on a win, 0 on a loss
        assert_relative_eq!(
            payout_for(VenueKind::BinaryExchange, Outcome::Win, 2.0, 0.4),
            5.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            payout_for(VenueKind::BinaryExchange, Outcome::Loss, 2.0, 0.4),
            0.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_push_and_void_return_stake() {
        assert_relative_eq!(
            payout_for(VenueKind::FixedOdds, Outcome::Push, 2.0, 0.5),
            2.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            payout_for(VenueKind::BinaryExchange, Outcome::Void, 2.0, 0.5),
            2.0,
            epsilon = 1e-12
        );
    }

    // ── End-to-end grading against a stub feed ────────────────────────────────

    struct ResultFeed {
        config: VenueConfig,
        results: HashMap<String, Option<RealizedResult>>,
    }

    #[async_trait]
    impl MarketFeed for ResultFeed {
        fn config(&self) -> &VenueConfig {
            &self.config
        }

        async fn fetch_quotes(&self, _run_date: NaiveDate) -> Result<Vec<RawQuote>, VenueError> {
            Ok(vec![])
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
            event_id: &str,
            _entity_id: &str,
            _statistic: &str,
        ) -> Result<Option<RealizedResult>, VenueError> {
            Ok(self.results.get(event_id).copied().flatten())
        }
    }

    fn feed(results: HashMap<String, Option<RealizedResult>>) -> Arc<dyn MarketFeed> {
        Arc::new(ResultFeed {
            config: VenueConfig {
                id: "bookmaker-a".into(),
                kind: VenueKind::FixedOdds,
                base_url: "http://test.invalid".into(),
                odds_format: OddsFormat::Decimal,
                api_key_env: None,
                api_key: None,
                enabled: true,
                required: false,
            },
            results,
        })
    }

    fn insert_position(db: &Database, event: &str) -> Position {
        let run_date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        let mut pos = Position {
            id: None,
            idempotency_key: Position::make_idempotency_key(
                run_date,
                "bookmaker-a",
                event,
                "points@25.5",
                Side::Over,
            ),
            run_date,
            venue: "bookmaker-a".into(),
            venue_kind: VenueKind::FixedOdds,
            event_id: event.into(),
            entity_id: "player-1".into(),
            statistic: "points".into(),
            line: Some(25.5),
            side: Side::Over,
            price: 1.8,
            implied_probability: 1.0 / 1.8,
            model_probability: 0.65,
            confidence: 0.8,
            edge: 0.09,
            stake: 2.0,
            stake_units: 2.0,
            status: PositionStatus::Committed,
            committed_at: Utc::now(),
        };
        pos.id = db.insert_position(&pos).unwrap();
        pos
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::parse_from(["dailyedge", "grade"]);
        config.database_path = dir.join("t.db").to_str().unwrap().into();
        config.starting_bankroll = 100.0;
        config
    }

    #[tokio::test]
    async fn test_grading_settles_and_updates_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let run_date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        insert_position(&db, "evt-win");

        let mut results = HashMap::new();
        results.insert("evt-win".to_string(), Some(RealizedResult::StatValue(30.0)));
        let feeds = vec![feed(results)];

        let summary = run(&config, &db, &feeds, run_date).await.unwrap();
        assert_eq!(summary.settled, 1);

        // WIN at decimal 1.8 on 2.0 stake: payout 3.6, delta +1.6
        let entries = db.ledger_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_relative_eq!(entries[0].delta, 1.6, epsilon = 1e-9);
        assert_relative_eq!(db.replay_ledger(100.0).unwrap(), 101.6, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_regrade_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let run_date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        insert_position(&db, "evt-win");

        let mut results = HashMap::new();
        results.insert("evt-win".to_string(), Some(RealizedResult::StatValue(30.0)));
        let feeds = vec![feed(results)];

        run(&config, &db, &feeds, run_date).await.unwrap();
        let second = run(&config, &db, &feeds, run_date).await.unwrap();
        // Settled positions leave the committed set entirely
        assert_eq!(second.positions_considered, 0);
        assert_eq!(db.ledger_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_result_defers_position() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let run_date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        insert_position(&db, "evt-pending");

        let feeds = vec![feed(HashMap::new())];
        let summary = run(&config, &db, &feeds, run_date).await.unwrap();
        assert_eq!(summary.pending_no_result, 1);
        assert_eq!(summary.settled, 0);
        // Still committed, retried on the next run
        assert_eq!(db.list_committed_positions(run_date).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_void_settlement_keeps_balance() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.database_path).unwrap();
        let run_date = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        insert_position(&db, "evt-void");

        let mut results = HashMap::new();
        results.insert("evt-void".to_string(), Some(RealizedResult::Voided));
        let feeds = vec![feed(results)];

        let summary = run(&config, &db, &feeds, run_date).await.unwrap();
        assert_eq!(summary.voided, 1);
        assert_relative_eq!(db.current_balance(100.0).unwrap(), 100.0, epsilon = 1e-9);
    }
}
