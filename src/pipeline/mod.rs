use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::db::Database;

pub mod closing;
pub mod decide;
pub mod grade;

/// Counts reported after a decision run so a human can tell "no bets
/// today" apart from "pipeline broken". Embedded in the decision record.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub venues_fetched: usize,
    pub venues_excluded: Vec<String>,
    pub quotes_fetched: usize,
    pub quotes_dropped: usize,
    pub projections_loaded: usize,
    pub projection_rows_skipped: usize,
    pub candidates_matched: usize,
    pub discarded_below_min_edge: usize,
    pub discarded_below_min_confidence: usize,
    pub discarded_by_sizer: usize,
    pub accepted: usize,
    pub rejected_by_budget: usize,
    pub positions_committed: usize,
    pub positions_skipped_existing: usize,
    pub total_stake_units: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ClosingSummary {
    pub positions_considered: usize,
    pub quotes_attached: usize,
    pub fetch_failures: usize,
    pub venues_unavailable: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GradingSummary {
    pub positions_considered: usize,
    pub settled: usize,
    pub voided: usize,
    pub skipped_already_settled: usize,
    pub pending_no_result: usize,
    pub fetch_failures: usize,
}

/// Per-date advisory lock held for the duration of a pipeline phase.
/// Released on drop; a stale lock from a crashed run expires via TTL.
pub struct RunLock {
    db: Database,
    run_date: NaiveDate,
    pipeline: &'static str,
}

impl RunLock {
    pub fn acquire(
        db: &Database,
        run_date: NaiveDate,
        pipeline: &'static str,
        ttl_secs: u64,
    ) -> Result<Self> {
        if !db.try_acquire_lock(run_date, pipeline, ttl_secs)? {
            anyhow::bail!(
                "another {} invocation already holds the lock for {}",
                pipeline,
                run_date
            );
        }
        Ok(RunLock {
            db: db.clone(),
            run_date,
            pipeline,
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.db.release_lock(self.run_date, self.pipeline) {
            warn!(
                "Failed to release {} lock for {}: {}",
                self.pipeline, self.run_date, e
            );
        }
    }
}
