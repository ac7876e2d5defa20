use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;

use crate::db::models::Projection;

/// Projection feed as produced by the external forecasting system.
#[derive(Debug, Deserialize)]
struct ProjectionFeed {
    run_date: NaiveDate,
    projections: Vec<ProjectionRow>,
}

#[derive(Debug, Deserialize)]
struct ProjectionRow {
    entity_id: String,
    statistic: String,
    point_estimate: f64,
    dispersion: f64,
}

/// Result of loading the feed: valid rows plus the count of rows skipped
/// for per-row validation failures.
#[derive(Debug)]
pub struct LoadedProjections {
    pub projections: Vec<Projection>,
    pub skipped_rows: usize,
}

/// Load and validate the projection feed for a run date.
///
/// The run is rejected only when the feed is missing, unparsable, dated for
/// a different day, or empty after validation. Individual malformed rows
/// are skipped and counted, not fatal.
pub fn load_projections(path: &str, run_date: NaiveDate) -> Result<LoadedProjections> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read projection feed {path}"))?;
    let feed: ProjectionFeed = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse projection feed {path}"))?;

    if feed.run_date != run_date {
        anyhow::bail!(
            "projection feed {} is for {}, expected {}",
            path,
            feed.run_date,
            run_date
        );
    }

    let mut projections = Vec::with_capacity(feed.projections.len());
    let mut skipped_rows = 0usize;
    for row in feed.projections {
        if let Some(projection) = validate_row(row) {
            projections.push(projection);
        } else {
            skipped_rows += 1;
        }
    }

    if projections.is_empty() {
        anyhow::bail!(
            "projection feed {} has no valid rows ({} skipped)",
            path,
            skipped_rows
        );
    }

    Ok(LoadedProjections {
        projections,
        skipped_rows,
    })
}

fn validate_row(row: ProjectionRow) -> Option<Projection> {
    if row.entity_id.trim().is_empty() || row.statistic.trim().is_empty() {
        warn!("Skipping projection row with empty entity or statistic");
        return None;
    }
    if !row.point_estimate.is_finite() || !row.dispersion.is_finite() {
        warn!(
            "Skipping projection for {} / {}: non-finite values",
            row.entity_id, row.statistic
        );
        return None;
    }
    if row.dispersion <= 0.0 {
        warn!(
            "Skipping projection for {} / {}: non-positive dispersion {}",
            row.entity_id, row.statistic, row.dispersion
        );
        return None;
    }
    Some(Projection {
        entity_id: row.entity_id,
        statistic: row.statistic,
        point_estimate: row.point_estimate,
        dispersion: row.dispersion,
    })
}
