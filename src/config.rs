use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::models::VenueKind;

/// Daily bet-decision pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "dailyedge", version, about)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "dailyedge.db")]
    pub database_path: String,

    /// Directory for date-keyed decision records
    #[arg(long, env = "RECORDS_DIR", default_value = "records")]
    pub records_dir: String,

    /// Venue roster JSON file
    #[arg(long, env = "VENUES_FILE", default_value = "venues.json")]
    pub venues_file: String,

    /// Projection feed JSON file for the run date
    #[arg(long, env = "PROJECTIONS_FILE", default_value = "projections.json")]
    pub projections_file: String,

    /// Starting bankroll (USD); the ledger replays from this amount
    #[arg(long, env = "STARTING_BANKROLL", default_value = "1000.0")]
    pub starting_bankroll: f64,

    /// Size of one bankroll unit (USD)
    #[arg(long, env = "UNIT_SIZE", default_value = "10.0")]
    pub unit_size: f64,

    /// Daily budget cap, in units, shared across all venues
    #[arg(long, env = "DAILY_BUDGET_UNITS", default_value = "10.0")]
    pub daily_budget_units: f64,

    /// Fractional Kelly multiplier (0.0–0.5)
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: f64,

    /// Minimum edge required to consider a candidate (e.g. 0.05 = 5 points)
    #[arg(long, env = "MIN_EDGE", default_value = "0.05")]
    pub min_edge: f64,

    /// Minimum model confidence required to size a candidate
    #[arg(long, env = "MIN_CONFIDENCE", default_value = "0.6")]
    pub min_confidence: f64,

    /// Minimum stake in units; smaller computed stakes are raised to this
    #[arg(long, env = "MIN_STAKE_UNITS", default_value = "0.5")]
    pub min_stake_units: f64,

    /// Maximum stake in units; larger computed stakes are capped at this
    #[arg(long, env = "MAX_STAKE_UNITS", default_value = "4.0")]
    pub max_stake_units: f64,

    /// Per-venue HTTP timeout in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "10")]
    pub fetch_timeout_secs: u64,

    /// Maximum fetch attempts per venue before excluding it for the run
    #[arg(long, env = "FETCH_MAX_ATTEMPTS", default_value = "4")]
    pub fetch_max_attempts: u32,

    /// Base delay for exponential fetch backoff, in milliseconds
    #[arg(long, env = "FETCH_BACKOFF_BASE_MS", default_value = "500")]
    pub fetch_backoff_base_ms: u64,

    /// Advisory-lock TTL in seconds; older locks are treated as stale
    #[arg(long, env = "LOCK_TTL_SECS", default_value = "3600")]
    pub lock_ttl_secs: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the decision pipeline: fetch, edge, size, allocate, commit
    Decide {
        /// Run date (YYYY-MM-DD); defaults to today UTC
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Collect closing prices for a date's committed positions
    CollectCloses {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Grade a date's committed positions and update the ledger
    Grade {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Replay the ledger from the starting bankroll and verify consistency
    Replay,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.starting_bankroll <= 0.0 {
            anyhow::bail!("starting_bankroll must be positive");
        }
        if self.unit_size <= 0.0 {
            anyhow::bail!("unit_size must be positive");
        }
        if self.daily_budget_units <= 0.0 {
            anyhow::bail!("daily_budget_units must be positive");
        }
        // Full Kelly on a noisy edge estimate oversizes systematically;
        // anything above half Kelly is a configuration mistake here.
        if !(0.0..=0.5).contains(&self.kelly_fraction) || self.kelly_fraction == 0.0 {
            anyhow::bail!("kelly_fraction must be in (0.0, 0.5]");
        }
        if !(0.0..=1.0).contains(&self.min_edge) {
            anyhow::bail!("min_edge must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("min_confidence must be between 0.0 and 1.0");
        }
        if self.min_stake_units <= 0.0 || self.max_stake_units < self.min_stake_units {
            anyhow::bail!("stake unit bounds must satisfy 0 < min <= max");
        }
        if self.fetch_max_attempts == 0 {
            anyhow::bail!("fetch_max_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Typed per-venue configuration, validated eagerly at run start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub id: String,
    pub kind: VenueKind,
    pub base_url: String,
    /// Odds format quoted by fixed-odds venues
    #[serde(default)]
    pub odds_format: OddsFormat,
    /// Name of the environment variable holding this venue's API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Resolved credential; filled in by `resolve_credentials`
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A required venue with no credential fails the run fast instead of
    /// being silently skipped
    #[serde(default)]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OddsFormat {
    #[default]
    Decimal,
    American,
    /// Binary-exchange prices quoted in cents on the dollar
    Cents,
}

/// Load the venue roster and resolve credentials from the environment.
/// A venue missing its credential is disabled for the run (partial
/// degradation) unless marked required, which aborts.
pub fn load_venues(path: &str) -> Result<Vec<VenueConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read venues file {path}"))?;
    let mut venues: Vec<VenueConfig> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse venues file {path}"))?;
    if venues.is_empty() {
        anyhow::bail!("venues file {path} lists no venues");
    }

    for venue in &mut venues {
        if venue.id.trim().is_empty() || venue.base_url.trim().is_empty() {
            anyhow::bail!("venue entry with empty id or base_url in {path}");
        }
        if !venue.enabled {
            continue;
        }
        if let Some(env_name) = &venue.api_key_env {
            match std::env::var(env_name) {
                Ok(key) if !key.trim().is_empty() => venue.api_key = Some(key),
                _ if venue.required => {
                    anyhow::bail!(
                        "required venue '{}' has no credential in ${}",
                        venue.id,
                        env_name
                    );
                }
                _ => {
                    warn!(
                        "Venue '{}' disabled for this run: credential ${} not set",
                        venue.id, env_name
                    );
                    venue.enabled = false;
                }
            }
        }
    }
    Ok(venues)
}
