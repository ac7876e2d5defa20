use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of venue quoted a price. Payout math differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    /// Fixed-odds sportsbook; prices carry the book's margin.
    FixedOdds,
    /// Binary-outcome prediction exchange; prices are cents on the dollar.
    BinaryExchange,
}

impl VenueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueKind::FixedOdds => "fixed_odds",
            VenueKind::BinaryExchange => "binary_exchange",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed_odds" => Some(VenueKind::FixedOdds),
            "binary_exchange" => Some(VenueKind::BinaryExchange),
            _ => None,
        }
    }
}

/// Which side of a market the quote (and any resulting position) is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Statistic finishes above the line.
    Over,
    /// Statistic finishes below the line.
    Under,
    /// Moneyline-equivalent: the entity wins.
    Yes,
    /// Moneyline-equivalent: the entity does not win.
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Over => "over",
            Side::Under => "under",
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "over" => Some(Side::Over),
            "under" => Some(Side::Under),
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

/// A normalized market quote. Immutable once fetched; a later fetch of the
/// same (venue, event, market, side) supersedes it, never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub venue: String,
    pub venue_kind: VenueKind,
    pub event_id: String,
    /// Player or team the market references
    pub entity_id: String,
    /// Statistic the market is settled on (e.g. "points", "win")
    pub statistic: String,
    /// Threshold for over/under markets; None for moneyline-equivalents
    pub line: Option<f64>,
    pub side: Side,
    /// Venue-native price (decimal odds, American odds, or cents)
    pub price: f64,
    /// Derived implied probability in (0, 1). Venue margin is NOT removed.
    pub implied_probability: f64,
    pub fetched_at: DateTime<Utc>,
}

impl MarketQuote {
    /// Stable market key used in idempotency keys and record output,
    /// e.g. "points@25.5" or "win".
    pub fn market_key(&self) -> String {
        match self.line {
            Some(line) => format!("{}@{}", self.statistic, line),
            None => self.statistic.clone(),
        }
    }
}

/// One row of the externally produced projection feed. Read-only input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub entity_id: String,
    pub statistic: String,
    /// Point estimate of the statistic (or of the win probability itself
    /// for moneyline-equivalent statistics)
    pub point_estimate: f64,
    /// Dispersion of the estimate (standard deviation / standard error)
    pub dispersion: f64,
}

/// A (quote, projection) pairing with derived edge and suggested stake.
/// Exists only transiently during a single decision run.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub quote: MarketQuote,
    pub model_probability: f64,
    pub confidence: f64,
    /// Model probability minus implied probability
    pub edge: f64,
    /// Suggested stake in currency
    pub stake: f64,
    /// Suggested stake in bankroll units
    pub stake_units: f64,
}

/// Lifecycle of a committed position. Settled and Voided are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Committed,
    Settled,
    Voided,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Committed => "committed",
            PositionStatus::Settled => "settled",
            PositionStatus::Voided => "voided",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "committed" => Some(PositionStatus::Committed),
            "settled" => Some(PositionStatus::Settled),
            "voided" => Some(PositionStatus::Voided),
            _ => None,
        }
    }
}

/// An accepted candidate, persisted in the position log. Never re-sized or
/// deleted after commitment; corrections are a VOID plus a new position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    /// date|venue|event|market|side — prevents duplicate commitment across re-runs
    pub idempotency_key: String,
    pub run_date: NaiveDate,
    pub venue: String,
    pub venue_kind: VenueKind,
    pub event_id: String,
    pub entity_id: String,
    pub statistic: String,
    pub line: Option<f64>,
    pub side: Side,
    /// Venue-native price at commitment
    pub price: f64,
    pub implied_probability: f64,
    pub model_probability: f64,
    pub confidence: f64,
    pub edge: f64,
    /// Committed stake in currency
    pub stake: f64,
    pub stake_units: f64,
    pub status: PositionStatus,
    pub committed_at: DateTime<Utc>,
}

impl Position {
    pub fn market_key(&self) -> String {
        match self.line {
            Some(line) => format!("{}@{}", self.statistic, line),
            None => self.statistic.clone(),
        }
    }

    pub fn make_idempotency_key(
        run_date: NaiveDate,
        venue: &str,
        event_id: &str,
        market_key: &str,
        side: Side,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            run_date,
            venue,
            event_id,
            market_key,
            side.as_str()
        )
    }
}

/// Closing price captured at/near market close, one per position at most.
/// Absence is valid and never blocks settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingQuote {
    pub position_id: i64,
    /// Venue-native closing price
    pub price: f64,
    pub implied_probability: f64,
    pub captured_at: DateTime<Utc>,
}

/// Realized outcome of a settled position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Win,
    Loss,
    /// Stake returned, no P&L impact
    Push,
    /// Event did not occur or data unavailable; stake returned
    Void,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "WIN",
            Outcome::Loss => "LOSS",
            Outcome::Push => "PUSH",
            Outcome::Void => "VOID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WIN" => Some(Outcome::Win),
            "LOSS" => Some(Outcome::Loss),
            "PUSH" => Some(Outcome::Push),
            "VOID" => Some(Outcome::Void),
            _ => None,
        }
    }
}

/// Write-once settlement of a position. Re-grading an already-settled
/// position must be a no-op, not a re-payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: Option<i64>,
    pub position_id: i64,
    pub outcome: Outcome,
    /// Gross amount returned (stake included for WIN/PUSH/VOID)
    pub payout: f64,
    pub settled_at: DateTime<Utc>,
}

/// One append-only ledger row. Balance equals the previous balance plus
/// delta; entries are never reordered or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Option<i64>,
    pub run_date: NaiveDate,
    /// Net P&L of the settlement that produced this entry (payout − stake)
    pub delta: f64,
    /// Running balance after applying delta
    pub balance: f64,
    /// Settlement id / position key that produced this entry
    pub reference: String,
    pub recorded_at: DateTime<Utc>,
}
